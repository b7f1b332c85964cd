//! Loki `query_range` client

use super::{LogProbeClient, LogQuery};
use crate::error::ProbeError;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use url::Url;

/// Stream label that carries the pod name
pub const DEFAULT_POD_LABEL: &str = "pod_name";

/// Header carrying the tenant for multi-tenant Loki
const TENANT_HEADER: &str = "X-Scope-OrgID";

const QUERY_RANGE_PATH: &str = "loki/api/v1/query_range";

/// Configuration for the Loki client
#[derive(Debug, Clone)]
pub struct LokiConfig {
    /// Base URL of the Loki query frontend (e.g., "http://loki:3100")
    pub address: String,
    /// Stream label matched against the pod name
    pub pod_label: String,
    /// Request timeout
    pub request_timeout: Duration,
}

impl Default for LokiConfig {
    fn default() -> Self {
        Self {
            address: "http://localhost:3100".to_string(),
            pod_label: DEFAULT_POD_LABEL.to_string(),
            request_timeout: super::DEFAULT_PROBE_TIMEOUT,
        }
    }
}

#[derive(Debug, Deserialize)]
struct QueryRangeResponse {
    status: String,
    data: QueryRangeData,
}

#[derive(Debug, Deserialize)]
struct QueryRangeData {
    #[serde(rename = "resultType", default)]
    result_type: String,
    #[serde(default)]
    result: Vec<serde_json::Value>,
}

/// Probes Loki for log entries of a pod
pub struct LokiClient {
    client: Client,
    endpoint: Url,
    pod_label: String,
    request_timeout: Duration,
}

impl LokiClient {
    pub fn new(config: LokiConfig) -> Result<Self, ProbeError> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ProbeError::Transport(format!("Failed to create HTTP client: {e}")))?;

        let mut base = Url::parse(&config.address).map_err(|e| {
            ProbeError::Transport(format!("Invalid Loki address {}: {e}", config.address))
        })?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let endpoint = base
            .join(QUERY_RANGE_PATH)
            .map_err(|e| ProbeError::Transport(format!("Invalid Loki address: {e}")))?;

        Ok(Self {
            client,
            endpoint,
            pod_label: config.pod_label,
            request_timeout: config.request_timeout,
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// LogQL stream selector for a pod
    fn selector(&self, instance_name: &str) -> String {
        format!(r#"{{{}="{}"}}"#, self.pod_label, instance_name)
    }
}

fn unix_nanos(t: chrono::DateTime<chrono::Utc>) -> String {
    t.timestamp_nanos_opt().unwrap_or_default().to_string()
}

#[async_trait]
impl LogProbeClient for LokiClient {
    async fn query_logs(&self, query: &LogQuery) -> Result<bool, ProbeError> {
        let response = self
            .client
            .get(self.endpoint.clone())
            .query(&[
                ("query", self.selector(&query.instance_name)),
                ("start", unix_nanos(query.window_start)),
                ("end", unix_nanos(query.window_end)),
            ])
            .header(TENANT_HEADER, query.tenant.as_str())
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProbeError::Timeout(self.request_timeout)
                } else {
                    ProbeError::Transport(e.to_string())
                }
            })?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ProbeError::Status { status, body });
        }

        let body: QueryRangeResponse = response
            .json()
            .await
            .map_err(|e| ProbeError::Decode(e.to_string()))?;

        if body.status != "success" {
            return Err(ProbeError::Decode(format!(
                "unexpected query status {:?} ({})",
                body.status, body.data.result_type
            )));
        }

        Ok(!body.data.result.is_empty())
    }
}
