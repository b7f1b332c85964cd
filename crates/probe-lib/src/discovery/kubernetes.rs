//! Workload lister backed by the Kubernetes API

use super::WorkloadLister;
use crate::error::DiscoveryError;
use crate::models::ListedInstance;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Namespace, Pod};
use kube::api::{Api, ListParams};
use kube::Client;
use tracing::debug;

/// Lists namespaces and pods through a `kube` client
#[derive(Clone)]
pub struct KubeLister {
    client: Client,
}

impl KubeLister {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl WorkloadLister for KubeLister {
    async fn list_namespaces(&self) -> Result<Vec<String>, DiscoveryError> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let list = api
            .list(&ListParams::default())
            .await
            .map_err(|e| DiscoveryError::Namespaces(e.to_string()))?;

        let names: Vec<String> = list
            .items
            .into_iter()
            .filter_map(|ns| ns.metadata.name)
            .collect();

        debug!(count = names.len(), "Listed namespaces");
        Ok(names)
    }

    async fn list_instances(
        &self,
        namespace: &str,
    ) -> Result<Vec<ListedInstance>, DiscoveryError> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let list = api
            .list(&ListParams::default())
            .await
            .map_err(|e| DiscoveryError::Instances {
                namespace: namespace.to_string(),
                reason: e.to_string(),
            })?;

        Ok(list.items.into_iter().filter_map(listed_instance).collect())
    }
}

/// Pods without a name are dropped; pods without a start time are kept with `None`
fn listed_instance(pod: Pod) -> Option<ListedInstance> {
    let name = pod.metadata.name?;
    let started_at = pod.status.and_then(|s| s.start_time).map(|t| t.0);
    Some(ListedInstance { name, started_at })
}
