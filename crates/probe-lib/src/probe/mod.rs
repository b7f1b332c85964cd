//! Log backend probing
//!
//! A probe asks the log backend whether any entries exist for an instance
//! between its start time and now. The first successful probe resolves the
//! instance and produces its latency sample; anything else leaves it
//! unresolved for the next discovery pass to pick up again.

mod loki;

pub use loki::{LokiClient, LokiConfig, DEFAULT_POD_LABEL};

use crate::dedup::DedupQueue;
use crate::error::ProbeError;
use crate::health::{components, HealthRegistry};
use crate::models::{LatencySample, WorkloadInstance};
use crate::observability::{ProbeMetrics, StructuredLogger};
use crate::stats::StatsAggregator;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Default bound on a single log backend query
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(30);

/// A log query for one instance over a time window
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogQuery {
    /// Tenant scope, taken from the instance namespace
    pub tenant: String,
    pub instance_name: String,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
}

impl LogQuery {
    /// Query window from the instance start until `now`
    pub fn for_instance(instance: &WorkloadInstance, now: DateTime<Utc>) -> Self {
        Self {
            tenant: instance.namespace.clone(),
            instance_name: instance.name.clone(),
            window_start: instance.started_at,
            window_end: now,
        }
    }
}

/// Client for a log backend that can answer "are there entries yet?"
#[async_trait]
pub trait LogProbeClient: Send + Sync {
    /// Returns true if at least one log entry matches the query window
    async fn query_logs(&self, query: &LogQuery) -> Result<bool, ProbeError>;
}

/// Result of probing a single instance
#[derive(Debug)]
pub enum ProbeOutcome {
    /// Logs are queryable; the instance is now resolved
    Resolved(LatencySample),
    /// Backend reachable but no entries yet
    NoLogsYet,
    /// Query failed; the instance stays unresolved
    Failed(ProbeError),
    /// Another probe resolved the instance first
    AlreadyResolved,
}

impl ProbeOutcome {
    pub fn is_resolved(&self) -> bool {
        matches!(self, ProbeOutcome::Resolved(_))
    }
}

/// Probes one instance and records the result
///
/// Shared by every scheduler so sequential and pooled modes resolve and
/// count instances identically.
pub struct Prober {
    client: Arc<dyn LogProbeClient>,
    queue: Arc<DedupQueue>,
    stats: Arc<StatsAggregator>,
    timeout: Duration,
    health: HealthRegistry,
    logger: StructuredLogger,
    metrics: ProbeMetrics,
}

impl Prober {
    pub fn new(
        client: Arc<dyn LogProbeClient>,
        queue: Arc<DedupQueue>,
        stats: Arc<StatsAggregator>,
        timeout: Duration,
        health: HealthRegistry,
        logger: StructuredLogger,
    ) -> Self {
        Self {
            client,
            queue,
            stats,
            timeout,
            health,
            logger,
            metrics: ProbeMetrics::new(),
        }
    }

    pub async fn probe(&self, instance: &WorkloadInstance) -> ProbeOutcome {
        if self.queue.is_resolved(instance).await {
            return ProbeOutcome::AlreadyResolved;
        }

        let query = LogQuery::for_instance(instance, Utc::now());
        self.metrics.inc_probes();

        let started = Instant::now();
        let result = match tokio::time::timeout(self.timeout, self.client.query_logs(&query)).await
        {
            Ok(result) => result,
            Err(_) => Err(ProbeError::Timeout(self.timeout)),
        };
        self.metrics
            .observe_query_duration(started.elapsed().as_secs_f64());

        match result {
            Ok(true) => {
                self.health.set_healthy(components::LOG_BACKEND).await;
                self.resolve(instance).await
            }
            Ok(false) => {
                self.health.set_healthy(components::LOG_BACKEND).await;
                debug!(
                    namespace = %instance.namespace,
                    pod_name = %instance.name,
                    "No logs yet"
                );
                ProbeOutcome::NoLogsYet
            }
            Err(e) => {
                self.metrics.inc_probe_errors();
                warn!(
                    namespace = %instance.namespace,
                    pod_name = %instance.name,
                    backend_responded = e.is_backend_response(),
                    error = %e,
                    "Error getting logs for pod"
                );
                self.health
                    .set_degraded(components::LOG_BACKEND, e.to_string())
                    .await;
                ProbeOutcome::Failed(e)
            }
        }
    }

    async fn resolve(&self, instance: &WorkloadInstance) -> ProbeOutcome {
        if !self.queue.mark_resolved(instance).await {
            return ProbeOutcome::AlreadyResolved;
        }

        // Clock skew between the node and the API server can put the start in the future
        let latency = (Utc::now() - instance.started_at)
            .to_std()
            .unwrap_or(Duration::ZERO);

        let sample = LatencySample {
            namespace: instance.namespace.clone(),
            name: instance.name.clone(),
            latency,
        };

        self.stats.record(sample.clone()).await;
        self.metrics.observe_resolved(latency.as_secs_f64());
        self.logger.log_first_log(&sample);

        ProbeOutcome::Resolved(sample)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Scripted log backend: each instance answers from its script, then repeats the last answer
    #[derive(Default)]
    pub(crate) struct MockLogClient {
        scripts: Mutex<HashMap<String, Vec<Answer>>>,
        pub(crate) calls: AtomicUsize,
        pub(crate) queries: Mutex<Vec<LogQuery>>,
        delay: Option<Duration>,
    }

    #[derive(Clone, Copy)]
    pub(crate) enum Answer {
        Empty,
        Entries,
        Error,
    }

    impl MockLogClient {
        pub(crate) fn new() -> Self {
            Self::default()
        }

        pub(crate) fn with_delay(delay: Duration) -> Self {
            Self {
                delay: Some(delay),
                ..Self::default()
            }
        }

        pub(crate) fn script(&self, name: &str, answers: &[Answer]) {
            self.scripts
                .lock()
                .unwrap()
                .insert(name.to_string(), answers.to_vec());
        }

        pub(crate) fn calls_for(&self, name: &str) -> usize {
            self.queries
                .lock()
                .unwrap()
                .iter()
                .filter(|q| q.instance_name == name)
                .count()
        }
    }

    #[async_trait]
    impl LogProbeClient for MockLogClient {
        async fn query_logs(&self, query: &LogQuery) -> Result<bool, ProbeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.queries.lock().unwrap().push(query.clone());

            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }

            let answer = {
                let mut scripts = self.scripts.lock().unwrap();
                match scripts.get_mut(&query.instance_name) {
                    Some(script) if script.len() > 1 => script.remove(0),
                    Some(script) => script.first().copied().unwrap_or(Answer::Empty),
                    None => Answer::Entries,
                }
            };

            match answer {
                Answer::Empty => Ok(false),
                Answer::Entries => Ok(true),
                Answer::Error => Err(ProbeError::Status {
                    status: 502,
                    body: "bad gateway".into(),
                }),
            }
        }
    }

    fn prober(client: Arc<MockLogClient>, timeout: Duration) -> (Prober, Arc<DedupQueue>, Arc<StatsAggregator>) {
        let queue = Arc::new(DedupQueue::default());
        let stats = Arc::new(StatsAggregator::new());
        let prober = Prober::new(
            client,
            queue.clone(),
            stats.clone(),
            timeout,
            HealthRegistry::new(),
            StructuredLogger::new("logger-ns"),
        );
        (prober, queue, stats)
    }

    fn started_secs_ago(name: &str, secs: i64) -> WorkloadInstance {
        WorkloadInstance::new(
            "logger-ns-a",
            name,
            Utc::now() - chrono::Duration::seconds(secs),
        )
    }

    #[tokio::test]
    async fn test_query_window_and_tenant() {
        let client = Arc::new(MockLogClient::new());
        let (prober, _, _) = prober(client.clone(), DEFAULT_PROBE_TIMEOUT);
        let job = started_secs_ago("job-1", 5);

        prober.probe(&job).await;

        let queries = client.queries.lock().unwrap();
        assert_eq!(queries.len(), 1);
        assert_eq!(queries[0].tenant, "logger-ns-a");
        assert_eq!(queries[0].instance_name, "job-1");
        assert_eq!(queries[0].window_start, job.started_at);
        assert!(queries[0].window_end > job.started_at);
    }

    #[tokio::test]
    async fn test_successful_probe_resolves_and_records() {
        let client = Arc::new(MockLogClient::new());
        let (prober, queue, stats) = prober(client, DEFAULT_PROBE_TIMEOUT);
        let job = started_secs_ago("job-1", 5);

        let outcome = prober.probe(&job).await;

        let ProbeOutcome::Resolved(sample) = outcome else {
            panic!("expected resolved outcome");
        };
        assert!(sample.latency >= Duration::from_secs(5));
        assert!(sample.latency < Duration::from_secs(7));
        assert!(queue.is_resolved(&job).await);
        assert_eq!(stats.len().await, 1);
    }

    #[tokio::test]
    async fn test_empty_result_leaves_instance_unresolved() {
        let client = Arc::new(MockLogClient::new());
        client.script("job-1", &[Answer::Empty]);
        let (prober, queue, stats) = prober(client, DEFAULT_PROBE_TIMEOUT);
        let job = started_secs_ago("job-1", 1);

        assert!(matches!(prober.probe(&job).await, ProbeOutcome::NoLogsYet));
        assert!(!queue.is_resolved(&job).await);
        assert!(stats.is_empty().await);
        assert_eq!(queue.pending_len().await, 0);
    }

    #[tokio::test]
    async fn test_backend_error_is_recovered_locally() {
        let client = Arc::new(MockLogClient::new());
        client.script("job-1", &[Answer::Error]);
        let (prober, queue, _) = prober(client, DEFAULT_PROBE_TIMEOUT);
        let job = started_secs_ago("job-1", 1);

        let outcome = prober.probe(&job).await;
        assert!(matches!(
            outcome,
            ProbeOutcome::Failed(ProbeError::Status { status: 502, .. })
        ));
        assert!(!queue.is_resolved(&job).await);
    }

    #[tokio::test]
    async fn test_stalled_backend_times_out() {
        let client = Arc::new(MockLogClient::with_delay(Duration::from_secs(5)));
        let (prober, queue, _) = prober(client, Duration::from_millis(50));
        let job = started_secs_ago("job-1", 1);

        let outcome = prober.probe(&job).await;
        assert!(matches!(outcome, ProbeOutcome::Failed(ProbeError::Timeout(_))));
        assert!(!queue.is_resolved(&job).await);
    }

    #[tokio::test]
    async fn test_resolved_instance_is_not_probed_again() {
        let client = Arc::new(MockLogClient::new());
        let (prober, _, stats) = prober(client.clone(), DEFAULT_PROBE_TIMEOUT);
        let job = started_secs_ago("job-1", 2);

        assert!(prober.probe(&job).await.is_resolved());
        assert!(matches!(prober.probe(&job).await, ProbeOutcome::AlreadyResolved));

        assert_eq!(client.calls.load(Ordering::SeqCst), 1);
        assert_eq!(stats.len().await, 1);
    }

    #[tokio::test]
    async fn test_future_start_time_clamps_to_zero() {
        let client = Arc::new(MockLogClient::new());
        let (prober, _, _) = prober(client, DEFAULT_PROBE_TIMEOUT);
        let job = WorkloadInstance::new(
            "logger-ns-a",
            "job-1",
            Utc::now() + chrono::Duration::seconds(30),
        );

        let ProbeOutcome::Resolved(sample) = prober.probe(&job).await else {
            panic!("expected resolved outcome");
        };
        assert_eq!(sample.latency, Duration::ZERO);
    }
}
