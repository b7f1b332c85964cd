//! Workload discovery
//!
//! A discovery pass lists every namespace, keeps those whose name starts
//! with the configured prefix, lists the pods in each and enqueues every
//! pod that has a start time. Passes are driven periodically by the engine.

mod kubernetes;

pub use kubernetes::KubeLister;

use crate::dedup::DedupQueue;
use crate::error::DiscoveryError;
use crate::models::{ListedInstance, WorkloadInstance};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Default namespace prefix for probe targets
pub const DEFAULT_NAMESPACE_PREFIX: &str = "logger-ns";

/// Source of namespaces and running instances
#[async_trait]
pub trait WorkloadLister: Send + Sync {
    /// List the names of all namespaces in the cluster
    async fn list_namespaces(&self) -> Result<Vec<String>, DiscoveryError>;

    /// List instances in a namespace
    async fn list_instances(&self, namespace: &str)
        -> Result<Vec<ListedInstance>, DiscoveryError>;
}

/// Literal prefix match on a namespace name
pub fn matches_prefix(namespace: &str, prefix: &str) -> bool {
    namespace.starts_with(prefix)
}

/// What to do when a discovery pass fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum DiscoveryFailurePolicy {
    /// Stop the engine on the first failed pass
    Abort,
    /// Retry failed passes with doubling backoff, stopping after `max_attempts` in a row
    Retry {
        max_attempts: u32,
        initial_backoff: Duration,
        max_backoff: Duration,
    },
}

impl Default for DiscoveryFailurePolicy {
    fn default() -> Self {
        Self::Abort
    }
}

impl DiscoveryFailurePolicy {
    /// Retry policy with a 1 second initial and 60 second maximum backoff
    pub fn retry(max_attempts: u32) -> Self {
        Self::Retry {
            max_attempts,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
        }
    }

    /// Backoff before the next attempt, or `None` if the engine should give up
    ///
    /// `failures` counts consecutive failed passes including the current one.
    pub fn backoff(&self, failures: u32) -> Option<Duration> {
        match *self {
            Self::Abort => None,
            Self::Retry {
                max_attempts,
                initial_backoff,
                max_backoff,
            } => {
                if failures >= max_attempts {
                    return None;
                }
                let exp = failures.saturating_sub(1).min(16);
                Some(initial_backoff.saturating_mul(2u32.pow(exp)).min(max_backoff))
            }
        }
    }
}

/// Counts from a single discovery pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassSummary {
    pub namespaces_matched: usize,
    pub instances_seen: usize,
    pub enqueued: usize,
}

/// Runs discovery passes against a workload lister
pub struct Discovery {
    lister: Arc<dyn WorkloadLister>,
    namespace_prefix: String,
}

impl Discovery {
    pub fn new(lister: Arc<dyn WorkloadLister>, namespace_prefix: impl Into<String>) -> Self {
        Self {
            lister,
            namespace_prefix: namespace_prefix.into(),
        }
    }

    pub fn namespace_prefix(&self) -> &str {
        &self.namespace_prefix
    }

    /// Perform one full discovery pass, enqueueing unseen instances
    ///
    /// Any listing failure aborts the pass; instances enqueued before the
    /// failure stay queued.
    pub async fn run_pass(&self, queue: &DedupQueue) -> Result<PassSummary, DiscoveryError> {
        let mut summary = PassSummary::default();
        let namespaces = self.lister.list_namespaces().await?;

        for namespace in namespaces
            .iter()
            .filter(|ns| matches_prefix(ns, &self.namespace_prefix))
        {
            summary.namespaces_matched += 1;

            for listed in self.lister.list_instances(namespace).await? {
                summary.instances_seen += 1;

                let Some(started_at) = listed.started_at else {
                    debug!(namespace = %namespace, pod = %listed.name, "Skipping pod without start time");
                    continue;
                };

                let instance = WorkloadInstance::new(namespace.as_str(), listed.name, started_at);
                if queue.enqueue(instance).await {
                    summary.enqueued += 1;
                }
            }
        }

        if summary.enqueued > 0 {
            info!(
                namespaces = summary.namespaces_matched,
                pods = summary.instances_seen,
                enqueued = summary.enqueued,
                "Discovered new pods"
            );
        }

        Ok(summary)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// In-memory lister for tests
    #[derive(Default)]
    pub(crate) struct MockLister {
        namespaces: Mutex<Vec<String>>,
        pods: Mutex<HashMap<String, Vec<ListedInstance>>>,
        fail_namespaces: Mutex<bool>,
        pub(crate) namespace_calls: AtomicUsize,
    }

    impl MockLister {
        pub(crate) fn new() -> Self {
            Self::default()
        }

        pub(crate) fn with_pod(
            self,
            namespace: &str,
            name: &str,
            started_at: Option<DateTime<Utc>>,
        ) -> Self {
            self.add_pod(namespace, name, started_at);
            self
        }

        pub(crate) fn add_pod(&self, namespace: &str, name: &str, started_at: Option<DateTime<Utc>>) {
            let mut namespaces = self.namespaces.lock().unwrap();
            if !namespaces.iter().any(|ns| ns == namespace) {
                namespaces.push(namespace.to_string());
            }
            self.pods
                .lock()
                .unwrap()
                .entry(namespace.to_string())
                .or_default()
                .push(ListedInstance {
                    name: name.to_string(),
                    started_at,
                });
        }

        pub(crate) fn set_failing(&self, failing: bool) {
            *self.fail_namespaces.lock().unwrap() = failing;
        }
    }

    #[async_trait]
    impl WorkloadLister for MockLister {
        async fn list_namespaces(&self) -> Result<Vec<String>, DiscoveryError> {
            self.namespace_calls.fetch_add(1, Ordering::SeqCst);
            if *self.fail_namespaces.lock().unwrap() {
                return Err(DiscoveryError::Namespaces("connection refused".into()));
            }
            Ok(self.namespaces.lock().unwrap().clone())
        }

        async fn list_instances(
            &self,
            namespace: &str,
        ) -> Result<Vec<ListedInstance>, DiscoveryError> {
            Ok(self
                .pods
                .lock()
                .unwrap()
                .get(namespace)
                .cloned()
                .unwrap_or_default())
        }
    }

    #[test]
    fn test_matches_prefix() {
        assert!(matches_prefix("logger-ns-a", "logger-ns"));
        assert!(matches_prefix("logger-ns", "logger-ns"));
        assert!(!matches_prefix("other-ns", "logger-ns"));
        assert!(!matches_prefix("logger", "logger-ns"));
        assert!(!matches_prefix("a-logger-ns", "logger-ns"));
    }

    #[tokio::test]
    async fn test_pass_filters_namespaces_by_prefix() {
        let now = Utc::now();
        let lister = Arc::new(
            MockLister::new()
                .with_pod("logger-ns-a", "job-1", Some(now))
                .with_pod("other-ns", "job-2", Some(now))
                .with_pod("other-ns", "job-3", Some(now)),
        );
        let discovery = Discovery::new(lister, DEFAULT_NAMESPACE_PREFIX);
        let queue = DedupQueue::default();

        let summary = discovery.run_pass(&queue).await.unwrap();

        assert_eq!(summary.namespaces_matched, 1);
        assert_eq!(summary.enqueued, 1);
        let pending = queue.dequeue_all().await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].namespace, "logger-ns-a");
    }

    #[tokio::test]
    async fn test_pass_skips_pods_without_start_time() {
        let lister = Arc::new(
            MockLister::new()
                .with_pod("logger-ns-a", "pending-pod", None)
                .with_pod("logger-ns-a", "job-1", Some(Utc::now())),
        );
        let discovery = Discovery::new(lister, "logger-ns");
        let queue = DedupQueue::default();

        let summary = discovery.run_pass(&queue).await.unwrap();

        assert_eq!(summary.instances_seen, 2);
        assert_eq!(summary.enqueued, 1);
    }

    #[tokio::test]
    async fn test_repeated_passes_do_not_duplicate() {
        let lister = Arc::new(MockLister::new().with_pod("logger-ns-a", "job-1", Some(Utc::now())));
        let discovery = Discovery::new(lister, "logger-ns");
        let queue = DedupQueue::default();

        discovery.run_pass(&queue).await.unwrap();
        let second = discovery.run_pass(&queue).await.unwrap();

        assert_eq!(second.enqueued, 0);
        assert_eq!(queue.pending_len().await, 1);
    }

    #[tokio::test]
    async fn test_pass_enqueues_in_listing_order() {
        let now = Utc::now();
        let lister = Arc::new(
            MockLister::new()
                .with_pod("logger-ns-a", "job-1", Some(now))
                .with_pod("logger-ns-a", "job-2", Some(now))
                .with_pod("logger-ns-b", "job-3", Some(now)),
        );
        let discovery = Discovery::new(lister, "logger-ns");
        let queue = DedupQueue::default();

        discovery.run_pass(&queue).await.unwrap();

        let names: Vec<_> = queue.dequeue_all().await.into_iter().map(|i| i.name).collect();
        assert_eq!(names, vec!["job-1", "job-2", "job-3"]);
    }

    #[tokio::test]
    async fn test_pass_propagates_listing_failure() {
        let lister = Arc::new(MockLister::new());
        lister.set_failing(true);
        let discovery = Discovery::new(lister, "logger-ns");

        let result = discovery.run_pass(&DedupQueue::default()).await;
        assert!(matches!(result, Err(DiscoveryError::Namespaces(_))));
    }

    #[test]
    fn test_failure_policy_backoff() {
        assert_eq!(DiscoveryFailurePolicy::Abort.backoff(1), None);

        let policy = DiscoveryFailurePolicy::Retry {
            max_attempts: 4,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(3),
        };
        assert_eq!(policy.backoff(1), Some(Duration::from_secs(1)));
        assert_eq!(policy.backoff(2), Some(Duration::from_secs(2)));
        assert_eq!(policy.backoff(3), Some(Duration::from_secs(3)));
        assert_eq!(policy.backoff(4), None);
    }
}
