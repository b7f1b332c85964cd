//! Discovery, dedup and probe engine
//!
//! The engine runs a single control loop:
//!
//! ```text
//! Discovering -> Draining -> { Discovering | Reporting }
//! ```
//!
//! Each cycle runs one discovery pass, claims everything pending, hands the
//! batch to the scheduler and waits for it to finish. Interrupts and the
//! configured stop condition are checked once the drain completes, so a stop
//! takes effect at most one cycle after it is requested.

use crate::dedup::DedupQueue;
use crate::discovery::{
    Discovery, DiscoveryFailurePolicy, PassSummary, WorkloadLister, DEFAULT_NAMESPACE_PREFIX,
};
use crate::error::EngineError;
use crate::health::{components, HealthRegistry};
use crate::models::{EngineReport, KeyPolicy, StopReason};
use crate::observability::{ProbeMetrics, StructuredLogger};
use crate::probe::{LogProbeClient, Prober, DEFAULT_PROBE_TIMEOUT};
use crate::scheduler::Concurrency;
use crate::stats::{summarize, StatsAggregator};
use crate::termination::{CycleSummary, TerminationPolicy};
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{
    self,
    error::{RecvError, TryRecvError},
};
use tracing::{debug, error, info, warn};

/// Engine configuration, fixed at startup
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Namespaces whose name starts with this prefix are probed
    pub namespace_prefix: String,
    /// Pause between cycles; zero runs cycles back to back
    pub discovery_interval: Duration,
    pub concurrency: Concurrency,
    pub termination: TerminationPolicy,
    /// Upper bound on a single log backend query
    pub probe_timeout: Duration,
    pub discovery_failure: DiscoveryFailurePolicy,
    pub key_policy: KeyPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            namespace_prefix: DEFAULT_NAMESPACE_PREFIX.to_string(),
            discovery_interval: Duration::from_secs(2),
            concurrency: Concurrency::default(),
            termination: TerminationPolicy::default(),
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            discovery_failure: DiscoveryFailurePolicy::default(),
            key_policy: KeyPolicy::default(),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), EngineError> {
        if let Concurrency::WorkerPool { workers, capacity } = self.concurrency {
            if workers == 0 {
                return Err(EngineError::Config("worker pool needs at least one worker".into()));
            }
            if capacity == 0 {
                return Err(EngineError::Config("worker pool capacity must be positive".into()));
            }
        }
        if let TerminationPolicy::EmptyQueueThreshold { threshold: 0 } = self.termination {
            return Err(EngineError::Config("empty queue threshold must be positive".into()));
        }
        if let DiscoveryFailurePolicy::Retry { max_attempts: 0, .. } = self.discovery_failure {
            return Err(EngineError::Config("discovery retry needs at least one attempt".into()));
        }
        if self.probe_timeout.is_zero() {
            return Err(EngineError::Config("probe timeout must be positive".into()));
        }
        Ok(())
    }
}

/// Latency probe engine; consumed by [`Engine::run`]
pub struct Engine {
    discovery: Discovery,
    queue: Arc<DedupQueue>,
    stats: Arc<StatsAggregator>,
    prober: Arc<Prober>,
    config: EngineConfig,
    health: HealthRegistry,
    logger: StructuredLogger,
    metrics: ProbeMetrics,
}

impl Engine {
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn queue(&self) -> Arc<DedupQueue> {
        self.queue.clone()
    }

    pub fn stats(&self) -> Arc<StatsAggregator> {
        self.stats.clone()
    }

    /// Run until the stop condition fires or `shutdown` delivers, then report
    ///
    /// A discovery failure that the failure policy does not absorb ends the
    /// run with an error after in-flight probes have finished.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) -> Result<EngineReport, EngineError> {
        let scheduler = self.config.concurrency.spawn(self.prober.clone());
        let mut stop = self.config.termination.into_condition();
        self.health.set_ready(true).await;

        info!(
            namespace_prefix = %self.discovery.namespace_prefix(),
            scheduler = scheduler.name(),
            interval_ms = self.config.discovery_interval.as_millis() as u64,
            termination = ?self.config.termination,
            "Starting probe engine"
        );

        let mut cycles = 0u64;
        let outcome = loop {
            let pass = match self.discover(&mut shutdown).await {
                Ok(Some(pass)) => pass,
                Ok(None) => break Ok(StopReason::Interrupted),
                Err(e) => break Err(e),
            };

            let batch = self.queue.dequeue_all().await;
            let drained = batch.len();
            self.metrics.set_pending_instances(drained);
            self.health.set_healthy(components::SCHEDULER).await;

            let drain = scheduler.drain(batch).await;
            self.metrics.set_pending_instances(0);
            cycles += 1;

            let cycle = CycleSummary {
                enqueued: pass.enqueued,
                drained,
                resolved: drain.resolved,
            };
            debug!(
                cycle = cycles,
                enqueued = cycle.enqueued,
                drained = cycle.drained,
                resolved = drain.resolved,
                no_logs = drain.no_logs,
                failed = drain.failed,
                "Cycle complete"
            );

            if interrupt_requested(&mut shutdown) {
                break Ok(StopReason::Interrupted);
            }
            if stop.should_stop(&cycle) {
                break Ok(StopReason::EmptyQueueThreshold);
            }
            if pause(&mut shutdown, self.config.discovery_interval).await {
                break Ok(StopReason::Interrupted);
            }
        };

        scheduler.shutdown().await;
        self.health.set_ready(false).await;

        let stop_reason = outcome?;
        let samples = self.stats.samples().await;
        let summary = summarize(&samples);
        self.logger.log_report(&summary, cycles, stop_reason);

        Ok(EngineReport {
            samples,
            summary,
            cycles,
            stop_reason,
        })
    }

    /// Run a discovery pass under the failure policy
    ///
    /// Returns `None` if an interrupt arrived while backing off.
    async fn discover(
        &self,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<Option<PassSummary>, EngineError> {
        let mut failures = 0u32;

        loop {
            match self.discovery.run_pass(&self.queue).await {
                Ok(pass) => {
                    self.metrics.inc_discovery_passes();
                    if failures > 0 {
                        info!(failures = failures, "Discovery recovered");
                    }
                    self.health.set_healthy(components::DISCOVERY).await;
                    return Ok(Some(pass));
                }
                Err(e) => {
                    failures += 1;
                    self.metrics.inc_discovery_errors();

                    let Some(backoff) = self.config.discovery_failure.backoff(failures) else {
                        error!(error = %e, failures = failures, "Discovery failed, stopping engine");
                        self.health
                            .set_unhealthy(components::DISCOVERY, e.to_string())
                            .await;
                        return Err(e.into());
                    };

                    warn!(
                        error = %e,
                        attempt = failures,
                        backoff_ms = backoff.as_millis() as u64,
                        "Discovery pass failed, retrying"
                    );
                    self.health
                        .set_degraded(components::DISCOVERY, e.to_string())
                        .await;
                    if pause(shutdown, backoff).await {
                        return Ok(None);
                    }
                }
            }
        }
    }
}

/// Non-blocking check for a pending interrupt
fn interrupt_requested(shutdown: &mut broadcast::Receiver<()>) -> bool {
    match shutdown.try_recv() {
        Ok(()) | Err(TryRecvError::Lagged(_)) => true,
        Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => false,
    }
}

/// Sleep for `duration`, returning early with true if interrupted
async fn pause(shutdown: &mut broadcast::Receiver<()>, duration: Duration) -> bool {
    if duration.is_zero() {
        tokio::task::yield_now().await;
        return false;
    }

    let sleep = tokio::time::sleep(duration);
    tokio::pin!(sleep);

    tokio::select! {
        _ = &mut sleep => false,
        res = shutdown.recv() => match res {
            Ok(()) | Err(RecvError::Lagged(_)) => true,
            Err(RecvError::Closed) => {
                (&mut sleep).await;
                false
            }
        },
    }
}

/// Builder for creating the engine
pub struct EngineBuilder {
    lister: Option<Arc<dyn WorkloadLister>>,
    probe_client: Option<Arc<dyn LogProbeClient>>,
    config: EngineConfig,
    health: HealthRegistry,
}

impl EngineBuilder {
    /// Create a new builder with default configuration
    pub fn new() -> Self {
        Self {
            lister: None,
            probe_client: None,
            config: EngineConfig::default(),
            health: HealthRegistry::new(),
        }
    }

    pub fn lister(mut self, lister: Arc<dyn WorkloadLister>) -> Self {
        self.lister = Some(lister);
        self
    }

    pub fn probe_client(mut self, client: Arc<dyn LogProbeClient>) -> Self {
        self.probe_client = Some(client);
        self
    }

    /// Replace the whole configuration
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn namespace_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.namespace_prefix = prefix.into();
        self
    }

    pub fn discovery_interval(mut self, interval: Duration) -> Self {
        self.config.discovery_interval = interval;
        self
    }

    pub fn concurrency(mut self, concurrency: Concurrency) -> Self {
        self.config.concurrency = concurrency;
        self
    }

    pub fn termination(mut self, termination: TerminationPolicy) -> Self {
        self.config.termination = termination;
        self
    }

    pub fn probe_timeout(mut self, timeout: Duration) -> Self {
        self.config.probe_timeout = timeout;
        self
    }

    pub fn discovery_failure(mut self, policy: DiscoveryFailurePolicy) -> Self {
        self.config.discovery_failure = policy;
        self
    }

    pub fn key_policy(mut self, policy: KeyPolicy) -> Self {
        self.config.key_policy = policy;
        self
    }

    /// Share a health registry with the HTTP API
    pub fn health(mut self, health: HealthRegistry) -> Self {
        self.health = health;
        self
    }

    pub fn build(self) -> Result<Engine> {
        let lister = self
            .lister
            .ok_or_else(|| anyhow::anyhow!("Workload lister is required"))?;
        let probe_client = self
            .probe_client
            .ok_or_else(|| anyhow::anyhow!("Log probe client is required"))?;
        self.config.validate()?;

        let logger = StructuredLogger::new(&self.config.namespace_prefix);
        let queue = Arc::new(DedupQueue::new(self.config.key_policy));
        let stats = Arc::new(StatsAggregator::new());
        let prober = Arc::new(Prober::new(
            probe_client,
            queue.clone(),
            stats.clone(),
            self.config.probe_timeout,
            self.health.clone(),
            logger.clone(),
        ));

        Ok(Engine {
            discovery: Discovery::new(lister, self.config.namespace_prefix.clone()),
            queue,
            stats,
            prober,
            config: self.config,
            health: self.health,
            logger,
            metrics: ProbeMetrics::new(),
        })
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::tests::MockLister;
    use crate::models::LatencySummary;
    use crate::probe::tests::{Answer, MockLogClient};
    use chrono::Utc;
    use std::collections::HashSet;
    use std::sync::atomic::Ordering;

    fn engine(
        lister: Arc<MockLister>,
        client: Arc<MockLogClient>,
        termination: TerminationPolicy,
    ) -> EngineBuilder {
        EngineBuilder::new()
            .lister(lister)
            .probe_client(client)
            .discovery_interval(Duration::ZERO)
            .termination(termination)
    }

    fn threshold(k: u32) -> TerminationPolicy {
        TerminationPolicy::EmptyQueueThreshold { threshold: k }
    }

    #[tokio::test]
    async fn test_end_to_end_first_log_latency() {
        let started = Utc::now() - chrono::Duration::seconds(5);
        let lister = Arc::new(
            MockLister::new()
                .with_pod("logger-ns-a", "job-1", Some(started))
                .with_pod("other-ns", "job-x", Some(started)),
        );
        let client = Arc::new(MockLogClient::new());
        client.script("job-1", &[Answer::Empty, Answer::Entries]);

        let (_tx, rx) = broadcast::channel(1);
        let report = engine(lister, client.clone(), threshold(3))
            .build()
            .unwrap()
            .run(rx)
            .await
            .unwrap();

        assert_eq!(report.samples.len(), 1);
        let sample = &report.samples[0];
        assert_eq!(sample.namespace, "logger-ns-a");
        assert_eq!(sample.name, "job-1");
        assert!(sample.latency >= Duration::from_secs(5));
        assert!(sample.latency < Duration::from_secs(7));

        // One empty probe, one successful probe, never probed again
        assert_eq!(client.calls_for("job-1"), 2);
        assert_eq!(client.calls_for("job-x"), 0);

        // Two busy cycles followed by three empty ones
        assert_eq!(report.cycles, 5);
        assert_eq!(report.stop_reason, StopReason::EmptyQueueThreshold);
        assert!(matches!(report.summary, LatencySummary::Stats { count: 1, .. }));
    }

    #[tokio::test]
    async fn test_threshold_stops_after_exactly_k_empty_cycles() {
        let lister = Arc::new(MockLister::new());
        let client = Arc::new(MockLogClient::new());

        let (_tx, rx) = broadcast::channel(1);
        let report = engine(lister.clone(), client, threshold(3))
            .build()
            .unwrap()
            .run(rx)
            .await
            .unwrap();

        assert_eq!(report.cycles, 3);
        assert_eq!(lister.namespace_calls.load(Ordering::SeqCst), 3);
        assert_eq!(report.summary, LatencySummary::NoData);
    }

    #[tokio::test]
    async fn test_unresolved_instance_keeps_threshold_from_firing() {
        let lister = Arc::new(
            MockLister::new().with_pod("logger-ns-a", "job-1", Some(Utc::now())),
        );
        let client = Arc::new(MockLogClient::new());
        client.script(
            "job-1",
            &[Answer::Empty, Answer::Error, Answer::Empty, Answer::Entries],
        );

        let (_tx, rx) = broadcast::channel(1);
        let report = engine(lister, client.clone(), threshold(2))
            .build()
            .unwrap()
            .run(rx)
            .await
            .unwrap();

        assert_eq!(client.calls_for("job-1"), 4);
        assert_eq!(report.samples.len(), 1);
        assert_eq!(report.cycles, 6);
    }

    #[tokio::test]
    async fn test_interrupt_stops_after_current_cycle() {
        let lister = Arc::new(
            MockLister::new().with_pod("logger-ns-a", "job-1", Some(Utc::now())),
        );
        let client = Arc::new(MockLogClient::new());

        let (tx, rx) = broadcast::channel(1);
        tx.send(()).unwrap();

        let report = engine(lister, client, TerminationPolicy::RunUntilSignal)
            .build()
            .unwrap()
            .run(rx)
            .await
            .unwrap();

        // The claimed batch still completes before reporting
        assert_eq!(report.cycles, 1);
        assert_eq!(report.samples.len(), 1);
        assert_eq!(report.stop_reason, StopReason::Interrupted);
    }

    #[tokio::test]
    async fn test_interrupt_during_pause() {
        let lister = Arc::new(MockLister::new());
        let client = Arc::new(MockLogClient::new());
        let engine = engine(lister, client, TerminationPolicy::RunUntilSignal)
            .discovery_interval(Duration::from_secs(3600))
            .build()
            .unwrap();

        let (tx, rx) = broadcast::channel(1);
        let handle = tokio::spawn(engine.run(rx));

        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(()).unwrap();

        let report = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("engine did not stop")
            .unwrap()
            .unwrap();
        assert_eq!(report.stop_reason, StopReason::Interrupted);
        assert_eq!(report.summary, LatencySummary::NoData);
    }

    #[tokio::test]
    async fn test_discovery_failure_aborts_by_default() {
        let lister = Arc::new(MockLister::new());
        lister.set_failing(true);
        let client = Arc::new(MockLogClient::new());
        let health = HealthRegistry::new();

        let (_tx, rx) = broadcast::channel(1);
        let result = engine(lister.clone(), client, threshold(3))
            .health(health.clone())
            .build()
            .unwrap()
            .run(rx)
            .await;

        assert!(matches!(result, Err(EngineError::Discovery(_))));
        assert_eq!(lister.namespace_calls.load(Ordering::SeqCst), 1);
        assert!(!health.health().await.status.is_operational());
    }

    #[tokio::test]
    async fn test_discovery_retry_gives_up_after_max_attempts() {
        let lister = Arc::new(MockLister::new());
        lister.set_failing(true);
        let client = Arc::new(MockLogClient::new());

        let (_tx, rx) = broadcast::channel(1);
        let result = engine(lister.clone(), client, threshold(3))
            .discovery_failure(DiscoveryFailurePolicy::Retry {
                max_attempts: 3,
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(2),
            })
            .build()
            .unwrap()
            .run(rx)
            .await;

        assert!(result.is_err());
        assert_eq!(lister.namespace_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_worker_pool_end_to_end() {
        let started = Utc::now() - chrono::Duration::seconds(2);
        let lister = Arc::new(MockLister::new());
        for i in 0..8 {
            lister.add_pod("logger-ns-a", &format!("job-{i}"), Some(started));
        }
        lister.add_pod("logger-ns-b", "job-b", Some(started));
        let client = Arc::new(MockLogClient::with_delay(Duration::from_millis(5)));
        client.script("job-3", &[Answer::Empty, Answer::Entries]);

        let (_tx, rx) = broadcast::channel(1);
        let report = engine(lister, client.clone(), threshold(2))
            .concurrency(Concurrency::pool(3))
            .build()
            .unwrap()
            .run(rx)
            .await
            .unwrap();

        let names: HashSet<_> = report.samples.iter().map(|s| s.name.clone()).collect();
        assert_eq!(report.samples.len(), 9);
        assert_eq!(names.len(), 9);
        assert!(names.contains("job-b"));
        assert_eq!(client.calls_for("job-3"), 2);
        assert_eq!(client.calls_for("job-0"), 1);
    }

    #[tokio::test]
    async fn test_builder_requires_collaborators() {
        let result = EngineBuilder::new()
            .probe_client(Arc::new(MockLogClient::new()))
            .build();
        assert!(result.is_err());

        let result = EngineBuilder::new().lister(Arc::new(MockLister::new())).build();
        assert!(result.is_err());
    }

    #[test]
    fn test_config_validation() {
        assert!(EngineConfig::default().validate().is_ok());

        let config = EngineConfig {
            concurrency: Concurrency::WorkerPool {
                workers: 0,
                capacity: 10,
            },
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(EngineError::Config(_))));

        let config = EngineConfig {
            termination: threshold(0),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn test_queue_is_empty_after_report() {
        let lister = Arc::new(
            MockLister::new().with_pod("logger-ns-a", "job-1", Some(Utc::now())),
        );
        let client = Arc::new(MockLogClient::new());
        let engine = engine(lister, client, threshold(1)).build().unwrap();
        let queue = engine.queue();

        let (_tx, rx) = broadcast::channel(1);
        engine.run(rx).await.unwrap();

        assert_eq!(queue.pending_len().await, 0);
        assert_eq!(queue.resolved_len().await, 1);
    }
}
