//! Observability infrastructure for the log latency probe
//!
//! Provides:
//! - Prometheus metrics (discovery passes, probe counts, first-log latency)
//! - Structured JSON logging of probe lifecycle events with tracing

use crate::models::{LatencySample, LatencySummary, StopReason};
use prometheus::{
    register_histogram, register_int_counter, register_int_gauge, Histogram, IntCounter, IntGauge,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Buckets for start-to-first-log latency (in seconds)
const FIRST_LOG_BUCKETS: &[f64] = &[
    0.5, 1.0, 2.0, 5.0, 10.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0,
];

/// Buckets for a single log backend round trip (in seconds)
const QUERY_BUCKETS: &[f64] = &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<ProbeMetricsInner> = OnceLock::new();

struct ProbeMetricsInner {
    discovery_passes: IntCounter,
    discovery_errors: IntCounter,
    probes: IntCounter,
    probe_errors: IntCounter,
    instances_resolved: IntCounter,
    pending_instances: IntGauge,
    first_log_latency_seconds: Histogram,
    query_duration_seconds: Histogram,
}

impl ProbeMetricsInner {
    fn new() -> Self {
        Self {
            discovery_passes: register_int_counter!(
                "log_probe_discovery_passes_total",
                "Number of completed discovery passes"
            )
            .expect("Failed to register discovery_passes"),

            discovery_errors: register_int_counter!(
                "log_probe_discovery_errors_total",
                "Number of discovery passes that failed to list namespaces or pods"
            )
            .expect("Failed to register discovery_errors"),

            probes: register_int_counter!(
                "log_probe_probes_total",
                "Number of log backend probes issued"
            )
            .expect("Failed to register probes"),

            probe_errors: register_int_counter!(
                "log_probe_probe_errors_total",
                "Number of log backend probes that failed"
            )
            .expect("Failed to register probe_errors"),

            instances_resolved: register_int_counter!(
                "log_probe_instances_resolved_total",
                "Number of pods whose logs became queryable"
            )
            .expect("Failed to register instances_resolved"),

            pending_instances: register_int_gauge!(
                "log_probe_pending_instances",
                "Pods claimed by the current drain"
            )
            .expect("Failed to register pending_instances"),

            first_log_latency_seconds: register_histogram!(
                "log_probe_first_log_latency_seconds",
                "Time from pod start until its logs were first queryable",
                FIRST_LOG_BUCKETS.to_vec()
            )
            .expect("Failed to register first_log_latency_seconds"),

            query_duration_seconds: register_histogram!(
                "log_probe_query_duration_seconds",
                "Round trip time of a single log backend query",
                QUERY_BUCKETS.to_vec()
            )
            .expect("Failed to register query_duration_seconds"),
        }
    }
}

/// Probe metrics for Prometheus exposition
///
/// This is a lightweight handle to the global metrics instance.
/// Multiple clones share the same underlying metrics.
#[derive(Clone)]
pub struct ProbeMetrics {
    _private: (),
}

impl Default for ProbeMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ProbeMetrics {
    /// Create a new metrics handle (initializes global metrics if needed)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(ProbeMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &ProbeMetricsInner {
        GLOBAL_METRICS.get_or_init(ProbeMetricsInner::new)
    }

    pub fn inc_discovery_passes(&self) {
        self.inner().discovery_passes.inc();
    }

    pub fn inc_discovery_errors(&self) {
        self.inner().discovery_errors.inc();
    }

    pub fn inc_probes(&self) {
        self.inner().probes.inc();
    }

    pub fn inc_probe_errors(&self) {
        self.inner().probe_errors.inc();
    }

    pub fn set_pending_instances(&self, count: usize) {
        self.inner().pending_instances.set(count as i64);
    }

    /// Record a resolved instance and its first-log latency
    pub fn observe_resolved(&self, latency_secs: f64) {
        self.inner().instances_resolved.inc();
        self.inner().first_log_latency_seconds.observe(latency_secs);
    }

    pub fn observe_query_duration(&self, duration_secs: f64) {
        self.inner().query_duration_seconds.observe(duration_secs);
    }
}

/// Structured logger for probe lifecycle events
#[derive(Clone)]
pub struct StructuredLogger {
    namespace_prefix: String,
}

impl StructuredLogger {
    pub fn new(namespace_prefix: impl Into<String>) -> Self {
        Self {
            namespace_prefix: namespace_prefix.into(),
        }
    }

    /// Log probe startup
    pub fn log_startup(&self, version: &str, backend: &str, scheduler: &str) {
        info!(
            event = "probe_started",
            namespace_prefix = %self.namespace_prefix,
            version = %version,
            backend = %backend,
            scheduler = %scheduler,
            "Log latency probe started"
        );
    }

    /// Log the first time an instance's logs were observed
    pub fn log_first_log(&self, sample: &LatencySample) {
        info!(
            event = "first_log_observed",
            namespace = %sample.namespace,
            pod_name = %sample.name,
            latency_secs = sample.latency.as_secs_f64(),
            "First log line observed"
        );
    }

    /// Log the final latency summary
    pub fn log_report(&self, summary: &LatencySummary, cycles: u64, stop_reason: StopReason) {
        match summary {
            LatencySummary::NoData => {
                warn!(
                    event = "latency_report",
                    namespace_prefix = %self.namespace_prefix,
                    cycles = cycles,
                    stop_reason = ?stop_reason,
                    "No logged pods found"
                );
            }
            LatencySummary::Stats {
                count,
                min,
                max,
                mean,
            } => {
                info!(
                    event = "latency_report",
                    namespace_prefix = %self.namespace_prefix,
                    cycles = cycles,
                    stop_reason = ?stop_reason,
                    count = count,
                    min_secs = min.as_secs_f64(),
                    max_secs = max.as_secs_f64(),
                    mean_secs = mean.as_secs_f64(),
                    "Latency report"
                );
            }
        }
    }

    /// Log probe shutdown
    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "probe_shutdown",
            namespace_prefix = %self.namespace_prefix,
            reason = %reason,
            "Log latency probe shutting down"
        );
    }
}
