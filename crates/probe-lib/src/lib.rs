//! Log latency probe library
//!
//! This crate provides the core functionality for:
//! - Discovering pods in namespaces that match a prefix
//! - Deduplicating and queueing pods until their logs are found
//! - Probing the log backend sequentially or through a worker pool
//! - Aggregating start-to-first-log latency into a report
//! - Health checks and observability

pub mod api;
pub mod dedup;
pub mod discovery;
pub mod engine;
pub mod error;
pub mod health;
pub mod models;
pub mod observability;
pub mod probe;
pub mod scheduler;
pub mod stats;
pub mod termination;

pub use dedup::DedupQueue;
pub use discovery::{Discovery, DiscoveryFailurePolicy, KubeLister, WorkloadLister};
pub use engine::{Engine, EngineBuilder, EngineConfig};
pub use error::{DiscoveryError, EngineError, ProbeError};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{ProbeMetrics, StructuredLogger};
pub use probe::{LogProbeClient, LokiClient, LokiConfig, Prober};
pub use scheduler::{Concurrency, Scheduler};
pub use termination::TerminationPolicy;
