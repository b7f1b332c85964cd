//! Core data models for the log latency probe

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// A running workload instance (pod) that is a probe target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadInstance {
    pub namespace: String,
    pub name: String,
    pub started_at: DateTime<Utc>,
}

impl WorkloadInstance {
    pub fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            started_at,
        }
    }

    /// Dedup key for this instance under the given policy
    pub fn key(&self, policy: KeyPolicy) -> InstanceKey {
        match policy {
            KeyPolicy::Name => InstanceKey(format!("{}/{}", self.namespace, self.name)),
            KeyPolicy::NameAndStart => InstanceKey(format!(
                "{}/{}@{}",
                self.namespace,
                self.name,
                self.started_at.timestamp_nanos_opt().unwrap_or_default()
            )),
        }
    }
}

/// Instance as reported by a workload lister, before filtering
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListedInstance {
    pub name: String,
    /// Absent while the pod is still being scheduled
    pub started_at: Option<DateTime<Utc>>,
}

/// Identity used for deduplication and resolution tracking
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceKey(String);

impl InstanceKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How instances are identified once resolved
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyPolicy {
    /// `namespace/name`: a pod restarted under the same name is never probed again
    #[default]
    Name,
    /// `namespace/name@startedAt`: every restart is probed as a new target
    NameAndStart,
}

/// Time from instance start until its logs were first queryable
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatencySample {
    pub namespace: String,
    pub name: String,
    #[serde(with = "duration_secs")]
    pub latency: Duration,
}

/// Summary statistics over all latency samples
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LatencySummary {
    /// No instance was resolved during the run
    NoData,
    Stats {
        count: usize,
        #[serde(with = "duration_secs")]
        min: Duration,
        #[serde(with = "duration_secs")]
        max: Duration,
        #[serde(with = "duration_secs")]
        mean: Duration,
    },
}

/// Why the engine stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// An external interrupt was received
    Interrupted,
    /// The pending queue was found empty for the configured number of cycles
    EmptyQueueThreshold,
}

/// Final result of an engine run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineReport {
    pub samples: Vec<LatencySample>,
    pub summary: LatencySummary,
    pub cycles: u64,
    pub stop_reason: StopReason,
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}
