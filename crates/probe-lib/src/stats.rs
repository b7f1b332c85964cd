//! Latency sample aggregation

use crate::models::{LatencySample, LatencySummary};
use std::time::Duration;
use tokio::sync::Mutex;

/// Accumulates latency samples in arrival order for the life of the process
#[derive(Debug, Default)]
pub struct StatsAggregator {
    samples: Mutex<Vec<LatencySample>>,
}

impl StatsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record(&self, sample: LatencySample) {
        self.samples.lock().await.push(sample);
    }

    /// Snapshot of every sample recorded so far
    pub async fn samples(&self) -> Vec<LatencySample> {
        self.samples.lock().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.samples.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.samples.lock().await.is_empty()
    }

    pub async fn summary(&self) -> LatencySummary {
        summarize(&self.samples.lock().await)
    }
}

/// Compute min, max and mean latency over a set of samples
pub fn summarize(samples: &[LatencySample]) -> LatencySummary {
    let Some(first) = samples.first() else {
        return LatencySummary::NoData;
    };

    let mut min = first.latency;
    let mut max = first.latency;
    let mut total_nanos: u128 = 0;

    for sample in samples {
        min = min.min(sample.latency);
        max = max.max(sample.latency);
        total_nanos += sample.latency.as_nanos();
    }

    let mean_nanos = total_nanos / samples.len() as u128;
    let mean = Duration::new(
        (mean_nanos / 1_000_000_000) as u64,
        (mean_nanos % 1_000_000_000) as u32,
    );

    LatencySummary::Stats {
        count: samples.len(),
        min,
        max,
        mean,
    }
}
