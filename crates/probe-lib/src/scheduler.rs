//! Probe schedulers
//!
//! A scheduler takes the batch claimed from the pending queue and probes
//! every instance in it, either one at a time in FIFO order or through a
//! fixed pool of workers fed by a bounded channel.

use crate::models::WorkloadInstance;
use crate::probe::{ProbeOutcome, Prober};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Default number of pool workers
pub const DEFAULT_WORKERS: usize = 10;

/// Default bound on outstanding work items in the pool channel
pub const DEFAULT_QUEUE_CAPACITY: usize = 10_000;

/// How probes are executed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Concurrency {
    Sequential,
    WorkerPool { workers: usize, capacity: usize },
}

impl Default for Concurrency {
    fn default() -> Self {
        Self::Sequential
    }
}

impl Concurrency {
    pub fn pool(workers: usize) -> Self {
        Self::WorkerPool {
            workers,
            capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }

    /// Create the scheduler, spawning pool workers onto the current runtime
    pub fn spawn(self, prober: Arc<Prober>) -> Box<dyn Scheduler> {
        match self {
            Self::Sequential => Box::new(SequentialScheduler::new(prober)),
            Self::WorkerPool { workers, capacity } => {
                Box::new(PooledScheduler::spawn(prober, workers, capacity))
            }
        }
    }
}

/// Outcome counts for one drained batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainSummary {
    pub resolved: usize,
    pub no_logs: usize,
    pub failed: usize,
    /// Instances not probed because they were already resolved or the pool was closed
    pub skipped: usize,
}

impl DrainSummary {
    fn record(&mut self, outcome: &ProbeOutcome) {
        match outcome {
            ProbeOutcome::Resolved(_) => self.resolved += 1,
            ProbeOutcome::NoLogsYet => self.no_logs += 1,
            ProbeOutcome::Failed(_) => self.failed += 1,
            ProbeOutcome::AlreadyResolved => self.skipped += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.resolved + self.no_logs + self.failed + self.skipped
    }
}

/// Executes probes for a claimed batch
#[async_trait]
pub trait Scheduler: Send + Sync {
    fn name(&self) -> &'static str;

    /// Probe every instance in the batch and wait for all results
    async fn drain(&self, batch: Vec<WorkloadInstance>) -> DrainSummary;

    /// Stop accepting work and wait for in-flight probes to finish
    async fn shutdown(&self);
}

/// Probes one instance at a time in FIFO order
pub struct SequentialScheduler {
    prober: Arc<Prober>,
}

impl SequentialScheduler {
    pub fn new(prober: Arc<Prober>) -> Self {
        Self { prober }
    }
}

#[async_trait]
impl Scheduler for SequentialScheduler {
    fn name(&self) -> &'static str {
        "sequential"
    }

    async fn drain(&self, batch: Vec<WorkloadInstance>) -> DrainSummary {
        let mut summary = DrainSummary::default();
        for instance in &batch {
            let outcome = self.prober.probe(instance).await;
            summary.record(&outcome);
        }
        summary
    }

    async fn shutdown(&self) {}
}

struct Job {
    instance: WorkloadInstance,
    done: mpsc::UnboundedSender<ProbeOutcome>,
}

/// Fixed pool of workers reading from a bounded work channel
///
/// Workers live for the whole run; `shutdown` closes the channel and joins them.
pub struct PooledScheduler {
    jobs: Mutex<Option<mpsc::Sender<Job>>>,
    workers: Mutex<JoinSet<()>>,
    worker_count: usize,
}

impl PooledScheduler {
    /// Spawn `workers` probe tasks onto the current Tokio runtime
    pub fn spawn(prober: Arc<Prober>, workers: usize, capacity: usize) -> Self {
        let worker_count = workers.max(1);
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));

        let mut set = JoinSet::new();
        for id in 0..worker_count {
            set.spawn(worker(id, prober.clone(), rx.clone()));
        }

        info!(workers = worker_count, capacity = capacity, "Started probe worker pool");

        Self {
            jobs: Mutex::new(Some(tx)),
            workers: Mutex::new(set),
            worker_count,
        }
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }
}

async fn worker(id: usize, prober: Arc<Prober>, jobs: Arc<Mutex<mpsc::Receiver<Job>>>) {
    loop {
        let job = jobs.lock().await.recv().await;
        let Some(job) = job else {
            debug!(worker = id, "Work channel closed, worker exiting");
            break;
        };

        let outcome = prober.probe(&job.instance).await;
        // The drain may have been abandoned; the outcome is already recorded
        let _ = job.done.send(outcome);
    }
}

#[async_trait]
impl Scheduler for PooledScheduler {
    fn name(&self) -> &'static str {
        "worker_pool"
    }

    async fn drain(&self, batch: Vec<WorkloadInstance>) -> DrainSummary {
        let mut summary = DrainSummary::default();
        let Some(jobs) = self.jobs.lock().await.clone() else {
            warn!(count = batch.len(), "Worker pool is shut down, dropping batch");
            summary.skipped = batch.len();
            return summary;
        };

        let (done_tx, mut done_rx) = mpsc::unbounded_channel();
        let mut submitted = 0usize;

        for instance in batch {
            let job = Job {
                instance,
                done: done_tx.clone(),
            };
            if jobs.send(job).await.is_err() {
                warn!("Work channel closed while submitting batch");
                summary.skipped += 1;
                continue;
            }
            submitted += 1;
        }
        drop(done_tx);

        // Completes once every submitted job has reported and dropped its sender
        while let Some(outcome) = done_rx.recv().await {
            summary.record(&outcome);
        }

        debug!(
            submitted = submitted,
            resolved = summary.resolved,
            "Worker pool drained batch"
        );
        summary
    }

    async fn shutdown(&self) {
        self.jobs.lock().await.take();

        let mut workers = self.workers.lock().await;
        while let Some(result) = workers.join_next().await {
            if let Err(e) = result {
                warn!(error = %e, "Probe worker terminated abnormally");
            }
        }
        info!("Probe worker pool stopped");
    }
}
