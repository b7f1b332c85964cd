//! Pending instance queue with process-lifetime resolution tracking
//!
//! Discovery polls re-observe the same pods until they are resolved, so
//! enqueueing is idempotent: an instance is pending at most once and is
//! never pending again after it has been resolved.

use crate::models::{InstanceKey, KeyPolicy, WorkloadInstance};
use std::collections::{HashSet, VecDeque};
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Debug, Default)]
struct QueueState {
    pending: VecDeque<WorkloadInstance>,
    pending_keys: HashSet<InstanceKey>,
    resolved: HashSet<InstanceKey>,
}

/// FIFO of instances awaiting a probe plus the set of resolved instance keys
///
/// A single lock covers both structures so check-then-enqueue and
/// check-then-resolve are atomic with respect to each other.
#[derive(Debug)]
pub struct DedupQueue {
    state: Mutex<QueueState>,
    policy: KeyPolicy,
}

impl Default for DedupQueue {
    fn default() -> Self {
        Self::new(KeyPolicy::default())
    }
}

impl DedupQueue {
    pub fn new(policy: KeyPolicy) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            policy,
        }
    }

    pub fn policy(&self) -> KeyPolicy {
        self.policy
    }

    /// Append an instance unless it is already pending or resolved
    ///
    /// Returns true if the instance was added.
    pub async fn enqueue(&self, instance: WorkloadInstance) -> bool {
        let key = instance.key(self.policy);
        let mut state = self.state.lock().await;

        if state.resolved.contains(&key) || state.pending_keys.contains(&key) {
            return false;
        }

        debug!(key = %key, "Enqueued instance");
        state.pending_keys.insert(key);
        state.pending.push_back(instance);
        true
    }

    /// Detach and return every pending instance in FIFO order
    pub async fn dequeue_all(&self) -> Vec<WorkloadInstance> {
        let mut state = self.state.lock().await;
        state.pending_keys.clear();
        state.pending.drain(..).collect()
    }

    /// Record an instance as resolved
    ///
    /// Returns false if it had already been resolved, so concurrent probes
    /// of the same instance produce a single sample.
    pub async fn mark_resolved(&self, instance: &WorkloadInstance) -> bool {
        let key = instance.key(self.policy);
        let mut state = self.state.lock().await;
        state.resolved.insert(key)
    }

    pub async fn is_resolved(&self, instance: &WorkloadInstance) -> bool {
        let key = instance.key(self.policy);
        self.state.lock().await.resolved.contains(&key)
    }

    pub async fn pending_len(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    pub async fn resolved_len(&self) -> usize {
        self.state.lock().await.resolved.len()
    }
}
