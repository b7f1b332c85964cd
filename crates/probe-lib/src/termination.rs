//! Engine termination policies
//!
//! A stop condition is consulted once per completed discovery + drain cycle.
//! External interrupts are handled by the engine itself and stop the run
//! regardless of which condition is configured.

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Default number of consecutive empty drains before stopping
pub const DEFAULT_EMPTY_QUEUE_THRESHOLD: u32 = 3;

/// What happened during one discovery + drain cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleSummary {
    /// Instances newly enqueued by the discovery pass
    pub enqueued: usize,
    /// Instances claimed by the drain
    pub drained: usize,
    /// Instances resolved during the drain
    pub resolved: usize,
}

/// Configured termination strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum TerminationPolicy {
    /// Run until an external interrupt is received
    RunUntilSignal,
    /// Stop after `threshold` consecutive drains found nothing pending
    EmptyQueueThreshold { threshold: u32 },
}

impl Default for TerminationPolicy {
    fn default() -> Self {
        Self::RunUntilSignal
    }
}

impl TerminationPolicy {
    pub fn into_condition(self) -> Box<dyn StopCondition> {
        match self {
            Self::RunUntilSignal => Box::new(RunUntilSignal),
            Self::EmptyQueueThreshold { threshold } => {
                Box::new(EmptyQueueThreshold::new(threshold))
            }
        }
    }
}

/// Decides after each cycle whether the engine should stop
pub trait StopCondition: Send {
    fn should_stop(&mut self, cycle: &CycleSummary) -> bool;
}

/// Never stops on its own
#[derive(Debug, Clone, Copy, Default)]
pub struct RunUntilSignal;

impl StopCondition for RunUntilSignal {
    fn should_stop(&mut self, _cycle: &CycleSummary) -> bool {
        false
    }
}

/// Stops once the pending queue has been empty for `threshold` consecutive drains
#[derive(Debug, Clone)]
pub struct EmptyQueueThreshold {
    threshold: u32,
    consecutive_empty: u32,
}

impl EmptyQueueThreshold {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            consecutive_empty: 0,
        }
    }

    pub fn consecutive_empty(&self) -> u32 {
        self.consecutive_empty
    }
}

impl Default for EmptyQueueThreshold {
    fn default() -> Self {
        Self::new(DEFAULT_EMPTY_QUEUE_THRESHOLD)
    }
}

impl StopCondition for EmptyQueueThreshold {
    fn should_stop(&mut self, cycle: &CycleSummary) -> bool {
        if cycle.drained == 0 {
            self.consecutive_empty += 1;
        } else {
            self.consecutive_empty = 0;
        }

        debug!(
            consecutive_empty = self.consecutive_empty,
            threshold = self.threshold,
            "Checked empty queue threshold"
        );

        self.consecutive_empty >= self.threshold
    }
}
