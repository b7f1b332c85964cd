//! Error types for discovery, probing and the engine

use std::time::Duration;
use thiserror::Error;

/// Failure to list namespaces or instances from the cluster
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("Failed to list namespaces: {0}")]
    Namespaces(String),

    #[error("Failed to list pods in namespace {namespace}: {reason}")]
    Instances { namespace: String, reason: String },
}

/// Failure to query the log backend
///
/// An empty result set is not an error; see [`crate::probe::ProbeOutcome::NoLogsYet`].
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("Log backend request failed: {0}")]
    Transport(String),

    #[error("Log backend returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Failed to decode log backend response: {0}")]
    Decode(String),

    #[error("Log backend query timed out after {0:?}")]
    Timeout(Duration),
}

/// Errors that stop the engine
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    #[error("Invalid engine configuration: {0}")]
    Config(String),
}

impl ProbeError {
    /// Returns true if the backend answered but the answer was unusable
    pub fn is_backend_response(&self) -> bool {
        matches!(self, Self::Status { .. } | Self::Decode(_))
    }
}
