//! Benchmark error classification.
//!
//! One error type for everything that can go wrong inside a benchmark case.
//! Transient classification drives the deployment retry loop; everything else
//! is caught at the case boundary and recorded.

use crate::benchmarks::retry::{RetryableError, is_transient_error};
use crate::remote::RemoteError;
use std::time::Duration;

/// Errors that can occur while running a benchmark case.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BenchmarkError {
    /// The deploy command ran and reported failure.
    #[error("Deployment failed: {0}")]
    DeploymentFailed(String),

    #[error("Could not resolve endpoint for {function}: {reason}")]
    EndpointResolution { function: String, reason: String },

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("Could not confirm cold state for {target} after {}s", .elapsed.as_secs())]
    ColdConfirmationTimeout { target: String, elapsed: Duration },

    #[error("Agent '{display_name}' not found after {attempts} lookups")]
    AgentNotFound { display_name: String, attempts: u32 },

    #[error("Failed to attach debugging action: {0}")]
    ActionAttachFailed(String),

    #[error("{pending} of {expected} actions not bound by the agent after {}s", .waited.as_secs())]
    ActionsNotBound {
        pending: usize,
        expected: usize,
        waited: Duration,
    },

    #[error("Measurement failed: {0}")]
    Measurement(String),

    #[error("Case task panicked: {0}")]
    TaskPanicked(String),

    #[error("Cancelled by user")]
    Cancelled,
}

impl BenchmarkError {
    /// Whether another attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::DeploymentFailed(text) => is_transient_error(text),
            Self::Remote(e) => e.is_timeout(),
            _ => false,
        }
    }
}

impl RetryableError for BenchmarkError {
    fn is_retryable(&self) -> bool {
        BenchmarkError::is_retryable(self)
    }
}
