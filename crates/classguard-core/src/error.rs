use classguard_integrations::{BackendError, IdentityError};
use thiserror::Error;

/// Errors raised by the enforcement engine.
///
/// Only [`AgentError::Storage`] at startup is fatal; everything else is
/// handled within the cycle that produced it.
#[derive(Debug, Error)]
pub enum AgentError {
    /// The backend could not be reached or answered badly. Retried next cycle.
    #[error("transient network error: {0}")]
    TransientNetwork(#[from] BackendError),

    #[error("malformed pattern '{pattern}': {reason}")]
    MalformedPattern { pattern: String, reason: String },

    #[error("host operation {op} failed: {reason}")]
    HostSessionOp { op: &'static str, reason: String },

    #[error("student identity unresolved: {0}")]
    IdentityUnresolved(#[from] IdentityError),

    #[error("agent state is no longer available")]
    StateUnavailable,

    #[error("state store error: {0:#}")]
    Storage(#[from] anyhow::Error),
}

impl AgentError {
    pub(crate) fn host(op: &'static str, reason: impl ToString) -> Self {
        Self::HostSessionOp {
            op,
            reason: reason.to_string(),
        }
    }

    /// Whether the failure should be retried on the next cycle.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::TransientNetwork(_) | Self::HostSessionOp { .. })
    }
}
