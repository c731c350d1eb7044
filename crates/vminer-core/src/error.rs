//! Core error types for vminer-core

use std::time::Duration;

use thiserror::Error;
use vminer_api::{SourceId, SyncState};
use vminer_session::SessionError;

/// Errors that can occur while running sync jobs
#[derive(Error, Debug, Clone)]
pub enum CoreError {
    /// Endpoint rejected the credentials
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Endpoint could not be reached
    #[error("connection failed: {0}")]
    Connect(String),

    /// Endpoint did not answer within the connect timeout
    #[error("connect timed out after {0:?}")]
    Timeout(Duration),

    /// Every planned kind failed to collect
    #[error("all {failed} resource kinds failed to collect")]
    AllKindsFailed {
        /// Number of failed kinds
        failed: usize,
    },

    /// Writing the collected records failed
    #[error("persistence failed: {0}")]
    Persistence(String),

    /// Job was cancelled
    #[error("job cancelled")]
    Cancelled,

    /// A sync attempt panicked
    #[error("sync attempt panicked: {0}")]
    Panicked(String),

    /// Source is not in the registry
    #[error("source not found: {0}")]
    SourceNotFound(SourceId),

    /// Registry lookup or update failed
    #[error("registry error: {0}")]
    Registry(String),

    /// Invalid status transition attempted
    #[error("invalid state transition for {source_id} from {from} to {to}")]
    InvalidTransition {
        /// Source the transition was attempted on
        source_id: SourceId,
        /// Current state
        from: SyncState,
        /// Attempted target state
        to: SyncState,
    },

    /// Actor communication error
    #[error("actor communication error: {0}")]
    ActorError(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    ConfigError(String),
}

impl CoreError {
    /// Check if a failed job may be retried with backoff
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, CoreError::Connect(_) | CoreError::Timeout(_))
    }
}

impl From<SessionError> for CoreError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::Auth(msg) => CoreError::Auth(msg),
            SessionError::Timeout(after) => CoreError::Timeout(after),
            SessionError::Descriptor(msg) => CoreError::ConfigError(msg),
            other => CoreError::Connect(other.to_string()),
        }
    }
}
