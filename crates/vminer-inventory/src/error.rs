//! Error types for vminer-inventory

use std::time::Duration;

use thiserror::Error;
use vminer_api::ResourceKind;
use vminer_session::SessionError;

/// Errors scoped to the collection of a single resource kind
#[derive(Error, Debug, Clone)]
pub enum CollectionError {
    /// A remote call failed
    #[error("remote call failed: {0}")]
    Remote(SessionError),

    /// The kind did not finish within the collect timeout
    #[error("collection timed out after {0:?}")]
    Timeout(Duration),

    /// The parent kind was not collected successfully in this pass
    #[error("dependency {0} was not collected")]
    DependencyFailed(ResourceKind),

    /// The session cannot report this kind
    #[error("not supported by this session: {0}")]
    Unsupported(ResourceKind),

    /// The job was cancelled while collecting
    #[error("collection cancelled")]
    Cancelled,
}

impl CollectionError {
    /// Unsupported kinds are skipped rather than reported
    #[must_use]
    pub fn is_unsupported(&self) -> bool {
        matches!(self, CollectionError::Unsupported(_))
    }
}

impl From<SessionError> for CollectionError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::Unsupported(kind) => CollectionError::Unsupported(kind),
            other => CollectionError::Remote(other),
        }
    }
}
