//! Error types for vminer-session

use std::time::Duration;

use thiserror::Error;
use vminer_api::ResourceKind;

/// Errors raised while connecting to or talking with a remote endpoint
#[derive(Error, Debug, Clone)]
pub enum SessionError {
    /// Endpoint rejected the credentials
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Endpoint unreachable within the connect timeout
    #[error("connect timed out after {0:?}")]
    Timeout(Duration),

    /// Any other transport failure while connecting
    #[error("connection failed: {0}")]
    Connect(String),

    /// A request on an open session failed
    #[error("request failed: {0}")]
    Request(String),

    /// Response body could not be interpreted
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// The endpoint does not expose this resource kind
    #[error("resource kind not supported by this session: {0}")]
    Unsupported(ResourceKind),

    /// Descriptor is unusable (bad endpoint, missing credentials)
    #[error("invalid connection descriptor: {0}")]
    Descriptor(String),
}

impl SessionError {
    /// Check if error is worth retrying with backoff
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, SessionError::Timeout(_) | SessionError::Connect(_))
    }

    /// Check if the endpoint rejected the credentials
    #[must_use]
    pub fn is_auth(&self) -> bool {
        matches!(self, SessionError::Auth(_))
    }
}
