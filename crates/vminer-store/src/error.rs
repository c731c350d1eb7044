//! Error types for vminer-store

use thiserror::Error;
use vminer_api::SourceId;

/// Errors raised by stores and registries
#[derive(Error, Debug)]
pub enum StoreError {
    /// Database operation failed
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Attribute or descriptor (de)serialization failed
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Filesystem error while opening the database
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Source is not registered
    #[error("source not found: {0}")]
    SourceNotFound(SourceId),

    /// Stored row could not be decoded
    #[error("corrupt row: {0}")]
    Corrupt(String),
}
