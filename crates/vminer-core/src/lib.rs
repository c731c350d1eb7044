//! vminer-core: sync engine
//!
//! Runs inventory sync jobs over a bounded worker pool. A `StatusTracker`
//! actor owns per-source status and enforces one job per source; each job
//! connects, collects every configured kind and persists the result in one
//! store transaction.

pub mod config;
pub mod engine;
pub mod error;
pub mod job;
pub mod message;
pub mod retry;
pub mod status;

pub use config::{EngineConfig, RetryConfig};
pub use engine::{SyncEngine, SyncEngineArgs};
pub use error::CoreError;
pub use job::{AttemptReport, JobContext, JobResult, SyncJob};
pub use message::{
    GetStatus, ListStatuses, MarkResult, MarkSyncing, RegisterSource, SourceStatus,
    StatusSnapshot,
};
pub use retry::{RetryPolicy, RetryState};
pub use status::StatusTracker;
