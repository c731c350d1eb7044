//! Registered sources

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use vminer_api::{SourceId, SyncState};
use vminer_session::ConnectionDescriptor;

/// One remote inventory endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    /// Source id
    pub id: SourceId,
    /// How to reach the endpoint
    pub descriptor: ConnectionDescriptor,
    /// Included in `sync_all_active`
    pub active: bool,
    /// Finish time of the last successful or partial job
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_successful_sync: Option<DateTime<Utc>>,
    /// Last recorded sync state
    #[serde(default)]
    pub state: SyncState,
}

impl Source {
    /// Create an active, never-synced source
    pub fn new(id: impl Into<SourceId>, descriptor: ConnectionDescriptor) -> Self {
        Self {
            id: id.into(),
            descriptor,
            active: true,
            last_successful_sync: None,
            state: SyncState::Pending,
        }
    }

    /// Mark the source inactive
    #[must_use]
    pub fn inactive(mut self) -> Self {
        self.active = false;
        self
    }
}
