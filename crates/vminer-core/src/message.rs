//! Message types for the status tracker
//!
//! Message handlers are implemented in [`crate::status`].

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use kameo_macros::Reply;
use serde::{Deserialize, Serialize};
use vminer_api::{JobOutcome, ResourceKind, SourceId, SyncState};

/// Seed a status entry from the registry
#[derive(Debug)]
pub struct RegisterSource {
    pub source: SourceId,
    /// Last recorded state; a stale `syncing` is reset to `pending`
    pub state: SyncState,
    pub last_successful_sync: Option<DateTime<Utc>>,
}

/// Claim a source for a job
///
/// Replies `false` if another job already holds it.
#[derive(Debug)]
pub struct MarkSyncing {
    pub source: SourceId,
}

/// Record the terminal outcome of a job
#[derive(Debug)]
pub struct MarkResult {
    pub source: SourceId,
    pub outcome: JobOutcome,
    pub error: Option<String>,
    pub failed_kinds: Vec<ResourceKind>,
    pub counts: BTreeMap<ResourceKind, usize>,
    pub finished_at: DateTime<Utc>,
}

/// Get the status of one source
#[derive(Debug)]
pub struct GetStatus {
    pub source: SourceId,
}

/// List the status of every known source
#[derive(Debug)]
pub struct ListStatuses;

/// Status entry of one source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Reply)]
pub struct SourceStatus {
    /// Source id
    pub source: SourceId,
    /// Current state
    pub state: SyncState,
    /// Outcome of the most recent finished job
    pub last_outcome: Option<JobOutcome>,
    /// Human-readable reason of the last failure
    pub error: Option<String>,
    /// Kinds that failed in the most recent job
    pub failed_kinds: Vec<ResourceKind>,
    /// Per-kind record counts of the most recent job
    pub counts: BTreeMap<ResourceKind, usize>,
    /// Start of the current or most recent job
    pub started_at: Option<DateTime<Utc>>,
    /// End of the most recent job
    pub finished_at: Option<DateTime<Utc>>,
    /// End of the most recent successful or partial job
    pub last_successful_sync: Option<DateTime<Utc>>,
}

impl SourceStatus {
    /// Fresh `pending` entry
    #[must_use]
    pub fn pending(source: SourceId) -> Self {
        Self {
            source,
            state: SyncState::Pending,
            last_outcome: None,
            error: None,
            failed_kinds: Vec::new(),
            counts: BTreeMap::new(),
            started_at: None,
            finished_at: None,
            last_successful_sync: None,
        }
    }

    /// Whether a job currently holds the source
    #[must_use]
    pub fn is_syncing(&self) -> bool {
        self.state == SyncState::Syncing
    }
}

/// Status of every known source, ordered by id
#[derive(Debug, Clone, Default, Serialize, Deserialize, Reply)]
pub struct StatusSnapshot {
    pub statuses: Vec<SourceStatus>,
}

impl StatusSnapshot {
    /// Number of sources in the given state
    #[must_use]
    pub fn count(&self, state: SyncState) -> usize {
        self.statuses.iter().filter(|s| s.state == state).count()
    }
}
