//! Engine event types
//!
//! Broadcast by the sync engine on every job transition so API layers can
//! stream progress without polling.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::{JobOutcome, JobPhase, ResourceKind, SourceId};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SyncEvent {
    JobQueued {
        source: SourceId,
    },
    PhaseChanged {
        source: SourceId,
        from: JobPhase,
        to: JobPhase,
    },
    KindCollected {
        source: SourceId,
        kind: ResourceKind,
        count: usize,
    },
    KindFailed {
        source: SourceId,
        kind: ResourceKind,
        error: String,
    },
    RetryScheduled {
        source: SourceId,
        attempt: u32,
        delay_ms: u64,
        error: String,
    },
    JobFinished {
        source: SourceId,
        outcome: JobOutcome,
        counts: BTreeMap<ResourceKind, usize>,
    },
}

impl SyncEvent {
    /// Source the event belongs to
    #[must_use]
    pub fn source(&self) -> &SourceId {
        match self {
            SyncEvent::JobQueued { source }
            | SyncEvent::PhaseChanged { source, .. }
            | SyncEvent::KindCollected { source, .. }
            | SyncEvent::KindFailed { source, .. }
            | SyncEvent::RetryScheduled { source, .. }
            | SyncEvent::JobFinished { source, .. } => source,
        }
    }
}
