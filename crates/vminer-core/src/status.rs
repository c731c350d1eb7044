//! `StatusTracker`: per-source sync status
//!
//! Owns one status entry per source. Messages are handled one at a time, so
//! claiming a source with [`MarkSyncing`] is atomic across concurrent callers.

use std::collections::BTreeMap;

use kameo::actor::{ActorRef, WeakActorRef};
use kameo::error::ActorStopReason;
use kameo::message::{Context, Message};
use kameo::prelude::*;
use tracing::{debug, info, warn};
use vminer_api::{JobOutcome, SourceId, SyncState};

use crate::error::CoreError;
use crate::message::{
    GetStatus, ListStatuses, MarkResult, MarkSyncing, RegisterSource, SourceStatus,
    StatusSnapshot,
};

/// Status tracker actor
#[derive(Debug, Default)]
pub struct StatusTracker {
    statuses: BTreeMap<SourceId, SourceStatus>,
}

impl StatusTracker {
    /// Number of tracked sources
    #[must_use]
    pub fn source_count(&self) -> usize {
        self.statuses.len()
    }
}

impl Actor for StatusTracker {
    type Args = ();
    type Error = CoreError;

    async fn on_start(_args: Self::Args, actor_ref: ActorRef<Self>) -> Result<Self, Self::Error> {
        info!(id = %actor_ref.id(), "StatusTracker starting");
        Ok(Self::default())
    }

    async fn on_stop(
        &mut self,
        _actor_ref: WeakActorRef<Self>,
        reason: ActorStopReason,
    ) -> Result<(), Self::Error> {
        info!(reason = ?reason, sources = self.statuses.len(), "StatusTracker stopping");
        Ok(())
    }
}

// ============================================================================
// Message Handlers
// ============================================================================

impl Message<RegisterSource> for StatusTracker {
    type Reply = Result<(), CoreError>;

    async fn handle(
        &mut self,
        msg: RegisterSource,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        let status = self
            .statuses
            .entry(msg.source.clone())
            .or_insert_with(|| SourceStatus::pending(msg.source.clone()));

        // a live job owns the entry
        if status.is_syncing() {
            return Ok(());
        }

        status.state = match msg.state {
            SyncState::Syncing => SyncState::Pending,
            other => other,
        };
        status.last_successful_sync = msg.last_successful_sync;

        debug!(source = %msg.source, state = %status.state, "source registered");
        Ok(())
    }
}

impl Message<MarkSyncing> for StatusTracker {
    type Reply = Result<bool, CoreError>;

    async fn handle(
        &mut self,
        msg: MarkSyncing,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        let status = self
            .statuses
            .entry(msg.source.clone())
            .or_insert_with(|| SourceStatus::pending(msg.source.clone()));

        if status.is_syncing() {
            debug!(source = %msg.source, "already syncing");
            return Ok(false);
        }

        let from = status.state;
        status.state = SyncState::Syncing;
        status.started_at = Some(chrono::Utc::now());

        info!(source = %msg.source, from = %from, to = %SyncState::Syncing, "state transition");
        Ok(true)
    }
}

impl Message<MarkResult> for StatusTracker {
    type Reply = Result<SourceStatus, CoreError>;

    async fn handle(
        &mut self,
        msg: MarkResult,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        let to = msg.outcome.terminal_state();
        let status = self
            .statuses
            .get_mut(&msg.source)
            .ok_or_else(|| CoreError::SourceNotFound(msg.source.clone()))?;

        if !status.is_syncing() || msg.outcome == JobOutcome::AlreadyInProgress {
            warn!(source = %msg.source, from = %status.state, to = %to, "rejected transition");
            return Err(CoreError::InvalidTransition {
                source_id: msg.source,
                from: status.state,
                to,
            });
        }

        status.state = to;
        status.last_outcome = Some(msg.outcome);
        status.error = msg.error;
        status.failed_kinds = msg.failed_kinds;
        status.counts = msg.counts;
        status.finished_at = Some(msg.finished_at);
        if msg.outcome.persisted() {
            status.last_successful_sync = Some(msg.finished_at);
        }

        info!(
            source = %msg.source,
            from = %SyncState::Syncing,
            to = %to,
            outcome = %msg.outcome,
            "state transition"
        );

        Ok(status.clone())
    }
}

impl Message<GetStatus> for StatusTracker {
    type Reply = Result<SourceStatus, CoreError>;

    async fn handle(
        &mut self,
        msg: GetStatus,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        self.statuses
            .get(&msg.source)
            .cloned()
            .ok_or(CoreError::SourceNotFound(msg.source))
    }
}

impl Message<ListStatuses> for StatusTracker {
    type Reply = StatusSnapshot;

    async fn handle(
        &mut self,
        _msg: ListStatuses,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        StatusSnapshot {
            statuses: self.statuses.values().cloned().collect(),
        }
    }
}
