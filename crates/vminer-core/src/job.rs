//! `SyncJob`: one collection-and-persist pass for one source
//!
//! Phases run `Connecting -> Collecting -> Persisting -> Done`. Every await
//! races the job's cancellation token. The session is released before
//! persisting, and all writes of a pass go through a single store
//! transaction that is dropped (rolled back) on failure or cancellation.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use vminer_api::{
    JobOutcome, JobPhase, JobReport, KindErrorReport, ResourceKind, SourceId, SyncEvent,
};
use vminer_inventory::{CollectionError, Collector, ResourceRecord};
use vminer_session::ConnectionManager;
use vminer_store::{InventoryStore, Source, StoreError};

use crate::error::CoreError;

/// Shared dependencies of every job
pub struct JobContext {
    pub connections: ConnectionManager,
    pub collector: Collector,
    pub store: Arc<dyn InventoryStore>,
    pub events: broadcast::Sender<SyncEvent>,
    /// Kinds in collection order
    pub plan: Vec<ResourceKind>,
}

/// Result of one attempt of a job
#[derive(Debug, Clone)]
pub struct AttemptReport {
    pub outcome: JobOutcome,
    pub counts: BTreeMap<ResourceKind, usize>,
    pub kind_errors: Vec<KindErrorReport>,
    pub error: Option<CoreError>,
}

impl AttemptReport {
    /// Report for an attempt that failed as a whole
    #[must_use]
    pub fn failed(error: CoreError) -> Self {
        Self {
            outcome: JobOutcome::Failed,
            counts: BTreeMap::new(),
            kind_errors: Vec::new(),
            error: Some(error),
        }
    }

    /// Report for a job cancelled before or between attempts
    #[must_use]
    pub fn cancelled() -> Self {
        Self {
            outcome: JobOutcome::Cancelled,
            counts: BTreeMap::new(),
            kind_errors: Vec::new(),
            error: Some(CoreError::Cancelled),
        }
    }
}

/// Final result of one requested source
#[derive(Debug, Clone)]
pub struct JobResult {
    pub source: SourceId,
    pub outcome: JobOutcome,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub attempts: u32,
    pub counts: BTreeMap<ResourceKind, usize>,
    pub kind_errors: Vec<KindErrorReport>,
    pub error: Option<CoreError>,
}

impl JobResult {
    /// Result that never ran (already in progress, cancelled while queued, ...)
    #[must_use]
    pub fn not_run(source: SourceId, outcome: JobOutcome, error: Option<CoreError>) -> Self {
        let now = Utc::now();
        Self {
            source,
            outcome,
            started_at: now,
            finished_at: now,
            attempts: 0,
            counts: BTreeMap::new(),
            kind_errors: Vec::new(),
            error,
        }
    }

    /// Kinds that failed to collect
    #[must_use]
    pub fn failed_kinds(&self) -> Vec<ResourceKind> {
        self.kind_errors.iter().map(|e| e.kind).collect()
    }

    /// Serializable report
    #[must_use]
    pub fn report(&self) -> JobReport {
        JobReport {
            source: self.source.clone(),
            outcome: self.outcome,
            started_at: self.started_at,
            finished_at: self.finished_at,
            attempts: self.attempts,
            counts: self.counts.clone(),
            kind_errors: self.kind_errors.clone(),
            error: self.error.as_ref().map(ToString::to_string),
        }
    }
}

/// One attempt of a sync job
pub struct SyncJob<'a> {
    ctx: &'a JobContext,
    source: &'a Source,
    cancel: CancellationToken,
    phase: JobPhase,
}

impl<'a> SyncJob<'a> {
    /// Prepare an attempt; nothing runs until [`SyncJob::run`]
    #[must_use]
    pub fn new(ctx: &'a JobContext, source: &'a Source, cancel: CancellationToken) -> Self {
        Self {
            ctx,
            source,
            cancel,
            phase: JobPhase::Connecting,
        }
    }

    /// Current phase
    #[must_use]
    pub fn phase(&self) -> JobPhase {
        self.phase
    }

    fn transition_to(&mut self, to: JobPhase) {
        let from = self.phase;
        self.phase = to;

        debug!(source = %self.source.id, from = %from, to = %to, "phase transition");

        // no subscribers is fine
        let _ = self.ctx.events.send(SyncEvent::PhaseChanged {
            source: self.source.id.clone(),
            from,
            to,
        });
    }

    fn finish(&mut self, report: AttemptReport) -> AttemptReport {
        self.transition_to(JobPhase::Done);
        report
    }

    /// Run the attempt to completion
    pub async fn run(mut self) -> AttemptReport {
        let id = self.source.id.clone();

        // Connecting
        let connect = self.ctx.connections.acquire(&id, &self.source.descriptor);
        let lease = tokio::select! {
            biased;
            () = self.cancel.cancelled() => {
                info!(source = %id, "cancelled while connecting");
                return self.finish(AttemptReport::cancelled());
            }
            result = connect => match result {
                Ok(lease) => lease,
                Err(e) => {
                    warn!(source = %id, error = %e, "connect failed");
                    return self.finish(AttemptReport::failed(e.into()));
                }
            },
        };

        // Collecting
        self.transition_to(JobPhase::Collecting);

        let mut collected: BTreeMap<ResourceKind, Vec<ResourceRecord>> = BTreeMap::new();
        let mut kind_errors = Vec::new();
        let mut attempted = 0usize;

        for &kind in &self.ctx.plan {
            let parents = kind
                .parent()
                .and_then(|parent| collected.get(&parent))
                .map(Vec::as_slice);

            let result = tokio::select! {
                biased;
                () = self.cancel.cancelled() => Err(CollectionError::Cancelled),
                result = self.ctx.collector.collect_kind(lease.session(), &id, kind, parents) => result,
            };

            match result {
                Ok(records) => {
                    attempted += 1;
                    let _ = self.ctx.events.send(SyncEvent::KindCollected {
                        source: id.clone(),
                        kind,
                        count: records.len(),
                    });
                    collected.insert(kind, records);
                }
                Err(CollectionError::Unsupported(_)) => {
                    debug!(source = %id, kind = %kind, "kind skipped");
                }
                Err(CollectionError::Cancelled) => {
                    info!(source = %id, kind = %kind, "cancelled while collecting");
                    drop(lease);
                    return self.finish(AttemptReport::cancelled());
                }
                Err(e) => {
                    attempted += 1;
                    warn!(source = %id, kind = %kind, error = %e, "kind failed");
                    let _ = self.ctx.events.send(SyncEvent::KindFailed {
                        source: id.clone(),
                        kind,
                        error: e.to_string(),
                    });
                    kind_errors.push(KindErrorReport {
                        kind,
                        error: e.to_string(),
                    });
                }
            }
        }

        if let Err(e) = lease.release().await {
            warn!(source = %id, error = %e, "session release failed");
        }

        // failed kinds report 0 so the counts cover every attempted kind
        let counts: BTreeMap<ResourceKind, usize> = kind_errors
            .iter()
            .map(|e| (e.kind, 0))
            .chain(collected.iter().map(|(kind, records)| (*kind, records.len())))
            .collect();

        if attempted > 0 && collected.is_empty() {
            error!(source = %id, failed = kind_errors.len(), "every kind failed");
            let failed = kind_errors.len();
            return self.finish(AttemptReport {
                outcome: JobOutcome::Failed,
                counts,
                kind_errors,
                error: Some(CoreError::AllKindsFailed { failed }),
            });
        }

        // Persisting
        self.transition_to(JobPhase::Persisting);

        let write = persist(self.ctx.store.as_ref(), &id, &collected);
        let persisted = tokio::select! {
            biased;
            () = self.cancel.cancelled() => {
                info!(source = %id, "cancelled while persisting, transaction dropped");
                return self.finish(AttemptReport::cancelled());
            }
            result = write => result,
        };

        if let Err(e) = persisted {
            error!(source = %id, error = %e, "persistence failed, transaction rolled back");
            return self.finish(AttemptReport {
                outcome: JobOutcome::Failed,
                counts,
                kind_errors,
                error: Some(CoreError::Persistence(e.to_string())),
            });
        }

        let outcome = if kind_errors.is_empty() {
            JobOutcome::Success
        } else {
            JobOutcome::Partial
        };

        self.finish(AttemptReport {
            outcome,
            counts,
            kind_errors,
            error: None,
        })
    }
}

/// Upsert and reap every successfully collected kind in one transaction
async fn persist(
    store: &dyn InventoryStore,
    source: &SourceId,
    collected: &BTreeMap<ResourceKind, Vec<ResourceRecord>>,
) -> Result<(), StoreError> {
    let mut tx = store.begin(source).await?;

    for (&kind, records) in collected {
        let summary = tx.upsert(kind, records).await?;
        let seen: HashSet<String> = records.iter().map(|r| r.remote_id.clone()).collect();
        let reaped = tx.reap_missing(kind, &seen).await?;

        debug!(
            source = %source,
            kind = %kind,
            written = summary.written,
            unchanged = summary.unchanged,
            reaped,
            "kind persisted"
        );
    }

    tx.commit().await
}
