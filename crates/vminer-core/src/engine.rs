//! `SyncEngine`: worker pool and dispatcher
//!
//! Requests are claimed in the status tracker, queued by priority and run by
//! a fixed pool of workers, one job per worker at a time. Callers wait on a
//! oneshot channel per requested source, so status stays pollable while a
//! `sync_sources` call is in flight.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use chrono::{DateTime, Utc};
use kameo::actor::ActorRef;
use kameo::error::SendError;
use kameo::prelude::*;
use tokio::sync::{Mutex, Notify, broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use vminer_api::{JobOutcome, Priority, SourceId, SyncEvent};
use vminer_inventory::Collector;
use vminer_session::{ConnectionManager, Connector};
use vminer_store::{InventoryStore, Source, SourceRegistry};

use crate::config::EngineConfig;
use crate::error::CoreError;
use crate::job::{AttemptReport, JobContext, JobResult, SyncJob};
use crate::message::{
    GetStatus, ListStatuses, MarkResult, MarkSyncing, RegisterSource, SourceStatus,
};
use crate::retry::{RetryPolicy, RetryState};
use crate::status::StatusTracker;

/// Arguments for starting a [`SyncEngine`]
pub struct SyncEngineArgs {
    /// Engine settings
    pub config: EngineConfig,
    /// Opens sessions against sources
    pub connector: Arc<dyn Connector>,
    /// Record store
    pub store: Arc<dyn InventoryStore>,
    /// Source registry
    pub registry: Arc<dyn SourceRegistry>,
}

/// Handle to a running sync engine
///
/// Cheap to clone; every clone drives the same workers.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    config: EngineConfig,
    job_ctx: Arc<JobContext>,
    registry: Arc<dyn SourceRegistry>,
    status: ActorRef<StatusTracker>,
    queue: JobQueue,
    retry_policy: RetryPolicy,
    retry_states: Mutex<HashMap<SourceId, RetryState>>,
    /// Cancellation tokens of queued and running jobs
    in_flight: Mutex<HashMap<SourceId, CancellationToken>>,
    shutdown: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
    /// Jobs waiting out a retry delay
    retries: Mutex<Vec<JoinHandle<()>>>,
}

fn actor_error(e: impl std::fmt::Display) -> CoreError {
    CoreError::ActorError(e.to_string())
}

fn handler_error<M>(e: SendError<M, CoreError>) -> CoreError {
    match e {
        SendError::HandlerError(err) => err,
        other => actor_error(other),
    }
}

impl SyncEngine {
    /// Validate the config, seed status from the registry and spawn workers
    ///
    /// # Errors
    /// Returns `ConfigError` for invalid settings and `Registry` if the
    /// registry cannot be read.
    pub async fn start(args: SyncEngineArgs) -> Result<Self, CoreError> {
        args.config.validate()?;

        let status = StatusTracker::spawn(());

        let sources = args
            .registry
            .list_sources()
            .await
            .map_err(|e| CoreError::Registry(e.to_string()))?;
        for source in &sources {
            status
                .ask(RegisterSource {
                    source: source.id.clone(),
                    state: source.state,
                    last_successful_sync: source.last_successful_sync,
                })
                .await
                .map_err(handler_error)?;
        }

        let (events, _) = broadcast::channel(args.config.event_channel_capacity);

        let job_ctx = JobContext {
            connections: ConnectionManager::new(args.connector, args.config.connect_timeout()),
            collector: Collector::new(args.config.collector_config()),
            store: args.store,
            events,
            plan: args.config.plan(),
        };

        let inner = Arc::new(EngineInner {
            retry_policy: RetryPolicy::new(&args.config.retry),
            config: args.config,
            job_ctx: Arc::new(job_ctx),
            registry: args.registry,
            status,
            queue: JobQueue::default(),
            retry_states: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
            workers: Mutex::new(Vec::new()),
            retries: Mutex::new(Vec::new()),
        });

        let pool_size = inner.config.pool_size;
        {
            let mut workers = inner.workers.lock().await;
            for worker_id in 0..pool_size {
                workers.push(tokio::spawn(worker_loop(Arc::clone(&inner), worker_id)));
            }
        }

        info!(
            pool_size,
            sources = sources.len(),
            kinds = inner.job_ctx.plan.len(),
            "sync engine started"
        );

        Ok(Self { inner })
    }

    /// Engine settings
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Sync the given sources and wait for every result
    ///
    /// Duplicate ids are collapsed. A source another job already holds
    /// answers `already-in-progress` without being queued. Results come back
    /// in request order.
    ///
    /// # Errors
    /// Returns `ActorError` if the status tracker is unreachable.
    #[instrument(skip_all, fields(requested = ids.len(), priority = ?priority))]
    pub async fn sync_sources(
        &self,
        ids: &[SourceId],
        priority: Priority,
    ) -> Result<Vec<JobResult>, CoreError> {
        let mut seen = HashSet::new();
        let ids: Vec<&SourceId> = ids.iter().filter(|id| seen.insert(*id)).collect();

        let mut pending = Vec::with_capacity(ids.len());

        for id in ids {
            if self.inner.shutdown.is_cancelled() {
                pending.push(Pending::Ready(JobResult::not_run(
                    id.clone(),
                    JobOutcome::Cancelled,
                    Some(CoreError::Cancelled),
                )));
                continue;
            }

            let claimed = self
                .inner
                .status
                .ask(MarkSyncing { source: id.clone() })
                .await
                .map_err(handler_error)?;

            if !claimed {
                info!(source = %id, "already in progress, not queued");
                pending.push(Pending::Ready(JobResult::not_run(
                    id.clone(),
                    JobOutcome::AlreadyInProgress,
                    None,
                )));
                continue;
            }

            let cancel = self.inner.shutdown.child_token();
            self.inner
                .in_flight
                .lock()
                .await
                .insert(id.clone(), cancel.clone());

            let (reply, rx) = oneshot::channel();
            self.inner
                .queue
                .push(QueuedJob::new(id.clone(), priority, cancel, reply))
                .await;
            let _ = self.inner.job_ctx.events.send(SyncEvent::JobQueued {
                source: id.clone(),
            });
            debug!(source = %id, "job queued");

            pending.push(Pending::Waiting(id.clone(), rx));
        }

        // shutdown may have drained the queue before the push above
        if self.inner.shutdown.is_cancelled() {
            self.inner.drain_queue().await;
        }

        let mut results = Vec::with_capacity(pending.len());
        for entry in pending {
            let result = match entry {
                Pending::Ready(result) => result,
                Pending::Waiting(id, rx) => rx.await.unwrap_or_else(|_| {
                    JobResult::not_run(id, JobOutcome::Cancelled, Some(CoreError::Cancelled))
                }),
            };
            results.push(result);
        }

        Ok(results)
    }

    /// Sync every active source of the registry
    ///
    /// # Errors
    /// Returns `Registry` if the registry cannot be read.
    pub async fn sync_all_active(&self, priority: Priority) -> Result<Vec<JobResult>, CoreError> {
        let ids: Vec<SourceId> = self
            .inner
            .registry
            .list_active_sources()
            .await
            .map_err(|e| CoreError::Registry(e.to_string()))?
            .into_iter()
            .map(|s| s.id)
            .collect();

        info!(sources = ids.len(), "syncing all active sources");
        self.sync_sources(&ids, priority).await
    }

    /// Cancel the queued or running job of a source
    ///
    /// Returns `false` if the source has no job.
    pub async fn cancel_source(&self, id: &SourceId) -> bool {
        if let Some(job) = self.inner.queue.remove(id).await {
            info!(source = %id, "queued job cancelled");
            self.inner.answer_cancelled(job).await;
            return true;
        }

        match self.inner.in_flight.lock().await.get(id) {
            Some(token) => {
                info!(source = %id, "running job cancelled");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every job and stop the workers
    ///
    /// Running jobs and jobs waiting for a retry finish as `cancelled`,
    /// queued jobs are answered
    /// `cancelled`, and later requests are answered `cancelled` without
    /// running.
    pub async fn shutdown(&self) {
        info!("sync engine shutting down");
        self.inner.shutdown.cancel();
        self.inner.queue.notify.notify_waiters();
        self.inner.drain_queue().await;

        let workers: Vec<JoinHandle<()>> = self.inner.workers.lock().await.drain(..).collect();
        for worker in workers {
            if let Err(e) = worker.await {
                error!(error = %e, "worker panicked");
            }
        }

        // parked retries answer `cancelled` once their token fires
        let retries: Vec<JoinHandle<()>> = self.inner.retries.lock().await.drain(..).collect();
        for retry in retries {
            if let Err(e) = retry.await {
                error!(error = %e, "retry task panicked");
            }
        }

        info!("sync engine stopped");
    }

    /// Status of one source
    ///
    /// # Errors
    /// Returns `SourceNotFound` for unknown sources.
    pub async fn status(&self, id: &SourceId) -> Result<SourceStatus, CoreError> {
        self.inner
            .status
            .ask(GetStatus { source: id.clone() })
            .await
            .map_err(handler_error)
    }

    /// Status of every known source
    ///
    /// # Errors
    /// Returns `ActorError` if the status tracker is unreachable.
    pub async fn statuses(&self) -> Result<Vec<SourceStatus>, CoreError> {
        self.inner
            .status
            .ask(ListStatuses)
            .await
            .map(|snapshot| snapshot.statuses)
            .map_err(actor_error)
    }

    /// Retry bookkeeping of one source, if it ever failed transiently
    pub async fn retry_state(&self, id: &SourceId) -> Option<RetryState> {
        self.inner.retry_states.lock().await.get(id).cloned()
    }

    /// Subscribe to engine events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.job_ctx.events.subscribe()
    }
}

enum Pending {
    Ready(JobResult),
    Waiting(SourceId, oneshot::Receiver<JobResult>),
}

async fn worker_loop(inner: Arc<EngineInner>, worker_id: usize) {
    debug!(worker = worker_id, "worker started");

    loop {
        let job = loop {
            if let Some(job) = inner.queue.pop().await {
                break Some(job);
            }
            tokio::select! {
                () = inner.shutdown.cancelled() => break None,
                () = inner.queue.notify.notified() => {}
            }
        };

        let Some(job) = job else {
            break;
        };

        debug!(worker = worker_id, source = %job.source, attempt = job.attempts + 1, "job picked up");
        inner.run_job(job).await;
    }

    debug!(worker = worker_id, "worker stopped");
}

impl EngineInner {
    /// Run one attempt of a job, then either answer it or schedule a retry
    ///
    /// A retry waits outside the worker pool and re-enters the queue, so the
    /// slot is free for other sources during the backoff.
    #[instrument(skip_all, fields(source = %job.source, attempt = job.attempts + 1))]
    async fn run_job(self: &Arc<Self>, mut job: QueuedJob) {
        let started_at = *job.started_at.get_or_insert_with(Utc::now);
        let id = job.source.clone();

        if job.cancel.is_cancelled() {
            self.answer_cancelled(job).await;
            return;
        }

        let source = match self.registry.get_source(&id).await {
            Ok(Some(source)) => source,
            Ok(None) => {
                warn!("source not in registry");
                let report = AttemptReport::failed(CoreError::SourceNotFound(id.clone()));
                let result = self.finish(&id, started_at, job.attempts, report, false).await;
                let _ = job.reply.send(result);
                return;
            }
            Err(e) => {
                error!(error = %e, "registry lookup failed");
                let report = AttemptReport::failed(CoreError::Registry(e.to_string()));
                let result = self.finish(&id, started_at, job.attempts, report, false).await;
                let _ = job.reply.send(result);
                return;
            }
        };

        job.attempts += 1;
        let attempt = job.attempts;
        let report = self.run_attempt(source, job.cancel.clone()).await;

        if let Some(error) = report.error.as_ref()
            && report.outcome == JobOutcome::Failed
            && self.retry_policy.should_retry(attempt, error)
            && !job.cancel.is_cancelled()
        {
            let error = error.to_string();
            self.schedule_retry(job, error).await;
            return;
        }

        {
            let mut retry_states = self.retry_states.lock().await;
            match report.outcome {
                JobOutcome::Success | JobOutcome::Partial => {
                    retry_states.remove(&id);
                }
                JobOutcome::Failed => {
                    retry_states.insert(
                        id.clone(),
                        RetryState {
                            attempt,
                            last_error: report.error.as_ref().map(ToString::to_string),
                            next_eligible_at: None,
                        },
                    );
                }
                JobOutcome::Cancelled | JobOutcome::AlreadyInProgress => {}
            }
        }

        let result = self.finish(&id, started_at, attempt, report, true).await;
        // caller may have gone away
        let _ = job.reply.send(result);
    }

    /// Run one attempt on its own task so a panic cannot take the worker down
    async fn run_attempt(&self, source: Source, cancel: CancellationToken) -> AttemptReport {
        let ctx = Arc::clone(&self.job_ctx);
        let id = source.id.clone();
        let attempt = tokio::spawn(async move { SyncJob::new(&ctx, &source, cancel).run().await });

        match attempt.await {
            Ok(report) => report,
            Err(e) if e.is_panic() => {
                error!(source = %id, error = %e, "sync attempt panicked");
                AttemptReport::failed(CoreError::Panicked(e.to_string()))
            }
            Err(e) => {
                warn!(source = %id, error = %e, "sync attempt aborted");
                AttemptReport::cancelled()
            }
        }
    }

    /// Park a job for its backoff delay, then queue it again
    async fn schedule_retry(self: &Arc<Self>, job: QueuedJob, error: String) {
        let attempt = job.attempts;
        let delay = self.retry_policy.delay_for(attempt);
        let next_eligible_at =
            Utc::now() + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());

        self.retry_states.lock().await.insert(
            job.source.clone(),
            RetryState {
                attempt,
                last_error: Some(error.clone()),
                next_eligible_at: Some(next_eligible_at),
            },
        );

        warn!(source = %job.source, attempt, delay = ?delay, error = %error, "transient failure, retrying");
        let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        let _ = self.job_ctx.events.send(SyncEvent::RetryScheduled {
            source: job.source.clone(),
            attempt,
            delay_ms,
            error,
        });

        let inner = Arc::clone(self);
        let waiter = tokio::spawn(async move {
            tokio::select! {
                () = job.cancel.cancelled() => inner.answer_cancelled(job).await,
                () = tokio::time::sleep(delay) => {
                    inner.queue.push(job).await;
                    // shutdown may have drained the queue before the push above
                    if inner.shutdown.is_cancelled() {
                        inner.drain_queue().await;
                    }
                }
            }
        });

        let mut retries = self.retries.lock().await;
        retries.retain(|handle| !handle.is_finished());
        retries.push(waiter);
    }

    /// Record a terminal outcome in registry and status tracker
    async fn finish(
        &self,
        id: &SourceId,
        started_at: DateTime<Utc>,
        attempts: u32,
        report: AttemptReport,
        registered: bool,
    ) -> JobResult {
        let finished_at = Utc::now();
        let result = JobResult {
            source: id.clone(),
            outcome: report.outcome,
            started_at,
            finished_at,
            attempts,
            counts: report.counts,
            kind_errors: report.kind_errors,
            error: report.error,
        };

        // release the claim before the status flips, so a new claim keeps its token
        self.in_flight.lock().await.remove(id);

        if registered {
            if let Err(e) = self
                .registry
                .record_sync(
                    id,
                    result.outcome.terminal_state(),
                    finished_at,
                    result.outcome.persisted(),
                )
                .await
            {
                warn!(source = %id, error = %e, "failed to record sync in registry");
            }
        }

        let mark = MarkResult {
            source: id.clone(),
            outcome: result.outcome,
            error: result.error.as_ref().map(ToString::to_string),
            failed_kinds: result.failed_kinds(),
            counts: result.counts.clone(),
            finished_at,
        };
        if let Err(e) = self.status.ask(mark).await {
            error!(source = %id, error = %e, "failed to record job result");
        }

        let _ = self.job_ctx.events.send(SyncEvent::JobFinished {
            source: id.clone(),
            outcome: result.outcome,
            counts: result.counts.clone(),
        });

        info!(
            source = %id,
            outcome = %result.outcome,
            attempts,
            records = result.counts.values().sum::<usize>(),
            failed_kinds = result.kind_errors.len(),
            "job finished"
        );

        result
    }

    /// Answer a job that is not running as `cancelled`
    async fn answer_cancelled(&self, job: QueuedJob) {
        let started_at = job.started_at.unwrap_or_else(Utc::now);
        let result = self
            .finish(&job.source, started_at, job.attempts, AttemptReport::cancelled(), true)
            .await;
        let _ = job.reply.send(result);
    }

    async fn drain_queue(&self) {
        while let Some(job) = self.queue.pop().await {
            self.answer_cancelled(job).await;
        }
    }
}

// ============================================================================
// Priority queue
// ============================================================================

struct QueuedJob {
    source: SourceId,
    priority: Priority,
    seq: u64,
    /// Attempts already run
    attempts: u32,
    /// Set when a worker first picks the job up
    started_at: Option<DateTime<Utc>>,
    cancel: CancellationToken,
    reply: oneshot::Sender<JobResult>,
}

impl QueuedJob {
    fn new(
        source: SourceId,
        priority: Priority,
        cancel: CancellationToken,
        reply: oneshot::Sender<JobResult>,
    ) -> Self {
        Self {
            source,
            priority,
            seq: 0,
            attempts: 0,
            started_at: None,
            cancel,
            reply,
        }
    }
}

// higher priority first, then FIFO
impl Ord for QueuedJob {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueuedJob {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for QueuedJob {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QueuedJob {}

#[derive(Default)]
struct JobQueue {
    heap: Mutex<BinaryHeap<QueuedJob>>,
    notify: Notify,
    next_seq: AtomicU64,
}

impl JobQueue {
    async fn push(&self, mut job: QueuedJob) {
        job.seq = self.next_seq.fetch_add(1, AtomicOrdering::Relaxed);
        self.heap.lock().await.push(job);
        self.notify.notify_one();
    }

    async fn pop(&self) -> Option<QueuedJob> {
        let mut heap = self.heap.lock().await;
        let job = heap.pop();
        // pass the wakeup on, a single stored permit may cover several pushes
        if !heap.is_empty() {
            self.notify.notify_one();
        }
        job
    }

    async fn remove(&self, source: &SourceId) -> Option<QueuedJob> {
        let mut heap = self.heap.lock().await;
        let mut jobs = std::mem::take(&mut *heap).into_vec();
        let position = jobs.iter().position(|job| &job.source == source);
        let removed = position.map(|i| jobs.swap_remove(i));
        *heap = BinaryHeap::from(jobs);
        removed
    }
}
