use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use vminer_api::{JobOutcome, Priority, ResourceKind, SourceId, SyncEvent, SyncState};
use vminer_core::*;
use vminer_inventory::ResourceRecord;
use vminer_session::{
    ConnectionDescriptor, Connector, RemoteObject, Session, SessionError, SnapshotTree,
};
use vminer_store::{
    InventoryStore, MemoryRegistry, MemoryStore, Source, SourceRegistry, StoreError,
    StoreTransaction, UpsertSummary,
};

// Mock endpoint

#[derive(Clone, Default)]
struct Inventory {
    connect_error: Option<SessionError>,
    roots: HashMap<ResourceKind, Vec<RemoteObject>>,
    children: HashMap<(ResourceKind, String), Vec<RemoteObject>>,
    snapshots: HashMap<String, Vec<SnapshotTree>>,
    failing: HashSet<ResourceKind>,
    panicking: Option<ResourceKind>,
    delay: Duration,
}

impl Inventory {
    fn with_vms(count: usize) -> Self {
        let mut inventory = Self::default();
        inventory.set_vms(count);
        inventory
    }

    fn set_vms(&mut self, count: usize) {
        let vms = (0..count)
            .map(|i| RemoteObject::new(format!("vm-{i}"), format!("web-{i:03}")))
            .collect();
        self.roots.insert(ResourceKind::VirtualMachine, vms);
    }

    fn set_hosts(&mut self, count: usize) {
        let hosts = (0..count)
            .map(|i| RemoteObject::new(format!("host-{i}"), format!("esx{i:02}.lab")))
            .collect();
        self.roots.insert(ResourceKind::Host, hosts);
    }

    fn with_snapshots(&mut self, vm_id: &str, names: &[&str]) {
        let trees = names
            .iter()
            .map(|name| SnapshotTree::leaf(RemoteObject::new(format!("snapshot-{name}"), *name)))
            .collect();
        self.snapshots.insert(vm_id.to_string(), trees);
    }

    fn request_error(kind: ResourceKind) -> SessionError {
        SessionError::Request(format!("{kind} listing failed"))
    }
}

#[derive(Default)]
struct MockConnector {
    endpoints: Mutex<HashMap<String, Inventory>>,
    connects: AtomicUsize,
    open: Arc<AtomicUsize>,
    max_open: Arc<AtomicUsize>,
}

impl MockConnector {
    fn set(&self, endpoint: &str, inventory: Inventory) {
        self.endpoints
            .lock()
            .unwrap()
            .insert(endpoint.to_string(), inventory);
    }

    fn update(&self, endpoint: &str, f: impl FnOnce(&mut Inventory)) {
        let mut endpoints = self.endpoints.lock().unwrap();
        f(endpoints.entry(endpoint.to_string()).or_default());
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(
        &self,
        descriptor: &ConnectionDescriptor,
        _timeout: Duration,
    ) -> Result<Box<dyn Session>, SessionError> {
        self.connects.fetch_add(1, Ordering::SeqCst);

        let inventory = self
            .endpoints
            .lock()
            .unwrap()
            .get(&descriptor.endpoint)
            .cloned()
            .ok_or_else(|| SessionError::Connect("no route to host".to_string()))?;

        if let Some(err) = inventory.connect_error.clone() {
            return Err(err);
        }

        let open = self.open.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_open.fetch_max(open, Ordering::SeqCst);

        Ok(Box::new(MockSession {
            inventory,
            open: Arc::clone(&self.open),
        }))
    }
}

struct MockSession {
    inventory: Inventory,
    open: Arc<AtomicUsize>,
}

#[async_trait]
impl Session for MockSession {
    async fn list(
        &self,
        kind: ResourceKind,
        _limit: Option<usize>,
    ) -> Result<Vec<RemoteObject>, SessionError> {
        tokio::time::sleep(self.inventory.delay).await;
        if self.inventory.panicking == Some(kind) {
            panic!("{kind} listing blew up");
        }
        if self.inventory.failing.contains(&kind) {
            return Err(Inventory::request_error(kind));
        }
        Ok(self.inventory.roots.get(&kind).cloned().unwrap_or_default())
    }

    async fn list_children(
        &self,
        kind: ResourceKind,
        parent_id: &str,
    ) -> Result<Vec<RemoteObject>, SessionError> {
        if self.inventory.failing.contains(&kind) {
            return Err(Inventory::request_error(kind));
        }
        Ok(self
            .inventory
            .children
            .get(&(kind, parent_id.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    async fn snapshot_tree(&self, vm_id: &str) -> Result<Vec<SnapshotTree>, SessionError> {
        if self.inventory.failing.contains(&ResourceKind::Snapshot) {
            return Err(Inventory::request_error(ResourceKind::Snapshot));
        }
        Ok(self
            .inventory
            .snapshots
            .get(vm_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn close(&self) -> Result<(), SessionError> {
        self.open.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }

    fn session_type(&self) -> &'static str {
        "mock"
    }
}

// Store whose commits can be made to fail

#[derive(Default)]
struct FlakyStore {
    inner: MemoryStore,
    fail_commit: Arc<AtomicBool>,
}

struct FlakyTransaction {
    inner: Box<dyn StoreTransaction>,
    fail_commit: bool,
}

#[async_trait]
impl InventoryStore for FlakyStore {
    async fn begin(&self, source: &SourceId) -> Result<Box<dyn StoreTransaction>, StoreError> {
        Ok(Box::new(FlakyTransaction {
            inner: self.inner.begin(source).await?,
            fail_commit: self.fail_commit.load(Ordering::SeqCst),
        }))
    }

    async fn records(
        &self,
        source: &SourceId,
        kind: Option<ResourceKind>,
    ) -> Result<Vec<ResourceRecord>, StoreError> {
        self.inner.records(source, kind).await
    }
}

#[async_trait]
impl StoreTransaction for FlakyTransaction {
    async fn upsert(
        &mut self,
        kind: ResourceKind,
        records: &[ResourceRecord],
    ) -> Result<UpsertSummary, StoreError> {
        self.inner.upsert(kind, records).await
    }

    async fn reap_missing(
        &mut self,
        kind: ResourceKind,
        seen_ids: &HashSet<String>,
    ) -> Result<usize, StoreError> {
        self.inner.reap_missing(kind, seen_ids).await
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        if self.fail_commit {
            return Err(StoreError::Corrupt("disk full".to_string()));
        }
        self.inner.commit().await
    }
}

// Helpers

fn source(id: &str) -> Source {
    Source::new(
        id,
        ConnectionDescriptor::new(format!("https://{id}.lab"), "svc-inventory", "secret"),
    )
}

fn config(kinds: &[ResourceKind]) -> EngineConfig {
    EngineConfig {
        pool_size: 4,
        kinds: kinds.to_vec(),
        retry: RetryConfig {
            max_attempts: 3,
            base_delay_ms: 10,
            max_delay_ms: 40,
        },
        ..EngineConfig::default()
    }
}

struct Harness {
    engine: SyncEngine,
    connector: Arc<MockConnector>,
    store: Arc<dyn InventoryStore>,
    registry: Arc<MemoryRegistry>,
}

impl Harness {
    async fn start(config: EngineConfig, sources: Vec<Source>) -> Self {
        Self::start_with_store(config, sources, Arc::new(MemoryStore::new())).await
    }

    async fn start_with_store(
        config: EngineConfig,
        sources: Vec<Source>,
        store: Arc<dyn InventoryStore>,
    ) -> Self {
        let connector = Arc::new(MockConnector::default());
        let registry = Arc::new(MemoryRegistry::with_sources(sources));

        let engine = SyncEngine::start(SyncEngineArgs {
            config,
            connector: connector.clone(),
            store: Arc::clone(&store),
            registry: registry.clone(),
        })
        .await
        .unwrap();

        Self {
            engine,
            connector,
            store,
            registry,
        }
    }

    async fn sync_one(&self, id: &str) -> JobResult {
        let mut results = self
            .engine
            .sync_sources(&[SourceId::new(id)], Priority::Normal)
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        results.remove(0)
    }

    async fn records(&self, id: &str, kind: ResourceKind) -> Vec<ResourceRecord> {
        self.store
            .records(&SourceId::new(id), Some(kind))
            .await
            .unwrap()
    }
}

const VM_HOST: &[ResourceKind] = &[ResourceKind::VirtualMachine, ResourceKind::Host];

// Tests

#[tokio::test]
async fn test_sync_persists_records_and_updates_status() {
    let h = Harness::start(config(VM_HOST), vec![source("vc01")]).await;
    let mut inventory = Inventory::with_vms(3);
    inventory.set_hosts(2);
    h.connector.set("https://vc01.lab", inventory);

    let result = h.sync_one("vc01").await;

    assert_eq!(result.outcome, JobOutcome::Success);
    assert_eq!(result.attempts, 1);
    assert_eq!(result.counts.get(&ResourceKind::VirtualMachine), Some(&3));
    assert_eq!(result.counts.get(&ResourceKind::Host), Some(&2));
    assert_eq!(h.records("vc01", ResourceKind::VirtualMachine).await.len(), 3);

    let status = h.engine.status(&SourceId::new("vc01")).await.unwrap();
    assert_eq!(status.state, SyncState::Completed);
    assert_eq!(status.last_outcome, Some(JobOutcome::Success));
    assert!(status.last_successful_sync.is_some());

    let stored = h
        .registry
        .get_source(&SourceId::new("vc01"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.state, SyncState::Completed);
    assert_eq!(stored.last_successful_sync, status.last_successful_sync);

    h.engine.shutdown().await;
}

#[tokio::test]
async fn test_unchanged_inventory_is_a_noop() {
    let h = Harness::start(config(VM_HOST), vec![source("vc01")]).await;
    h.connector.set("https://vc01.lab", Inventory::with_vms(5));

    h.sync_one("vc01").await;
    let first = h.records("vc01", ResourceKind::VirtualMachine).await;

    tokio::time::sleep(Duration::from_millis(5)).await;
    let result = h.sync_one("vc01").await;
    let second = h.records("vc01", ResourceKind::VirtualMachine).await;

    assert_eq!(result.outcome, JobOutcome::Success);
    assert_eq!(first, second);

    h.engine.shutdown().await;
}

#[tokio::test]
async fn test_vanished_records_are_reaped() {
    let h = Harness::start(config(VM_HOST), vec![source("vc01")]).await;
    h.connector.set("https://vc01.lab", Inventory::with_vms(4));
    h.sync_one("vc01").await;

    h.connector.update("https://vc01.lab", |inv| inv.set_vms(2));
    h.sync_one("vc01").await;

    let ids: Vec<String> = h
        .records("vc01", ResourceKind::VirtualMachine)
        .await
        .into_iter()
        .map(|r| r.remote_id)
        .collect();
    assert_eq!(ids, vec!["vm-0".to_string(), "vm-1".to_string()]);

    h.engine.shutdown().await;
}

#[tokio::test]
async fn test_empty_collection_reaps_whole_kind() {
    let h = Harness::start(config(VM_HOST), vec![source("vc01")]).await;
    let mut inventory = Inventory::with_vms(3);
    inventory.set_hosts(1);
    h.connector.set("https://vc01.lab", inventory);
    h.sync_one("vc01").await;

    h.connector.update("https://vc01.lab", |inv| inv.set_vms(0));
    let result = h.sync_one("vc01").await;

    assert_eq!(result.outcome, JobOutcome::Success);
    assert!(h.records("vc01", ResourceKind::VirtualMachine).await.is_empty());
    assert_eq!(h.records("vc01", ResourceKind::Host).await.len(), 1);

    h.engine.shutdown().await;
}

#[tokio::test]
async fn test_failed_kind_keeps_previous_records() {
    let h = Harness::start(config(VM_HOST), vec![source("vc01")]).await;
    let mut inventory = Inventory::with_vms(2);
    inventory.set_hosts(3);
    h.connector.set("https://vc01.lab", inventory);
    h.sync_one("vc01").await;

    h.connector.update("https://vc01.lab", |inv| {
        inv.set_hosts(0);
        inv.failing.insert(ResourceKind::Host);
    });
    let result = h.sync_one("vc01").await;

    assert_eq!(result.outcome, JobOutcome::Partial);
    assert_eq!(result.failed_kinds(), vec![ResourceKind::Host]);
    assert_eq!(h.records("vc01", ResourceKind::Host).await.len(), 3);

    let status = h.engine.status(&SourceId::new("vc01")).await.unwrap();
    assert_eq!(status.state, SyncState::Completed);
    assert_eq!(status.failed_kinds, vec![ResourceKind::Host]);

    h.engine.shutdown().await;
}

#[tokio::test]
async fn test_large_inventory_with_failing_snapshots_is_partial() {
    let kinds = [
        ResourceKind::VirtualMachine,
        ResourceKind::Host,
        ResourceKind::Snapshot,
    ];
    let h = Harness::start(config(&kinds), vec![source("vc01")]).await;
    let mut inventory = Inventory::with_vms(500);
    inventory.set_hosts(10);
    inventory.with_snapshots("vm-0", &["before-upgrade", "nightly"]);
    inventory.with_snapshots("vm-7", &["golden"]);
    h.connector.set("https://vc01.lab", inventory);

    let first = h.sync_one("vc01").await;
    assert_eq!(first.outcome, JobOutcome::Success);
    assert_eq!(first.counts.get(&ResourceKind::Snapshot), Some(&3));
    let stored_snapshots = h.records("vc01", ResourceKind::Snapshot).await;
    assert_eq!(stored_snapshots.len(), 3);

    h.connector.update("https://vc01.lab", |inv| {
        inv.snapshots.clear();
        inv.failing.insert(ResourceKind::Snapshot);
    });
    let result = h.sync_one("vc01").await;

    assert_eq!(result.outcome, JobOutcome::Partial);
    assert_eq!(result.counts.get(&ResourceKind::VirtualMachine), Some(&500));
    assert_eq!(result.counts.get(&ResourceKind::Host), Some(&10));
    assert_eq!(result.counts.get(&ResourceKind::Snapshot), Some(&0));
    assert_eq!(result.kind_errors.len(), 1);
    assert_eq!(result.kind_errors[0].kind, ResourceKind::Snapshot);
    assert_eq!(h.records("vc01", ResourceKind::VirtualMachine).await.len(), 500);
    assert_eq!(h.records("vc01", ResourceKind::Host).await.len(), 10);
    assert_eq!(h.records("vc01", ResourceKind::Snapshot).await, stored_snapshots);

    h.engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_panicking_session_fails_job_and_frees_source() {
    let mut cfg = config(VM_HOST);
    cfg.pool_size = 1;
    let h = Harness::start(cfg, vec![source("vc01")]).await;
    let mut inventory = Inventory::with_vms(2);
    inventory.panicking = Some(ResourceKind::VirtualMachine);
    h.connector.set("https://vc01.lab", inventory);

    let result = h.sync_one("vc01").await;

    assert_eq!(result.outcome, JobOutcome::Failed);
    assert!(matches!(result.error, Some(CoreError::Panicked(_))));
    assert_eq!(result.attempts, 1);

    let status = h.engine.status(&SourceId::new("vc01")).await.unwrap();
    assert_eq!(status.state, SyncState::Failed);

    // the unwound lease closes in the background
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.connector.open.load(Ordering::SeqCst), 0);

    // the single worker survived and the source can sync again
    h.connector.update("https://vc01.lab", |inv| inv.panicking = None);
    let result = h.sync_one("vc01").await;
    assert_eq!(result.outcome, JobOutcome::Success);
    assert_eq!(h.records("vc01", ResourceKind::VirtualMachine).await.len(), 2);

    h.engine.shutdown().await;
}

#[tokio::test]
async fn test_connect_failure_leaves_records_unchanged() {
    let h = Harness::start(config(VM_HOST), vec![source("vc01")]).await;
    h.connector.set("https://vc01.lab", Inventory::with_vms(3));
    let ok = h.sync_one("vc01").await;
    let before = h.records("vc01", ResourceKind::VirtualMachine).await;

    h.connector.update("https://vc01.lab", |inv| {
        inv.connect_error = Some(SessionError::Auth("invalid credentials".to_string()));
    });
    let result = h.sync_one("vc01").await;

    assert_eq!(result.outcome, JobOutcome::Failed);
    assert!(matches!(result.error, Some(CoreError::Auth(_))));
    assert_eq!(h.records("vc01", ResourceKind::VirtualMachine).await, before);

    let status = h.engine.status(&SourceId::new("vc01")).await.unwrap();
    assert_eq!(status.state, SyncState::Failed);
    assert!(status.error.unwrap().contains("invalid credentials"));
    assert_eq!(status.last_successful_sync, Some(ok.finished_at));

    h.engine.shutdown().await;
}

#[tokio::test]
async fn test_auth_failure_is_not_retried() {
    let h = Harness::start(config(VM_HOST), vec![source("vc01")]).await;
    h.connector.update("https://vc01.lab", |inv| {
        inv.connect_error = Some(SessionError::Auth("401".to_string()));
    });

    let result = h.sync_one("vc01").await;

    assert_eq!(result.attempts, 1);
    assert_eq!(h.connector.connects.load(Ordering::SeqCst), 1);

    h.engine.shutdown().await;
}

#[tokio::test]
async fn test_transient_failure_retries_with_backoff() {
    let h = Harness::start(config(VM_HOST), vec![source("vc01")]).await;
    h.connector.update("https://vc01.lab", |inv| {
        inv.connect_error = Some(SessionError::Connect("connection refused".to_string()));
    });
    let mut events = h.engine.subscribe();

    let result = h.sync_one("vc01").await;

    assert_eq!(result.outcome, JobOutcome::Failed);
    assert_eq!(result.attempts, 3);
    assert_eq!(h.connector.connects.load(Ordering::SeqCst), 3);

    let mut delays = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let SyncEvent::RetryScheduled { delay_ms, .. } = event {
            delays.push(delay_ms);
        }
    }
    assert_eq!(delays, vec![10, 20]);

    let retry = h.engine.retry_state(&SourceId::new("vc01")).await.unwrap();
    assert_eq!(retry.attempt, 3);
    assert!(retry.last_error.unwrap().contains("connection refused"));
    assert!(retry.next_eligible_at.is_none());

    // recovery clears the bookkeeping
    h.connector.set("https://vc01.lab", Inventory::with_vms(1));
    let result = h.sync_one("vc01").await;
    assert_eq!(result.outcome, JobOutcome::Success);
    assert!(h.engine.retry_state(&SourceId::new("vc01")).await.is_none());

    h.engine.shutdown().await;
}

#[tokio::test]
async fn test_all_kinds_failing_fails_the_job() {
    let h = Harness::start(config(VM_HOST), vec![source("vc01")]).await;
    h.connector.update("https://vc01.lab", |inv| {
        inv.failing.insert(ResourceKind::VirtualMachine);
        inv.failing.insert(ResourceKind::Host);
    });

    let result = h.sync_one("vc01").await;

    assert_eq!(result.outcome, JobOutcome::Failed);
    assert!(matches!(
        result.error,
        Some(CoreError::AllKindsFailed { failed: 2 })
    ));
    assert_eq!(result.attempts, 1);

    h.engine.shutdown().await;
}

#[tokio::test]
async fn test_persistence_failure_rolls_back() {
    let store = Arc::new(FlakyStore::default());
    let fail_commit = Arc::clone(&store.fail_commit);
    let h = Harness::start_with_store(config(VM_HOST), vec![source("vc01")], store).await;

    h.connector.set("https://vc01.lab", Inventory::with_vms(2));
    h.sync_one("vc01").await;

    fail_commit.store(true, Ordering::SeqCst);
    h.connector.update("https://vc01.lab", |inv| inv.set_vms(6));
    let result = h.sync_one("vc01").await;

    assert_eq!(result.outcome, JobOutcome::Failed);
    assert!(matches!(result.error, Some(CoreError::Persistence(_))));
    assert_eq!(h.records("vc01", ResourceKind::VirtualMachine).await.len(), 2);

    h.engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_second_request_for_busy_source_is_rejected() {
    let h = Harness::start(config(VM_HOST), vec![source("vc01")]).await;
    let mut inventory = Inventory::with_vms(1);
    inventory.delay = Duration::from_millis(200);
    h.connector.set("https://vc01.lab", inventory);

    let engine = h.engine.clone();
    let first = tokio::spawn(async move {
        engine
            .sync_sources(&[SourceId::new("vc01")], Priority::Normal)
            .await
            .unwrap()
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    let status = h.engine.status(&SourceId::new("vc01")).await.unwrap();
    assert_eq!(status.state, SyncState::Syncing);

    let second = h.sync_one("vc01").await;
    assert_eq!(second.outcome, JobOutcome::AlreadyInProgress);
    assert_eq!(second.attempts, 0);

    let first = first.await.unwrap();
    assert_eq!(first[0].outcome, JobOutcome::Success);
    assert_eq!(h.connector.connects.load(Ordering::SeqCst), 1);

    h.engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_pool_size_bounds_concurrent_jobs() {
    let mut cfg = config(VM_HOST);
    cfg.pool_size = 2;
    let h = Harness::start(cfg, vec![source("vc01"), source("vc02"), source("vc03")]).await;
    for id in ["vc01", "vc02", "vc03"] {
        let mut inventory = Inventory::with_vms(2);
        inventory.delay = Duration::from_millis(50);
        h.connector.set(&format!("https://{id}.lab"), inventory);
    }

    let results = h.engine.sync_all_active(Priority::Normal).await.unwrap();

    assert_eq!(results.len(), 3);
    assert!(results.iter().all(|r| r.outcome == JobOutcome::Success));
    assert_eq!(h.connector.max_open.load(Ordering::SeqCst), 2);

    h.engine.shutdown().await;
}

#[tokio::test]
async fn test_sync_all_active_skips_inactive_sources() {
    let h = Harness::start(
        config(VM_HOST),
        vec![source("vc01"), source("vc02").inactive()],
    )
    .await;
    h.connector.set("https://vc01.lab", Inventory::with_vms(1));
    h.connector.set("https://vc02.lab", Inventory::with_vms(1));

    let results = h.engine.sync_all_active(Priority::High).await.unwrap();

    assert_eq!(results.len(), 1);
    assert_eq!(results[0].source, SourceId::new("vc01"));

    // explicit requests still reach inactive sources
    let result = h.sync_one("vc02").await;
    assert_eq!(result.outcome, JobOutcome::Success);

    h.engine.shutdown().await;
}

#[tokio::test]
async fn test_duplicate_and_unknown_ids() {
    let h = Harness::start(config(VM_HOST), vec![source("vc01")]).await;
    h.connector.set("https://vc01.lab", Inventory::with_vms(1));

    let results = h
        .engine
        .sync_sources(
            &[
                SourceId::new("vc01"),
                SourceId::new("ghost"),
                SourceId::new("vc01"),
            ],
            Priority::Normal,
        )
        .await
        .unwrap();

    assert_eq!(results.len(), 2);
    assert_eq!(results[0].outcome, JobOutcome::Success);
    assert_eq!(results[1].outcome, JobOutcome::Failed);
    assert!(matches!(results[1].error, Some(CoreError::SourceNotFound(_))));

    h.engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancel_during_collection_persists_nothing() {
    let h = Harness::start(config(VM_HOST), vec![source("vc01")]).await;
    let mut inventory = Inventory::with_vms(10);
    inventory.delay = Duration::from_millis(500);
    h.connector.set("https://vc01.lab", inventory);

    let engine = h.engine.clone();
    let job = tokio::spawn(async move {
        engine
            .sync_sources(&[SourceId::new("vc01")], Priority::Normal)
            .await
            .unwrap()
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.engine.cancel_source(&SourceId::new("vc01")).await);

    let results = job.await.unwrap();
    assert_eq!(results[0].outcome, JobOutcome::Cancelled);
    assert!(h.records("vc01", ResourceKind::VirtualMachine).await.is_empty());

    let status = h.engine.status(&SourceId::new("vc01")).await.unwrap();
    assert_eq!(status.state, SyncState::Cancelled);

    // dropped leases close in the background
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.connector.open.load(Ordering::SeqCst), 0);

    assert!(!h.engine.cancel_source(&SourceId::new("vc01")).await);

    h.engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_higher_priority_runs_first() {
    let mut cfg = config(VM_HOST);
    cfg.pool_size = 1;
    let h = Harness::start(cfg, vec![source("busy"), source("low"), source("high")]).await;
    let mut busy = Inventory::with_vms(1);
    busy.delay = Duration::from_millis(150);
    h.connector.set("https://busy.lab", busy);
    h.connector.set("https://low.lab", Inventory::with_vms(1));
    h.connector.set("https://high.lab", Inventory::with_vms(1));
    let mut events = h.engine.subscribe();

    let mut handles = Vec::new();
    for (id, priority) in [
        ("busy", Priority::Normal),
        ("low", Priority::Low),
        ("high", Priority::High),
    ] {
        let engine = h.engine.clone();
        handles.push(tokio::spawn(async move {
            engine.sync_sources(&[SourceId::new(id)], priority).await
        }));
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let mut finished = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let SyncEvent::JobFinished { source, .. } = event {
            finished.push(source.to_string());
        }
    }
    assert_eq!(finished, vec!["busy", "high", "low"]);

    h.engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_retry_backoff_frees_the_worker() {
    let mut cfg = config(VM_HOST);
    cfg.pool_size = 1;
    cfg.retry = RetryConfig {
        max_attempts: 2,
        base_delay_ms: 200,
        max_delay_ms: 400,
    };
    let h = Harness::start(cfg, vec![source("flaky"), source("healthy")]).await;
    h.connector.update("https://flaky.lab", |inv| {
        inv.connect_error = Some(SessionError::Connect("connection reset".to_string()));
    });
    h.connector.set("https://healthy.lab", Inventory::with_vms(1));
    let mut events = h.engine.subscribe();

    let results = h
        .engine
        .sync_sources(
            &[SourceId::new("flaky"), SourceId::new("healthy")],
            Priority::Normal,
        )
        .await
        .unwrap();

    assert_eq!(results[0].outcome, JobOutcome::Failed);
    assert_eq!(results[0].attempts, 2);
    assert_eq!(results[1].outcome, JobOutcome::Success);

    let mut finished = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let SyncEvent::JobFinished { source, .. } = event {
            finished.push(source.to_string());
        }
    }
    assert_eq!(finished, vec!["healthy", "flaky"]);

    h.engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancel_during_retry_backoff() {
    let mut cfg = config(VM_HOST);
    cfg.retry = RetryConfig {
        max_attempts: 3,
        base_delay_ms: 5_000,
        max_delay_ms: 10_000,
    };
    let h = Harness::start(cfg, vec![source("vc01")]).await;
    h.connector.update("https://vc01.lab", |inv| {
        inv.connect_error = Some(SessionError::Connect("connection refused".to_string()));
    });

    let engine = h.engine.clone();
    let job = tokio::spawn(async move {
        engine
            .sync_sources(&[SourceId::new("vc01")], Priority::Normal)
            .await
            .unwrap()
    });

    tokio::time::sleep(Duration::from_millis(100)).await;
    let retry = h.engine.retry_state(&SourceId::new("vc01")).await.unwrap();
    assert!(retry.next_eligible_at.is_some());
    assert!(h.engine.cancel_source(&SourceId::new("vc01")).await);

    let results = job.await.unwrap();
    assert_eq!(results[0].outcome, JobOutcome::Cancelled);
    assert_eq!(results[0].attempts, 1);
    assert_eq!(h.connector.connects.load(Ordering::SeqCst), 1);

    h.engine.shutdown().await;
}

#[tokio::test]
async fn test_requests_after_shutdown_are_cancelled() {
    let h = Harness::start(config(VM_HOST), vec![source("vc01")]).await;
    h.connector.set("https://vc01.lab", Inventory::with_vms(1));

    h.engine.shutdown().await;
    let result = h.sync_one("vc01").await;

    assert_eq!(result.outcome, JobOutcome::Cancelled);
    assert_eq!(h.connector.connects.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_invalid_config_is_rejected() {
    let mut cfg = config(VM_HOST);
    cfg.pool_size = 0;

    let result = SyncEngine::start(SyncEngineArgs {
        config: cfg,
        connector: Arc::new(MockConnector::default()),
        store: Arc::new(MemoryStore::new()),
        registry: Arc::new(MemoryRegistry::default()),
    })
    .await;

    assert!(matches!(result, Err(CoreError::ConfigError(_))));
}
