//! Store and registry traits

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use vminer_api::{ResourceKind, SourceId, SyncState};
use vminer_inventory::ResourceRecord;

use crate::error::StoreError;
use crate::source::Source;

/// Outcome of one upsert batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertSummary {
    /// Records inserted or changed
    pub written: usize,
    /// Records already stored with identical content
    pub unchanged: usize,
}

/// Persistent record store
#[async_trait]
pub trait InventoryStore: Send + Sync {
    /// Open a transaction scoped to one source
    async fn begin(&self, source: &SourceId) -> Result<Box<dyn StoreTransaction>, StoreError>;

    /// Committed records of a source, optionally of one kind
    async fn records(
        &self,
        source: &SourceId,
        kind: Option<ResourceKind>,
    ) -> Result<Vec<ResourceRecord>, StoreError>;
}

/// Source-scoped write transaction
///
/// Nothing is visible to readers before `commit`. Dropping the transaction
/// without committing discards every change.
#[async_trait]
pub trait StoreTransaction: Send {
    /// Insert or update records of one kind
    ///
    /// Records whose content is unchanged keep their stored `last_updated`.
    async fn upsert(
        &mut self,
        kind: ResourceKind,
        records: &[ResourceRecord],
    ) -> Result<UpsertSummary, StoreError>;

    /// Delete stored records of one kind whose id is not in `seen_ids`
    ///
    /// Returns the number of deleted records.
    async fn reap_missing(
        &mut self,
        kind: ResourceKind,
        seen_ids: &HashSet<String>,
    ) -> Result<usize, StoreError>;

    /// Make every change visible at once
    async fn commit(self: Box<Self>) -> Result<(), StoreError>;
}

/// Registry of configured sources
#[async_trait]
pub trait SourceRegistry: Send + Sync {
    /// Sources flagged active
    async fn list_active_sources(&self) -> Result<Vec<Source>, StoreError>;

    /// Every registered source
    async fn list_sources(&self) -> Result<Vec<Source>, StoreError>;

    /// Look up one source
    async fn get_source(&self, id: &SourceId) -> Result<Option<Source>, StoreError>;

    /// Register a source or update its descriptor and active flag
    ///
    /// Sync state and timestamps of an existing source are preserved.
    async fn upsert_source(&self, source: &Source) -> Result<(), StoreError>;

    /// Record the terminal state of a job
    ///
    /// `succeeded` also moves `last_successful_sync` to `finished_at`.
    async fn record_sync(
        &self,
        id: &SourceId,
        state: SyncState,
        finished_at: DateTime<Utc>,
        succeeded: bool,
    ) -> Result<(), StoreError>;
}
