//! In-memory store and registry
//!
//! A transaction works on a private copy of its source's records and swaps it
//! in on commit.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::debug;
use vminer_api::{ResourceKind, SourceId, SyncState};
use vminer_inventory::ResourceRecord;

use crate::error::StoreError;
use crate::source::Source;
use crate::traits::{InventoryStore, SourceRegistry, StoreTransaction, UpsertSummary};

type SourceRecords = BTreeMap<(ResourceKind, String), ResourceRecord>;

/// Record store held in memory
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    records: Arc<RwLock<HashMap<SourceId, SourceRecords>>>,
}

impl MemoryStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of committed records of a source
    pub async fn count(&self, source: &SourceId) -> usize {
        self.records
            .read()
            .await
            .get(source)
            .map_or(0, BTreeMap::len)
    }
}

#[async_trait]
impl InventoryStore for MemoryStore {
    async fn begin(&self, source: &SourceId) -> Result<Box<dyn StoreTransaction>, StoreError> {
        let working = self
            .records
            .read()
            .await
            .get(source)
            .cloned()
            .unwrap_or_default();

        Ok(Box::new(MemoryTransaction {
            source: source.clone(),
            working,
            records: Arc::clone(&self.records),
        }))
    }

    async fn records(
        &self,
        source: &SourceId,
        kind: Option<ResourceKind>,
    ) -> Result<Vec<ResourceRecord>, StoreError> {
        let guard = self.records.read().await;
        Ok(guard
            .get(source)
            .map(|records| {
                records
                    .values()
                    .filter(|r| kind.is_none_or(|k| r.kind == k))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

struct MemoryTransaction {
    source: SourceId,
    working: SourceRecords,
    records: Arc<RwLock<HashMap<SourceId, SourceRecords>>>,
}

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    async fn upsert(
        &mut self,
        kind: ResourceKind,
        records: &[ResourceRecord],
    ) -> Result<UpsertSummary, StoreError> {
        let mut summary = UpsertSummary::default();

        for record in records {
            let key = (kind, record.remote_id.clone());
            match self.working.get(&key) {
                Some(existing) if existing.same_content(record) => summary.unchanged += 1,
                _ => {
                    self.working.insert(key, record.clone());
                    summary.written += 1;
                }
            }
        }

        Ok(summary)
    }

    async fn reap_missing(
        &mut self,
        kind: ResourceKind,
        seen_ids: &HashSet<String>,
    ) -> Result<usize, StoreError> {
        let before = self.working.len();
        self.working
            .retain(|(k, id), _| *k != kind || seen_ids.contains(id));
        Ok(before - self.working.len())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let MemoryTransaction {
            source,
            working,
            records,
        } = *self;

        debug!(source = %source, records = working.len(), "committing");
        records.write().await.insert(source, working);
        Ok(())
    }
}

/// Source registry held in memory
#[derive(Debug, Clone, Default)]
pub struct MemoryRegistry {
    sources: Arc<RwLock<BTreeMap<SourceId, Source>>>,
}

impl MemoryRegistry {
    /// Create a registry pre-filled with sources
    #[must_use]
    pub fn with_sources(sources: impl IntoIterator<Item = Source>) -> Self {
        let sources = sources.into_iter().map(|s| (s.id.clone(), s)).collect();
        Self {
            sources: Arc::new(RwLock::new(sources)),
        }
    }
}

#[async_trait]
impl SourceRegistry for MemoryRegistry {
    async fn list_active_sources(&self) -> Result<Vec<Source>, StoreError> {
        Ok(self
            .sources
            .read()
            .await
            .values()
            .filter(|s| s.active)
            .cloned()
            .collect())
    }

    async fn list_sources(&self) -> Result<Vec<Source>, StoreError> {
        Ok(self.sources.read().await.values().cloned().collect())
    }

    async fn get_source(&self, id: &SourceId) -> Result<Option<Source>, StoreError> {
        Ok(self.sources.read().await.get(id).cloned())
    }

    async fn upsert_source(&self, source: &Source) -> Result<(), StoreError> {
        let mut sources = self.sources.write().await;
        match sources.get_mut(&source.id) {
            Some(existing) => {
                existing.descriptor = source.descriptor.clone();
                existing.active = source.active;
            }
            None => {
                sources.insert(source.id.clone(), source.clone());
            }
        }
        Ok(())
    }

    async fn record_sync(
        &self,
        id: &SourceId,
        state: SyncState,
        finished_at: DateTime<Utc>,
        succeeded: bool,
    ) -> Result<(), StoreError> {
        let mut sources = self.sources.write().await;
        let source = sources
            .get_mut(id)
            .ok_or_else(|| StoreError::SourceNotFound(id.clone()))?;
        source.state = state;
        if succeeded {
            source.last_successful_sync = Some(finished_at);
        }
        Ok(())
    }
}
