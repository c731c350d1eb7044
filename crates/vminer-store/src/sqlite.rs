//! SQLite-backed store and registry

use std::collections::HashSet;
use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use tracing::{debug, info, instrument};
use vminer_api::{ResourceKind, SourceId, SyncState};
use vminer_inventory::ResourceRecord;

use crate::error::StoreError;
use crate::source::Source;
use crate::traits::{InventoryStore, SourceRegistry, StoreTransaction, UpsertSummary};

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS resource_records (
  source_id TEXT NOT NULL,
  kind TEXT NOT NULL,
  remote_id TEXT NOT NULL,
  name TEXT NOT NULL,
  parent_id TEXT NULL,
  attributes TEXT NOT NULL,
  last_updated TEXT NOT NULL,
  PRIMARY KEY (source_id, kind, remote_id)
);
CREATE INDEX IF NOT EXISTS rr_source_kind_idx ON resource_records(source_id, kind);

CREATE TABLE IF NOT EXISTS sources (
  id TEXT PRIMARY KEY,
  descriptor TEXT NOT NULL,
  active INTEGER NOT NULL,
  state TEXT NOT NULL,
  last_successful_sync TEXT NULL
);
";

/// Store and registry in one SQLite database
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open or create a database file
    ///
    /// # Errors
    /// Returns an error if the file cannot be created or the schema cannot be
    /// applied.
    #[instrument]
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite://{}", path.display()))?
            .journal_mode(SqliteJournalMode::Wal)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(opts)
            .await?;

        let store = Self::with_pool(pool).await?;
        info!(path = %path.display(), "database opened");
        Ok(store)
    }

    /// Open a private in-memory database
    ///
    /// # Errors
    /// Returns an error if the schema cannot be applied.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")?;
        // every connection would get its own empty database
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(opts)
            .await?;
        Self::with_pool(pool).await
    }

    async fn with_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        sqlx::query(SCHEMA).execute(&pool).await?;
        Ok(Self { pool })
    }
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("timestamp {value}: {e}")))
}

fn record_from_row(source: &SourceId, row: &SqliteRow) -> Result<ResourceRecord, StoreError> {
    let kind: String = row.try_get("kind")?;
    let attributes: String = row.try_get("attributes")?;
    let last_updated: String = row.try_get("last_updated")?;

    Ok(ResourceRecord {
        source: source.clone(),
        kind: kind
            .parse()
            .map_err(|e| StoreError::Corrupt(format!("{e}")))?,
        remote_id: row.try_get("remote_id")?,
        name: row.try_get("name")?,
        parent_id: row.try_get("parent_id")?,
        attributes: serde_json::from_str(&attributes)?,
        last_updated: parse_timestamp(&last_updated)?,
    })
}

fn source_from_row(row: &SqliteRow) -> Result<Source, StoreError> {
    let id: String = row.try_get("id")?;
    let descriptor: String = row.try_get("descriptor")?;
    let active: bool = row.try_get("active")?;
    let state: String = row.try_get("state")?;
    let last_successful_sync: Option<String> = row.try_get("last_successful_sync")?;

    Ok(Source {
        id: SourceId::new(id),
        descriptor: serde_json::from_str(&descriptor)?,
        active,
        last_successful_sync: last_successful_sync
            .as_deref()
            .map(parse_timestamp)
            .transpose()?,
        state: SyncState::from_stored(&state),
    })
}

#[async_trait]
impl InventoryStore for SqliteStore {
    async fn begin(&self, source: &SourceId) -> Result<Box<dyn StoreTransaction>, StoreError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(SqliteTransaction {
            source: source.clone(),
            tx,
        }))
    }

    async fn records(
        &self,
        source: &SourceId,
        kind: Option<ResourceKind>,
    ) -> Result<Vec<ResourceRecord>, StoreError> {
        let rows = match kind {
            Some(kind) => {
                sqlx::query(
                    r"
SELECT kind, remote_id, name, parent_id, attributes, last_updated
FROM resource_records
WHERE source_id = ?1 AND kind = ?2
ORDER BY kind, remote_id
",
                )
                .bind(source.as_str())
                .bind(kind.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    r"
SELECT kind, remote_id, name, parent_id, attributes, last_updated
FROM resource_records
WHERE source_id = ?1
ORDER BY kind, remote_id
",
                )
                .bind(source.as_str())
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.iter().map(|row| record_from_row(source, row)).collect()
    }
}

/// Transaction over one pooled connection; rolled back on drop
struct SqliteTransaction {
    source: SourceId,
    tx: Transaction<'static, Sqlite>,
}

#[async_trait]
impl StoreTransaction for SqliteTransaction {
    async fn upsert(
        &mut self,
        kind: ResourceKind,
        records: &[ResourceRecord],
    ) -> Result<UpsertSummary, StoreError> {
        let mut summary = UpsertSummary::default();

        for record in records {
            let attributes = serde_json::to_string(&record.attributes)?;
            let result = sqlx::query(
                r"
INSERT INTO resource_records
  (source_id, kind, remote_id, name, parent_id, attributes, last_updated)
VALUES
  (?1, ?2, ?3, ?4, ?5, ?6, ?7)
ON CONFLICT(source_id, kind, remote_id) DO UPDATE SET
  name = excluded.name,
  parent_id = excluded.parent_id,
  attributes = excluded.attributes,
  last_updated = excluded.last_updated
WHERE resource_records.name IS NOT excluded.name
   OR resource_records.parent_id IS NOT excluded.parent_id
   OR resource_records.attributes IS NOT excluded.attributes
",
            )
            .bind(self.source.as_str())
            .bind(kind.as_str())
            .bind(&record.remote_id)
            .bind(&record.name)
            .bind(record.parent_id.as_deref())
            .bind(attributes)
            .bind(record.last_updated.to_rfc3339())
            .execute(&mut *self.tx)
            .await?;

            if result.rows_affected() > 0 {
                summary.written += 1;
            } else {
                summary.unchanged += 1;
            }
        }

        Ok(summary)
    }

    async fn reap_missing(
        &mut self,
        kind: ResourceKind,
        seen_ids: &HashSet<String>,
    ) -> Result<usize, StoreError> {
        let rows = sqlx::query(
            "SELECT remote_id FROM resource_records WHERE source_id = ?1 AND kind = ?2",
        )
        .bind(self.source.as_str())
        .bind(kind.as_str())
        .fetch_all(&mut *self.tx)
        .await?;

        let mut reaped = 0;
        for row in rows {
            let remote_id: String = row.try_get("remote_id")?;
            if seen_ids.contains(&remote_id) {
                continue;
            }
            sqlx::query(
                "DELETE FROM resource_records WHERE source_id = ?1 AND kind = ?2 AND remote_id = ?3",
            )
            .bind(self.source.as_str())
            .bind(kind.as_str())
            .bind(&remote_id)
            .execute(&mut *self.tx)
            .await?;
            reaped += 1;
        }

        Ok(reaped)
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        debug!(source = %self.source, "committing");
        self.tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl SourceRegistry for SqliteStore {
    async fn list_active_sources(&self) -> Result<Vec<Source>, StoreError> {
        let rows = sqlx::query("SELECT * FROM sources WHERE active = 1 ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(source_from_row).collect()
    }

    async fn list_sources(&self) -> Result<Vec<Source>, StoreError> {
        let rows = sqlx::query("SELECT * FROM sources ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(source_from_row).collect()
    }

    async fn get_source(&self, id: &SourceId) -> Result<Option<Source>, StoreError> {
        let row = sqlx::query("SELECT * FROM sources WHERE id = ?1")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(source_from_row).transpose()
    }

    async fn upsert_source(&self, source: &Source) -> Result<(), StoreError> {
        let descriptor = serde_json::to_string(&source.descriptor)?;
        sqlx::query(
            r"
INSERT INTO sources (id, descriptor, active, state, last_successful_sync)
VALUES (?1, ?2, ?3, ?4, ?5)
ON CONFLICT(id) DO UPDATE SET
  descriptor = excluded.descriptor,
  active = excluded.active
",
        )
        .bind(source.id.as_str())
        .bind(descriptor)
        .bind(source.active)
        .bind(source.state.as_str())
        .bind(source.last_successful_sync.map(|t| t.to_rfc3339()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_sync(
        &self,
        id: &SourceId,
        state: SyncState,
        finished_at: DateTime<Utc>,
        succeeded: bool,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r"
UPDATE sources
SET state = ?2,
    last_successful_sync = CASE WHEN ?3 THEN ?4 ELSE last_successful_sync END
WHERE id = ?1
",
        )
        .bind(id.as_str())
        .bind(state.as_str())
        .bind(succeeded)
        .bind(finished_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::SourceNotFound(id.clone()));
        }
        Ok(())
    }
}
