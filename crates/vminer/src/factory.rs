//! Wiring of store, registry, connector and engine from configuration

use std::sync::Arc;

use eyre::{Result, WrapErr};
use vminer_core::{SyncEngine, SyncEngineArgs};
use vminer_session::RestConnector;
use vminer_store::{SourceRegistry, SqliteStore};

use crate::config::Config;

/// Open the SQLite database and register every configured source
///
/// Configured sources are upserted, so descriptors and the active flag follow
/// the config file while recorded sync state survives restarts.
///
/// # Errors
/// Returns error if the database cannot be opened or written
pub async fn open_store(config: &Config) -> Result<Arc<SqliteStore>> {
    let store = SqliteStore::open(&config.database.path)
        .await
        .wrap_err_with(|| {
            format!(
                "failed to open database {}",
                config.database.path.display()
            )
        })?;

    for source in &config.source {
        store
            .upsert_source(&source.to_source())
            .await
            .wrap_err_with(|| format!("failed to register source {}", source.id))?;
    }

    tracing::debug!(
        path = %config.database.path.display(),
        sources = config.source.len(),
        "store opened"
    );

    Ok(Arc::new(store))
}

/// Start a sync engine backed by the given store and the vSphere REST connector
///
/// # Errors
/// Returns error if the engine rejects its config or the registry is unreadable
pub async fn start_engine(config: &Config, store: Arc<SqliteStore>) -> Result<SyncEngine> {
    let engine = SyncEngine::start(SyncEngineArgs {
        config: config.engine.clone(),
        connector: Arc::new(RestConnector::new()),
        store: store.clone(),
        registry: store,
    })
    .await
    .wrap_err("failed to start sync engine")?;

    Ok(engine)
}
