//! vminer
//!
//! Synchronizes vCenter inventories into a local SQLite database.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use color_eyre::Result;
use eyre::{WrapErr, bail};
use serde::Serialize;
use tracing_subscriber::EnvFilter;
use vminer_api::{JobOutcome, Priority, ResourceKind, SourceId, SyncState};
use vminer_core::{JobResult, SyncEngine};
use vminer_store::{InventoryStore, SourceRegistry};

mod config;
mod factory;

use config::{Config, LogFormat};

#[derive(Parser)]
#[command(name = "vminer")]
#[command(about = "Multi-source vCenter inventory sync", long_about = None)]
struct Cli {
    /// Config file, overrides the default search path
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sync sources (all active ones unless --source is given)
    Sync {
        /// Source to sync, repeatable
        #[arg(long = "source")]
        sources: Vec<String>,
        /// Queue priority
        #[arg(long, default_value = "normal")]
        priority: Priority,
    },
    /// Show recorded sync status per source
    Status {
        /// Print JSON
        #[arg(long)]
        json: bool,
    },
    /// List registered sources
    Sources,
    /// Print stored records of one source
    Records {
        /// Source id
        #[arg(long)]
        source: String,
        /// Only this kind
        #[arg(long)]
        kind: Option<ResourceKind>,
        /// Print JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_default()?,
    };
    init_tracing(&config);

    let store = factory::open_store(&config).await?;

    match cli.command {
        Commands::Sync { sources, priority } => {
            let engine = factory::start_engine(&config, store).await?;
            sync(&engine, &sources, priority).await
        }
        Commands::Status { json } => status(store.as_ref(), json).await,
        Commands::Sources => list_sources(store.as_ref()).await,
        Commands::Records { source, kind, json } => {
            records(store.as_ref(), &SourceId::new(source), kind, json).await
        }
    }
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.daemon.log_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    match config.daemon.log_format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.init(),
    }
}

async fn sync(engine: &SyncEngine, sources: &[String], priority: Priority) -> Result<()> {
    let ctrl_c = {
        let engine = engine.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupted, cancelling jobs");
                engine.shutdown().await;
            }
        })
    };

    let results = if sources.is_empty() {
        engine.sync_all_active(priority).await
    } else {
        let ids: Vec<SourceId> = sources.iter().map(SourceId::new).collect();
        engine.sync_sources(&ids, priority).await
    }
    .wrap_err("sync failed")?;

    ctrl_c.abort();
    engine.shutdown().await;

    if results.is_empty() {
        println!("no active sources");
        return Ok(());
    }

    for result in &results {
        println!("{}", summary_line(result));
    }

    let failed = results
        .iter()
        .filter(|r| r.outcome == JobOutcome::Failed)
        .count();
    if failed > 0 {
        bail!("{failed} of {} sync job(s) failed", results.len());
    }

    Ok(())
}

fn summary_line(result: &JobResult) -> String {
    let counts: Vec<String> = result
        .counts
        .iter()
        .map(|(kind, count)| format!("{kind}={count}"))
        .collect();

    let mut line = format!(
        "{:<16} {:<20} attempts={} records={}",
        result.source,
        result.outcome,
        result.attempts,
        result.counts.values().sum::<usize>()
    );
    if !counts.is_empty() {
        line.push_str(&format!(" [{}]", counts.join(" ")));
    }
    for kind_error in &result.kind_errors {
        line.push_str(&format!(" {}: {}", kind_error.kind, kind_error.error));
    }
    if let Some(error) = &result.error {
        line.push_str(&format!(" error: {error}"));
    }
    line
}

#[derive(Serialize)]
struct StatusRow {
    source: SourceId,
    endpoint: String,
    active: bool,
    state: SyncState,
    last_successful_sync: Option<chrono::DateTime<chrono::Utc>>,
}

async fn status(registry: &dyn SourceRegistry, json: bool) -> Result<()> {
    let rows: Vec<StatusRow> = registry
        .list_sources()
        .await?
        .into_iter()
        .map(|s| StatusRow {
            source: s.id,
            endpoint: s.descriptor.endpoint,
            active: s.active,
            state: s.state,
            last_successful_sync: s.last_successful_sync,
        })
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    for row in rows {
        let last = row
            .last_successful_sync
            .map_or_else(|| "never".to_string(), |t| t.to_rfc3339());
        println!("{:<16} {:<10} last_success={}", row.source, row.state, last);
    }
    Ok(())
}

async fn list_sources(registry: &dyn SourceRegistry) -> Result<()> {
    for source in registry.list_sources().await? {
        println!(
            "{:<16} {:<32} {}{}",
            source.id,
            source.descriptor.endpoint,
            source.descriptor.username,
            if source.active { "" } else { " (inactive)" }
        );
    }
    Ok(())
}

async fn records(
    store: &dyn InventoryStore,
    source: &SourceId,
    kind: Option<ResourceKind>,
    json: bool,
) -> Result<()> {
    let records = store.records(source, kind).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }

    for record in &records {
        println!(
            "{:<18} {:<32} {:<32} {}",
            record.kind,
            record.remote_id,
            record.name,
            record.parent_id.as_deref().unwrap_or("-")
        );
    }
    println!("{} record(s)", records.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::Utc;
    use vminer_api::KindErrorReport;
    use vminer_core::CoreError;

    use super::*;

    #[test]
    fn test_cli_parses_sync_flags() {
        let cli = Cli::parse_from([
            "vminer", "sync", "--source", "vc01", "--source", "vc02", "--priority", "high",
        ]);
        match cli.command {
            Commands::Sync { sources, priority } => {
                assert_eq!(sources, vec!["vc01", "vc02"]);
                assert_eq!(priority, Priority::High);
            }
            _ => panic!("expected sync"),
        }
    }

    #[test]
    fn test_cli_parses_record_kind() {
        let cli = Cli::parse_from(["vminer", "records", "--source", "vc01", "--kind", "host"]);
        match cli.command {
            Commands::Records { kind, .. } => assert_eq!(kind, Some(ResourceKind::Host)),
            _ => panic!("expected records"),
        }
    }

    #[test]
    fn test_summary_line_lists_failures() {
        let now = Utc::now();
        let result = JobResult {
            source: SourceId::new("vc01"),
            outcome: JobOutcome::Partial,
            started_at: now,
            finished_at: now,
            attempts: 1,
            counts: BTreeMap::from([(ResourceKind::VirtualMachine, 500), (ResourceKind::Host, 10)]),
            kind_errors: vec![KindErrorReport {
                kind: ResourceKind::Snapshot,
                error: "request failed: timeout".to_string(),
            }],
            error: None,
        };

        let line = summary_line(&result);
        assert!(line.contains("partial"));
        assert!(line.contains("records=510"));
        assert!(line.contains("virtual_machine=500"));
        assert!(line.contains("snapshot: request failed: timeout"));

        let failed = JobResult::not_run(
            SourceId::new("vc02"),
            JobOutcome::Failed,
            Some(CoreError::Auth("bad credentials".to_string())),
        );
        assert!(summary_line(&failed).contains("error: authentication failed"));
    }
}
