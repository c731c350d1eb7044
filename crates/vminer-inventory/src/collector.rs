//! Per-kind resource collection

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, instrument, warn};
use vminer_api::{ResourceKind, SourceId};
use vminer_session::{RemoteObject, Session};

use crate::error::CollectionError;
use crate::tree::{assign_folder_paths, flatten_snapshots};
use crate::types::ResourceRecord;

/// Collector settings
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    /// Upper bound on event records per pass
    pub max_events: usize,
    /// Timeout for collecting one kind
    pub collect_timeout: Duration,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            max_events: 100,
            collect_timeout: Duration::from_secs(300),
        }
    }
}

/// Stateless resource collector
///
/// Collects one kind at a time from an open session. Child kinds are fetched
/// per parent record of their dependency kind.
#[derive(Debug, Clone, Default)]
pub struct Collector {
    config: CollectorConfig,
}

impl Collector {
    /// Create a collector
    #[must_use]
    pub fn new(config: CollectorConfig) -> Self {
        Self { config }
    }

    /// Collector settings
    #[must_use]
    pub fn config(&self) -> &CollectorConfig {
        &self.config
    }

    /// Collect every object of one kind
    ///
    /// `parents` holds the records of `kind.parent()` collected in the same
    /// pass, or `None` if that kind failed. It is ignored for root kinds.
    ///
    /// # Errors
    /// Returns `Unsupported` if the session cannot report the kind,
    /// `DependencyFailed` if the parent kind is missing, `Timeout` if the
    /// kind exceeds the collect timeout and `Remote` if any remote call fails.
    /// A failure for any single parent fails the whole kind.
    #[instrument(skip(self, session, parents), fields(source = %source, kind = %kind))]
    pub async fn collect_kind(
        &self,
        session: &dyn Session,
        source: &SourceId,
        kind: ResourceKind,
        parents: Option<&[ResourceRecord]>,
    ) -> Result<Vec<ResourceRecord>, CollectionError> {
        if !session.supports(kind) {
            debug!("kind not supported by session, skipping");
            return Err(CollectionError::Unsupported(kind));
        }

        let objects = match kind.parent() {
            None => {
                tokio::time::timeout(self.config.collect_timeout, self.fetch_root(session, kind))
                    .await
                    .map_err(|_| CollectionError::Timeout(self.config.collect_timeout))??
            }
            Some(parent_kind) => {
                let parents = parents.ok_or(CollectionError::DependencyFailed(parent_kind))?;
                tokio::time::timeout(
                    self.config.collect_timeout,
                    self.fetch_children(session, kind, parents),
                )
                .await
                .map_err(|_| CollectionError::Timeout(self.config.collect_timeout))??
            }
        };

        let observed_at = Utc::now();
        let mut records: Vec<ResourceRecord> = dedupe(kind, objects)
            .into_iter()
            .map(|object| ResourceRecord::from_remote(source, kind, object, observed_at))
            .collect();

        if kind == ResourceKind::Folder {
            assign_folder_paths(&mut records);
        }

        debug!(count = records.len(), "kind collected");

        Ok(records)
    }

    async fn fetch_root(
        &self,
        session: &dyn Session,
        kind: ResourceKind,
    ) -> Result<Vec<RemoteObject>, CollectionError> {
        if kind == ResourceKind::Event {
            let mut events = session.list(kind, Some(self.config.max_events)).await?;
            events.truncate(self.config.max_events);
            return Ok(events);
        }
        Ok(session.list(kind, None).await?)
    }

    async fn fetch_children(
        &self,
        session: &dyn Session,
        kind: ResourceKind,
        parents: &[ResourceRecord],
    ) -> Result<Vec<RemoteObject>, CollectionError> {
        let mut objects = Vec::new();

        for parent in parents {
            let parent_id = parent.remote_id.as_str();

            let children = match kind {
                ResourceKind::Snapshot => {
                    flatten_snapshots(parent_id, session.snapshot_tree(parent_id).await?)
                }
                ResourceKind::VmPerformance | ResourceKind::HostPerformance => {
                    let samples = session.list_children(kind, parent_id).await?;
                    latest_sample(parent_id, samples).into_iter().collect()
                }
                _ => session
                    .list_children(kind, parent_id)
                    .await?
                    .into_iter()
                    .map(|child| scope_to_parent(parent_id, child))
                    .collect(),
            };

            objects.extend(children);
        }

        Ok(objects)
    }
}

/// Prefix a child id with its parent id and link it back
fn scope_to_parent(parent_id: &str, mut child: RemoteObject) -> RemoteObject {
    child.id = format!("{parent_id}/{}", child.id);
    child.parent_id = Some(parent_id.to_string());
    child
}

/// Keep the newest performance sample of one parent, keyed by the parent id
///
/// Samples are ordered by their `timestamp` attribute; without one the last
/// reported sample wins.
fn latest_sample(parent_id: &str, samples: Vec<RemoteObject>) -> Option<RemoteObject> {
    let mut latest: Option<RemoteObject> = None;
    for sample in samples {
        let newer = match &latest {
            None => true,
            Some(current) => sample_timestamp(&sample) >= sample_timestamp(current),
        };
        if newer {
            latest = Some(sample);
        }
    }

    latest.map(|mut sample| {
        sample
            .properties
            .insert("sample_id".to_string(), sample.id.clone().into());
        sample.id = parent_id.to_string();
        sample.parent_id = Some(parent_id.to_string());
        sample
    })
}

fn sample_timestamp(sample: &RemoteObject) -> Option<&str> {
    sample.properties.get("timestamp").and_then(|v| v.as_str())
}

/// Collapse duplicate ids, keeping the last occurrence in first-seen order
fn dedupe(kind: ResourceKind, objects: Vec<RemoteObject>) -> Vec<RemoteObject> {
    let mut positions: HashMap<String, usize> = HashMap::with_capacity(objects.len());
    let mut unique: Vec<RemoteObject> = Vec::with_capacity(objects.len());

    for object in objects {
        if let Some(&pos) = positions.get(&object.id) {
            warn!(kind = %kind, remote_id = %object.id, "duplicate remote id, keeping last");
            unique[pos] = object;
        } else {
            positions.insert(object.id.clone(), unique.len());
            unique.push(object);
        }
    }

    unique
}
