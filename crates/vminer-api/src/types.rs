//! Core identifier and state types

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// Source identity
// ============================================================================

/// Identifier of one remote inventory endpoint
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceId(String);

impl SourceId {
    /// Create a new source id
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the id as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SourceId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for SourceId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

// ============================================================================
// Resource kinds
// ============================================================================

/// Tracked inventory resource kinds
///
/// The declaration order is the collection order: every kind appears after
/// the kind it depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    VirtualMachine,
    Host,
    Datastore,
    Cluster,
    DistributedSwitch,
    StandardSwitch,
    PortGroup,
    ResourcePool,
    #[serde(rename = "vapp")]
    VApp,
    Folder,
    VmTemplate,
    Event,
    Alarm,
    Permission,
    NetworkAdapter,
    Snapshot,
    VmPerformance,
    StorageAdapter,
    ScsiLun,
    HostPerformance,
    DrsRule,
}

impl ResourceKind {
    /// All kinds in collection order
    pub const ALL: [ResourceKind; 21] = [
        ResourceKind::VirtualMachine,
        ResourceKind::Host,
        ResourceKind::Datastore,
        ResourceKind::Cluster,
        ResourceKind::DistributedSwitch,
        ResourceKind::StandardSwitch,
        ResourceKind::PortGroup,
        ResourceKind::ResourcePool,
        ResourceKind::VApp,
        ResourceKind::Folder,
        ResourceKind::VmTemplate,
        ResourceKind::Event,
        ResourceKind::Alarm,
        ResourceKind::Permission,
        ResourceKind::NetworkAdapter,
        ResourceKind::Snapshot,
        ResourceKind::VmPerformance,
        ResourceKind::StorageAdapter,
        ResourceKind::ScsiLun,
        ResourceKind::HostPerformance,
        ResourceKind::DrsRule,
    ];

    /// Stable snake_case name, used in storage and configuration
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ResourceKind::VirtualMachine => "virtual_machine",
            ResourceKind::Host => "host",
            ResourceKind::Datastore => "datastore",
            ResourceKind::Cluster => "cluster",
            ResourceKind::DistributedSwitch => "distributed_switch",
            ResourceKind::StandardSwitch => "standard_switch",
            ResourceKind::PortGroup => "port_group",
            ResourceKind::ResourcePool => "resource_pool",
            ResourceKind::VApp => "vapp",
            ResourceKind::Folder => "folder",
            ResourceKind::VmTemplate => "vm_template",
            ResourceKind::Event => "event",
            ResourceKind::Alarm => "alarm",
            ResourceKind::Permission => "permission",
            ResourceKind::NetworkAdapter => "network_adapter",
            ResourceKind::Snapshot => "snapshot",
            ResourceKind::VmPerformance => "vm_performance",
            ResourceKind::StorageAdapter => "storage_adapter",
            ResourceKind::ScsiLun => "scsi_lun",
            ResourceKind::HostPerformance => "host_performance",
            ResourceKind::DrsRule => "drs_rule",
        }
    }

    /// Kind whose object ids are the inputs for collecting this kind
    ///
    /// Per-parent kinds are fetched once for every parent collected in the
    /// same pass.
    #[must_use]
    pub fn parent(self) -> Option<ResourceKind> {
        match self {
            ResourceKind::NetworkAdapter | ResourceKind::Snapshot | ResourceKind::VmPerformance => {
                Some(ResourceKind::VirtualMachine)
            }
            ResourceKind::StorageAdapter
            | ResourceKind::ScsiLun
            | ResourceKind::HostPerformance => Some(ResourceKind::Host),
            ResourceKind::DrsRule => Some(ResourceKind::Cluster),
            _ => None,
        }
    }

    /// Order a set of kinds so that every parent precedes its children,
    /// adding missing parents. Duplicates are removed.
    #[must_use]
    pub fn plan(kinds: &[ResourceKind]) -> Vec<ResourceKind> {
        let mut wanted: Vec<ResourceKind> = Vec::with_capacity(kinds.len());
        for kind in kinds {
            if let Some(parent) = kind.parent()
                && !wanted.contains(&parent)
            {
                wanted.push(parent);
            }
            if !wanted.contains(kind) {
                wanted.push(*kind);
            }
        }
        // ALL is already dependency ordered
        Self::ALL
            .iter()
            .copied()
            .filter(|k| wanted.contains(k))
            .collect()
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unknown resource kind name
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown resource kind: {0}")]
pub struct ParseKindError(pub String);

impl FromStr for ResourceKind {
    type Err = ParseKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        Self::ALL
            .iter()
            .copied()
            .find(|k| k.as_str() == normalized)
            .ok_or_else(|| ParseKindError(s.to_string()))
    }
}

// ============================================================================
// Sync state
// ============================================================================

/// Status value of one source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    #[default]
    Pending,
    Syncing,
    Completed,
    Failed,
    Cancelled,
}

impl SyncState {
    /// Stable name for storage
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            SyncState::Pending => "pending",
            SyncState::Syncing => "syncing",
            SyncState::Completed => "completed",
            SyncState::Failed => "failed",
            SyncState::Cancelled => "cancelled",
        }
    }

    /// Parse a stored state name, falling back to `Pending`
    #[must_use]
    pub fn from_stored(s: &str) -> Self {
        match s {
            "syncing" => SyncState::Syncing,
            "completed" => SyncState::Completed,
            "failed" => SyncState::Failed,
            "cancelled" => SyncState::Cancelled,
            _ => SyncState::Pending,
        }
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal outcome of one job request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobOutcome {
    /// Every planned kind was collected and persisted
    Success,
    /// Some kinds failed to collect, the rest were persisted
    Partial,
    Failed,
    Cancelled,
    /// Another job already held the source; nothing was queued
    AlreadyInProgress,
}

impl JobOutcome {
    /// Status value a source takes after this outcome
    #[must_use]
    pub fn terminal_state(self) -> SyncState {
        match self {
            JobOutcome::Success | JobOutcome::Partial => SyncState::Completed,
            JobOutcome::Failed => SyncState::Failed,
            JobOutcome::Cancelled => SyncState::Cancelled,
            JobOutcome::AlreadyInProgress => SyncState::Syncing,
        }
    }

    /// Whether records were written by this outcome
    #[must_use]
    pub fn persisted(self) -> bool {
        matches!(self, JobOutcome::Success | JobOutcome::Partial)
    }
}

impl fmt::Display for JobOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobOutcome::Success => write!(f, "success"),
            JobOutcome::Partial => write!(f, "partial"),
            JobOutcome::Failed => write!(f, "failed"),
            JobOutcome::Cancelled => write!(f, "cancelled"),
            JobOutcome::AlreadyInProgress => write!(f, "already-in-progress"),
        }
    }
}

/// Phase of a running job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPhase {
    Connecting,
    Collecting,
    Persisting,
    Done,
}

impl fmt::Display for JobPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobPhase::Connecting => write!(f, "connecting"),
            JobPhase::Collecting => write!(f, "collecting"),
            JobPhase::Persisting => write!(f, "persisting"),
            JobPhase::Done => write!(f, "done"),
        }
    }
}

/// Queue priority of a sync request
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            other => Err(format!("unknown priority: {other}")),
        }
    }
}
