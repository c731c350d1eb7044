//! Remote SDK traits
//!
//! A [`Connector`] opens a [`Session`] against one endpoint. Sessions hand out
//! raw [`RemoteObject`]s per resource kind; turning them into stored records
//! is the collector's job.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use vminer_api::ResourceKind;

use crate::descriptor::ConnectionDescriptor;
use crate::error::SessionError;

/// One object as reported by the remote endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteObject {
    /// Remote object id (managed object id, device key, ...)
    pub id: String,
    /// Display name
    pub name: String,
    /// Id of the containing object of the same hierarchy, if any
    #[serde(default)]
    pub parent_id: Option<String>,
    /// Kind-specific attributes
    #[serde(default)]
    pub properties: Map<String, Value>,
}

impl RemoteObject {
    /// Create an object without attributes
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            parent_id: None,
            properties: Map::new(),
        }
    }

    /// Set the parent id
    #[must_use]
    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    /// Add one attribute
    #[must_use]
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}

/// Snapshot hierarchy of one virtual machine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotTree {
    pub snapshot: RemoteObject,
    #[serde(default)]
    pub children: Vec<SnapshotTree>,
}

impl SnapshotTree {
    /// Leaf snapshot
    #[must_use]
    pub fn leaf(snapshot: RemoteObject) -> Self {
        Self {
            snapshot,
            children: Vec::new(),
        }
    }

    /// Snapshot with children
    #[must_use]
    pub fn node(snapshot: RemoteObject, children: Vec<SnapshotTree>) -> Self {
        Self { snapshot, children }
    }
}

/// An open, authenticated session against one endpoint
#[async_trait]
pub trait Session: Send + Sync {
    /// Whether this session can report the given kind at all
    fn supports(&self, _kind: ResourceKind) -> bool {
        true
    }

    /// List every object of a root kind
    ///
    /// `limit` caps unbounded streams such as events.
    async fn list(
        &self,
        kind: ResourceKind,
        limit: Option<usize>,
    ) -> Result<Vec<RemoteObject>, SessionError>;

    /// List objects of a per-parent kind for one parent object
    async fn list_children(
        &self,
        kind: ResourceKind,
        parent_id: &str,
    ) -> Result<Vec<RemoteObject>, SessionError>;

    /// Root snapshots of one virtual machine, children nested
    async fn snapshot_tree(&self, _vm_id: &str) -> Result<Vec<SnapshotTree>, SessionError> {
        Err(SessionError::Unsupported(ResourceKind::Snapshot))
    }

    /// Log out and free server-side resources
    async fn close(&self) -> Result<(), SessionError>;

    /// Short name of the implementation, for logs
    fn session_type(&self) -> &'static str;
}

/// Opens sessions from connection descriptors
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connect and authenticate
    ///
    /// Implementations should respect `timeout` themselves where the
    /// transport allows it; the connection manager enforces it regardless.
    async fn connect(
        &self,
        descriptor: &ConnectionDescriptor,
        timeout: Duration,
    ) -> Result<Box<dyn Session>, SessionError>;
}
