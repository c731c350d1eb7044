//! Inventory record types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use vminer_api::{ResourceKind, SourceId};
use vminer_session::RemoteObject;

/// Unique key of a stored record
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordKey {
    pub source: SourceId,
    pub kind: ResourceKind,
    pub remote_id: String,
}

/// One inventory object of one source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRecord {
    /// Owning source
    pub source: SourceId,
    /// Resource kind
    pub kind: ResourceKind,
    /// Remote object id, unique per source and kind
    pub remote_id: String,
    /// Display name
    pub name: String,
    /// Back-reference to the containing object, by id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    /// Kind-specific attributes
    #[serde(default)]
    pub attributes: Map<String, Value>,
    /// When the stored content last changed
    pub last_updated: DateTime<Utc>,
}

impl ResourceRecord {
    /// Build a record from a remote object
    #[must_use]
    pub fn from_remote(
        source: &SourceId,
        kind: ResourceKind,
        object: RemoteObject,
        observed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            source: source.clone(),
            kind,
            remote_id: object.id,
            name: object.name,
            parent_id: object.parent_id,
            attributes: object.properties,
            last_updated: observed_at,
        }
    }

    /// Record key
    #[must_use]
    pub fn key(&self) -> RecordKey {
        RecordKey {
            source: self.source.clone(),
            kind: self.kind,
            remote_id: self.remote_id.clone(),
        }
    }

    /// Whether two records carry the same content, ignoring `last_updated`
    #[must_use]
    pub fn same_content(&self, other: &ResourceRecord) -> bool {
        self.name == other.name
            && self.parent_id == other.parent_id
            && self.attributes == other.attributes
    }

    /// String attribute lookup
    #[must_use]
    pub fn attribute_str(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).and_then(Value::as_str)
    }
}
