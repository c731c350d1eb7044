//! Serializable job reports for API layers and the CLI

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{JobOutcome, ResourceKind, SourceId};

/// Kind-level collection failure inside a job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KindErrorReport {
    pub kind: ResourceKind,
    pub error: String,
}

/// Result of one requested source in a sync call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobReport {
    pub source: SourceId,
    pub outcome: JobOutcome,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub attempts: u32,
    pub counts: BTreeMap<ResourceKind, usize>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub kind_errors: Vec<KindErrorReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobReport {
    /// Total number of records collected across kinds
    #[must_use]
    pub fn total_records(&self) -> usize {
        self.counts.values().sum()
    }
}
