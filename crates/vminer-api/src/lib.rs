//! vminer-api: Shared vocabulary types
//!
//! Identifiers, resource kinds, sync states and event types used across the
//! session, inventory, store and engine crates and by external API layers.

pub mod events;
pub mod responses;
pub mod types;

pub use events::SyncEvent;
pub use responses::{JobReport, KindErrorReport};
pub use types::{JobOutcome, JobPhase, ParseKindError, Priority, ResourceKind, SourceId, SyncState};
