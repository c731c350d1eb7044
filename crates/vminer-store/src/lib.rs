//! vminer-store: persistence adapter and source registry
//!
//! Records are written through source-scoped transactions so that a job's
//! upserts and reaps become visible together or not at all.

pub mod error;
pub mod memory;
pub mod source;
pub mod sqlite;
pub mod traits;

pub use error::StoreError;
pub use memory::{MemoryRegistry, MemoryStore};
pub use source::Source;
pub use sqlite::SqliteStore;
pub use traits::{InventoryStore, SourceRegistry, StoreTransaction, UpsertSummary};
