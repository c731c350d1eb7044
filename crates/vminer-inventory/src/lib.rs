//! vminer-inventory: resource collection
//!
//! Turns what a remote session reports into [`ResourceRecord`]s, one resource
//! kind at a time.

pub mod collector;
pub mod error;
pub mod tree;
pub mod types;

pub use collector::{Collector, CollectorConfig};
pub use error::CollectionError;
pub use types::{RecordKey, ResourceRecord};
