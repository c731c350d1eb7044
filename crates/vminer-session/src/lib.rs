//! vminer-session: Remote session abstraction
//!
//! Traits for connecting to inventory endpoints, the scoped session lease that
//! guarantees release, and the vSphere REST implementation.

pub mod descriptor;
pub mod error;
pub mod lease;
pub mod rest;
pub mod traits;

pub use descriptor::ConnectionDescriptor;
pub use error::SessionError;
pub use lease::{ConnectionManager, SessionLease};
pub use rest::{RestConnector, RestSession};
pub use traits::{Connector, RemoteObject, Session, SnapshotTree};
