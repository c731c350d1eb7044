//! Connection lifecycle management
//!
//! [`ConnectionManager::acquire`] opens a session under the connect timeout
//! and wraps it in a [`SessionLease`]. A lease is closed either explicitly via
//! [`SessionLease::release`] or, on any other exit path (early return, panic
//! unwinding, task cancellation), by its `Drop` impl.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::runtime::Handle;
use tokio::time::timeout;
use tracing::{debug, error, info, instrument, warn};
use vminer_api::SourceId;

use crate::descriptor::ConnectionDescriptor;
use crate::error::SessionError;
use crate::traits::{Connector, Session};

/// Opens sessions for sources; never retries
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    connect_timeout: Duration,
}

impl ConnectionManager {
    /// Create a manager around a connector
    pub fn new(connector: Arc<dyn Connector>, connect_timeout: Duration) -> Self {
        Self {
            connector,
            connect_timeout,
        }
    }

    /// Configured connect timeout
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// Connect and authenticate against a source
    ///
    /// # Errors
    /// `SessionError::Auth` on credential rejection, `SessionError::Timeout`
    /// when the endpoint does not answer within the connect timeout, and
    /// `SessionError::Connect` for other transport failures.
    #[instrument(skip(self, descriptor), fields(source = %source, endpoint = %descriptor.endpoint))]
    pub async fn acquire(
        &self,
        source: &SourceId,
        descriptor: &ConnectionDescriptor,
    ) -> Result<SessionLease, SessionError> {
        let start = Instant::now();

        debug!(timeout = ?self.connect_timeout, "connecting");

        let result = timeout(
            self.connect_timeout,
            self.connector.connect(descriptor, self.connect_timeout),
        )
        .await;

        match result {
            Ok(Ok(session)) => {
                info!(
                    session_type = session.session_type(),
                    elapsed = ?start.elapsed(),
                    "session established"
                );
                Ok(SessionLease::new(source.clone(), session))
            }
            Ok(Err(e)) => {
                warn!(error = %e, "connect failed");
                Err(e)
            }
            Err(_) => {
                error!(
                    timeout = ?self.connect_timeout,
                    elapsed = ?start.elapsed(),
                    "connect timed out"
                );
                Err(SessionError::Timeout(self.connect_timeout))
            }
        }
    }
}

/// Scoped ownership of an open session
pub struct SessionLease {
    source: SourceId,
    session: Arc<dyn Session>,
    released: bool,
}

impl SessionLease {
    fn new(source: SourceId, session: Box<dyn Session>) -> Self {
        Self {
            source,
            session: Arc::from(session),
            released: false,
        }
    }

    /// Source this session belongs to
    #[must_use]
    pub fn source(&self) -> &SourceId {
        &self.source
    }

    /// Borrow the session
    #[must_use]
    pub fn session(&self) -> &dyn Session {
        self.session.as_ref()
    }

    /// Close the session now
    ///
    /// # Errors
    /// Returns the session's close error; the lease is consumed either way.
    pub async fn release(mut self) -> Result<(), SessionError> {
        self.released = true;
        let result = self.session.close().await;
        match &result {
            Ok(()) => debug!(source = %self.source, "session released"),
            Err(e) => warn!(source = %self.source, error = %e, "session close failed"),
        }
        result
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        let session = Arc::clone(&self.session);
        let source = self.source.clone();

        match Handle::try_current() {
            Ok(handle) => {
                debug!(source = %source, "releasing session on drop");
                handle.spawn(async move {
                    if let Err(e) = session.close().await {
                        warn!(source = %source, error = %e, "session close failed");
                    }
                });
            }
            Err(_) => {
                error!(source = %source, "no runtime available, session not closed");
            }
        }
    }
}
