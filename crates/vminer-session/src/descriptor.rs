//! Connection descriptor handed to connectors
//!
//! The engine treats the descriptor as opaque and only passes it through to
//! the [`Connector`](crate::Connector).

use std::env;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::SessionError;

/// How to reach and authenticate against one endpoint
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionDescriptor {
    /// Endpoint host name or base URL (`vc01.lab` or `https://vc01.lab`)
    pub endpoint: String,
    /// Login user
    pub username: String,
    /// Inline password
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Name of an environment variable holding the password
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_env: Option<String>,
    /// Skip TLS certificate verification (self-signed lab endpoints)
    #[serde(default)]
    pub accept_invalid_certs: bool,
}

impl ConnectionDescriptor {
    /// Create a descriptor with an inline password
    pub fn new(
        endpoint: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            username: username.into(),
            password: Some(password.into()),
            password_env: None,
            accept_invalid_certs: false,
        }
    }

    /// Read the password from an environment variable instead
    #[must_use]
    pub fn with_password_env(mut self, var_name: impl Into<String>) -> Self {
        self.password = None;
        self.password_env = Some(var_name.into());
        self
    }

    /// Accept self-signed certificates
    #[must_use]
    pub fn accept_invalid_certs(mut self, accept: bool) -> Self {
        self.accept_invalid_certs = accept;
        self
    }

    /// Resolve the password, inline value first
    ///
    /// # Errors
    /// Returns `SessionError::Descriptor` if neither source yields a password.
    pub fn resolve_password(&self) -> Result<String, SessionError> {
        if let Some(password) = &self.password {
            return Ok(password.clone());
        }
        if let Some(var_name) = &self.password_env {
            return env::var(var_name).map_err(|_| {
                SessionError::Descriptor(format!("environment variable {var_name} not set"))
            });
        }
        Err(SessionError::Descriptor(format!(
            "no password configured for {}",
            self.endpoint
        )))
    }

    /// Endpoint as a base URL, defaulting to https
    #[must_use]
    pub fn base_url(&self) -> String {
        let endpoint = self.endpoint.trim_end_matches('/');
        if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            endpoint.to_string()
        } else {
            format!("https://{endpoint}")
        }
    }
}

impl fmt::Debug for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionDescriptor")
            .field("endpoint", &self.endpoint)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("password_env", &self.password_env)
            .field("accept_invalid_certs", &self.accept_invalid_certs)
            .finish()
    }
}
