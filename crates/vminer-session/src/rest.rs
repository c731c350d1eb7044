//! vSphere Automation REST sessions using reqwest
//!
//! Covers the kinds exposed by the `/api/vcenter` summary endpoints. Kinds that
//! only the SOAP API reports (snapshots, DRS rules, permissions, ...) are
//! reported as unsupported so the collector skips them.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};
use url::Url;
use vminer_api::ResourceKind;

use crate::descriptor::ConnectionDescriptor;
use crate::error::SessionError;
use crate::traits::{Connector, RemoteObject, Session};

/// Header carrying the session token
const SESSION_HEADER: &str = "vmware-api-session-id";

/// Default per-request timeout once connected
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Collection endpoint and id field for root kinds
fn collection_endpoint(kind: ResourceKind) -> Option<(&'static str, &'static str)> {
    match kind {
        ResourceKind::VirtualMachine => Some(("/api/vcenter/vm", "vm")),
        ResourceKind::Host => Some(("/api/vcenter/host", "host")),
        ResourceKind::Datastore => Some(("/api/vcenter/datastore", "datastore")),
        ResourceKind::Cluster => Some(("/api/vcenter/cluster", "cluster")),
        ResourceKind::Folder => Some(("/api/vcenter/folder", "folder")),
        ResourceKind::PortGroup => Some(("/api/vcenter/network", "network")),
        ResourceKind::ResourcePool => Some(("/api/vcenter/resource-pool", "resource_pool")),
        _ => None,
    }
}

/// Connector for vCenter's REST API
#[derive(Debug, Clone)]
pub struct RestConnector {
    request_timeout: Duration,
}

impl RestConnector {
    /// Create a connector with the default request timeout
    #[must_use]
    pub fn new() -> Self {
        Self {
            request_timeout: REQUEST_TIMEOUT,
        }
    }

    /// Set the per-request timeout used by opened sessions
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

impl Default for RestConnector {
    fn default() -> Self {
        Self::new()
    }
}

fn transport_error(e: &reqwest::Error, timeout: Duration) -> SessionError {
    if e.is_timeout() {
        SessionError::Timeout(timeout)
    } else {
        SessionError::Connect(e.to_string())
    }
}

#[async_trait]
impl Connector for RestConnector {
    #[instrument(skip(self, descriptor), fields(endpoint = %descriptor.endpoint))]
    async fn connect(
        &self,
        descriptor: &ConnectionDescriptor,
        timeout: Duration,
    ) -> Result<Box<dyn Session>, SessionError> {
        let password = descriptor.resolve_password()?;
        let base = Url::parse(&descriptor.base_url())
            .map_err(|e| SessionError::Descriptor(e.to_string()))?;

        let client = Client::builder()
            .connect_timeout(timeout)
            .timeout(self.request_timeout)
            .danger_accept_invalid_certs(descriptor.accept_invalid_certs)
            .build()
            .map_err(|e| SessionError::Connect(e.to_string()))?;

        let url = base
            .join("/api/session")
            .map_err(|e| SessionError::Descriptor(e.to_string()))?;

        debug!(url = %url, user = %descriptor.username, "creating REST session");

        let response = client
            .post(url)
            .basic_auth(&descriptor.username, Some(password))
            .send()
            .await
            .map_err(|e| transport_error(&e, timeout))?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(SessionError::Auth(format!(
                "{} rejected credentials for {}",
                descriptor.endpoint, descriptor.username
            )));
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(SessionError::Connect(format!(
                "session create returned {status}: {message}"
            )));
        }

        let token: String = response
            .json()
            .await
            .map_err(|e| SessionError::InvalidResponse(e.to_string()))?;

        info!(endpoint = %descriptor.endpoint, "REST session created");

        Ok(Box::new(RestSession {
            client,
            base,
            token,
        }))
    }
}

/// Authenticated REST session
pub struct RestSession {
    client: Client,
    base: Url,
    token: String,
}

impl std::fmt::Debug for RestSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestSession")
            .field("base", &self.base.as_str())
            .finish_non_exhaustive()
    }
}

impl RestSession {
    fn url(&self, path: &str) -> Result<Url, SessionError> {
        self.base
            .join(path)
            .map_err(|e| SessionError::Request(e.to_string()))
    }

    /// GET a summary collection and convert it to remote objects
    async fn get_objects(
        &self,
        path: &str,
        id_field: &str,
    ) -> Result<Vec<RemoteObject>, SessionError> {
        let url = self.url(path)?;
        let response = self
            .client
            .get(url)
            .header(SESSION_HEADER, &self.token)
            .send()
            .await
            .map_err(|e| SessionError::Request(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let message = response.text().await.unwrap_or_default();
            return Err(SessionError::Request(format!("GET {path} returned {status}: {message}")));
        }

        let values: Vec<Value> = response
            .json()
            .await
            .map_err(|e| SessionError::InvalidResponse(e.to_string()))?;

        objects_from_json(values, id_field)
    }
}

#[async_trait]
impl Session for RestSession {
    fn supports(&self, kind: ResourceKind) -> bool {
        collection_endpoint(kind).is_some() || kind == ResourceKind::NetworkAdapter
    }

    #[instrument(skip(self), fields(base = %self.base))]
    async fn list(
        &self,
        kind: ResourceKind,
        limit: Option<usize>,
    ) -> Result<Vec<RemoteObject>, SessionError> {
        let (path, id_field) =
            collection_endpoint(kind).ok_or(SessionError::Unsupported(kind))?;

        let mut objects = self.get_objects(path, id_field).await?;

        if kind == ResourceKind::PortGroup {
            for object in &mut objects {
                let distributed = object
                    .properties
                    .get("type")
                    .and_then(Value::as_str)
                    .is_some_and(|t| t == "DISTRIBUTED_PORTGROUP");
                object
                    .properties
                    .insert("is_distributed".to_string(), Value::Bool(distributed));
            }
        }

        if let Some(limit) = limit {
            objects.truncate(limit);
        }

        debug!(kind = %kind, count = objects.len(), "listed objects");

        Ok(objects)
    }

    async fn list_children(
        &self,
        kind: ResourceKind,
        parent_id: &str,
    ) -> Result<Vec<RemoteObject>, SessionError> {
        match kind {
            ResourceKind::NetworkAdapter => {
                let path = format!("/api/vcenter/vm/{parent_id}/hardware/ethernet");
                self.get_objects(&path, "nic").await
            }
            other => Err(SessionError::Unsupported(other)),
        }
    }

    async fn close(&self) -> Result<(), SessionError> {
        let url = self.url("/api/session")?;
        let response = self
            .client
            .delete(url)
            .header(SESSION_HEADER, &self.token)
            .send()
            .await
            .map_err(|e| SessionError::Request(e.to_string()))?;

        // an expired token means the server already dropped the session
        if !response.status().is_success() && response.status() != StatusCode::UNAUTHORIZED {
            warn!(status = %response.status(), "session delete rejected");
            return Err(SessionError::Request(format!(
                "session delete returned {}",
                response.status()
            )));
        }

        debug!(base = %self.base, "REST session closed");
        Ok(())
    }

    fn session_type(&self) -> &'static str {
        "vsphere-rest"
    }
}

/// Convert summary objects into remote objects
///
/// The id field and `name` are lifted out; every other field becomes a
/// property. Objects without a name use their id.
fn objects_from_json(values: Vec<Value>, id_field: &str) -> Result<Vec<RemoteObject>, SessionError> {
    let mut objects = Vec::with_capacity(values.len());

    for value in values {
        let Value::Object(mut map) = value else {
            return Err(SessionError::InvalidResponse(
                "expected an array of objects".to_string(),
            ));
        };

        let id = match map.remove(id_field) {
            Some(Value::String(id)) => id,
            _ => {
                return Err(SessionError::InvalidResponse(format!(
                    "object without string field {id_field}"
                )));
            }
        };

        let name = match map.remove("name") {
            Some(Value::String(name)) => name,
            _ => id.clone(),
        };

        objects.push(RemoteObject {
            id,
            name,
            parent_id: None,
            properties: map,
        });
    }

    Ok(objects)
}
