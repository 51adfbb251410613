//! Building DataCrunch clients from cluster credentials.

use std::fmt;
use std::sync::Arc;

use capdc_cloud::datacrunch::DEFAULT_BASE_URL;
use capdc_cloud::{CloudClient, CloudError, Credentials, DataCrunch};
use dashmap::DashMap;
use kube::ResourceExt;
use tracing::debug;

use super::config::ControllerConfig;
use super::store::{SecretData, SecretReader};
use super::types::{CallGuard, Error, Result, Services};
use crate::crds::DataCrunchCluster;

pub const CLIENT_ID_KEY: &str = "clientID";
pub const CLIENT_SECRET_KEY: &str = "clientSecret";
pub const BASE_URL_KEY: &str = "baseURL";

/// Creates cloud clients for a set of credentials.
pub trait CloudConnector: Send + Sync {
    fn connect(&self, credentials: Credentials)
        -> std::result::Result<Arc<dyn CloudClient>, CloudError>;
}

/// [`CloudConnector`] for the DataCrunch API.
///
/// Clients are kept per client ID and endpoint so their access tokens are
/// reused across reconciles; a credential rotation replaces the entry.
#[derive(Default)]
pub struct DataCrunchConnector {
    clients: DashMap<String, (Credentials, DataCrunch)>,
}

impl CloudConnector for DataCrunchConnector {
    fn connect(
        &self,
        credentials: Credentials,
    ) -> std::result::Result<Arc<dyn CloudClient>, CloudError> {
        let key = format!(
            "{}@{}",
            credentials.client_id,
            credentials.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL)
        );

        if let Some(entry) = self.clients.get(&key) {
            if entry.0 == credentials {
                return Ok(Arc::new(entry.1.clone()));
            }
        }

        debug!(client_id = %credentials.client_id, "Creating DataCrunch client");
        let client = DataCrunch::new(credentials.clone())?;
        self.clients.insert(key, (credentials, client.clone()));
        Ok(Arc::new(client))
    }
}

/// Where a cluster's credentials live.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SecretLocation {
    pub namespace: String,
    pub name: String,
}

impl fmt::Display for SecretLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// `spec.credentialsRef`, or the configured default secret.
///
/// Unset namespaces resolve to the cluster's own namespace.
pub fn credentials_location(cluster: &DataCrunchCluster, config: &ControllerConfig) -> SecretLocation {
    let cluster_namespace = cluster.namespace().unwrap_or_default();
    match &cluster.spec.credentials_ref {
        Some(reference) => SecretLocation {
            namespace: reference
                .namespace
                .clone()
                .unwrap_or(cluster_namespace),
            name: reference.name.clone(),
        },
        None => SecretLocation {
            namespace: config
                .credentials
                .namespace
                .clone()
                .unwrap_or(cluster_namespace),
            name: config.credentials.secret_name.clone(),
        },
    }
}

/// Read and validate the credentials secret.
pub async fn resolve_credentials(
    secrets: &dyn SecretReader,
    location: &SecretLocation,
    guard: &CallGuard,
) -> Result<Credentials> {
    let data = guard
        .call(
            "read credentials secret",
            secrets.read(&location.namespace, &location.name),
        )
        .await?
        .ok_or_else(|| Error::Credentials(format!("secret {location} not found")))?;

    let client_id = required_key(&data, CLIENT_ID_KEY, location)?;
    let client_secret = required_key(&data, CLIENT_SECRET_KEY, location)?;
    let credentials = Credentials::new(client_id, client_secret);

    match optional_key(&data, BASE_URL_KEY, location)? {
        Some(base_url) => Ok(credentials.with_base_url(base_url)),
        None => Ok(credentials),
    }
}

/// Resolve credentials and build a cloud client.
pub async fn connect(
    services: &Services,
    location: &SecretLocation,
    guard: &CallGuard,
) -> Result<Arc<dyn CloudClient>> {
    let credentials = resolve_credentials(services.secrets.as_ref(), location, guard).await?;
    Ok(services.connector.connect(credentials)?)
}

fn required_key(data: &SecretData, key: &str, location: &SecretLocation) -> Result<String> {
    optional_key(data, key, location)?
        .ok_or_else(|| Error::Credentials(format!("secret {location} is missing key {key}")))
}

fn optional_key(data: &SecretData, key: &str, location: &SecretLocation) -> Result<Option<String>> {
    let Some(raw) = data.get(key) else {
        return Ok(None);
    };
    let value = String::from_utf8(raw.clone())
        .map_err(|_| Error::Credentials(format!("secret {location} key {key} is not valid UTF-8")))?;
    let value = value.trim();
    Ok((!value.is_empty()).then(|| value.to_string()))
}
