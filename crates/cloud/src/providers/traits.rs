//! Cloud client trait and common types.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur during cloud operations.
///
/// Every variant that originates from a request carries the operation that
/// was attempted (e.g. `get instance inst-123`).
#[derive(Error, Debug)]
pub enum CloudError {
    /// HTTP request failed before a response was received.
    #[error("{operation}: HTTP error: {source}")]
    Http {
        operation: String,
        #[source]
        source: reqwest::Error,
    },

    /// API returned an error response.
    #[error("{operation}: API error: {status} - {message}")]
    Api {
        operation: String,
        status: u16,
        message: String,
    },

    /// Resource not found.
    #[error("{operation}: resource not found: {resource}")]
    NotFound { operation: String, resource: String },

    /// Token request was rejected.
    #[error("{operation}: authentication failed: {status} - {message}")]
    Auth {
        operation: String,
        status: u16,
        message: String,
    },

    /// Response body did not match the expected schema.
    #[error("{operation}: serialization error: {source}")]
    Serialization {
        operation: String,
        #[source]
        source: serde_json::Error,
    },

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Capability the DataCrunch API does not offer.
    #[error("{0} is not implemented for DataCrunch")]
    Unimplemented(&'static str),
}

/// Coarse classification used by callers to branch on failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The addressed resource does not exist.
    NotFound,
    /// Retrying later may succeed (network, 5xx, throttling, token hiccups).
    Transient,
    /// Retrying without a change will not help.
    Permanent,
}

impl CloudError {
    /// Classify this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Http { .. } | Self::Auth { .. } => ErrorKind::Transient,
            Self::Api { status, .. } if *status >= 500 || *status == 408 || *status == 429 => {
                ErrorKind::Transient
            }
            Self::Api { .. }
            | Self::Serialization { .. }
            | Self::Config(_)
            | Self::Unimplemented(_) => ErrorKind::Permanent,
        }
    }

    /// Whether the addressed resource does not exist.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }
}

/// Client credentials for the DataCrunch API.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    /// OAuth2 client ID.
    pub client_id: String,
    /// OAuth2 client secret.
    pub client_secret: String,
    /// API base URL override (defaults to the public endpoint).
    pub base_url: Option<String>,
}

impl Credentials {
    /// Credentials against the default API endpoint.
    pub fn new(client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            base_url: None,
        }
    }

    /// Point these credentials at a different API base URL.
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

// ============================================================================
// Instance types
// ============================================================================

/// Lifecycle state reported for an instance.
///
/// Unrecognized provider states are kept verbatim in [`InstanceState::Unknown`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum InstanceState {
    Pending,
    Running,
    Stopping,
    Stopped,
    ShuttingDown,
    Terminated,
    Unknown(String),
}

impl InstanceState {
    /// Wire representation of this state.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::ShuttingDown => "shutting-down",
            Self::Terminated => "terminated",
            Self::Unknown(raw) => raw,
        }
    }
}

impl From<&str> for InstanceState {
    fn from(raw: &str) -> Self {
        match raw {
            "pending" => Self::Pending,
            "running" => Self::Running,
            "stopping" => Self::Stopping,
            "stopped" => Self::Stopped,
            "shutting-down" => Self::ShuttingDown,
            "terminated" => Self::Terminated,
            other => Self::Unknown(other.to_string()),
        }
    }
}

impl From<String> for InstanceState {
    fn from(raw: String) -> Self {
        Self::from(raw.as_str())
    }
}

impl From<InstanceState> for String {
    fn from(state: InstanceState) -> Self {
        state.as_str().to_string()
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A compute instance as observed live from the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instance {
    /// Unique instance identifier.
    pub id: String,
    /// Hostname.
    pub name: String,
    /// Current state.
    pub state: InstanceState,
    /// Instance type (e.g. `1xH100`).
    pub instance_type: String,
    /// Image the instance was booted from.
    pub image_id: String,
    /// Public IPv4 address, if any.
    pub public_ip: Option<String>,
    /// Private IPv4 address, if any.
    pub private_ip: Option<String>,
    /// SSH key configured at creation.
    pub ssh_key_name: Option<String>,
    /// When the instance was created.
    pub created_at: Option<DateTime<Utc>>,
}

/// Root volume options for a new instance.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OsVolume {
    /// Size in GB.
    pub size_gb: Option<i64>,
    /// Storage type (e.g. `NVMe`).
    pub volume_type: Option<String>,
}

/// Request to create a new instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateInstanceRequest {
    /// Hostname.
    pub name: String,
    /// Instance type.
    pub instance_type: String,
    /// Image ID or slug.
    pub image_id: String,
    /// SSH key to install.
    pub ssh_key_name: Option<String>,
    /// Base64-encoded first-boot data.
    pub user_data: Option<String>,
    /// Location/region code.
    pub location: Option<String>,
    /// Free-form metadata.
    pub metadata: BTreeMap<String, String>,
    /// Tags applied to the instance.
    pub tags: BTreeMap<String, String>,
    /// Whether to attach a public IP.
    pub public_ip: bool,
    /// Spot bid, when the instance should be a spot instance.
    pub spot_max_price: Option<String>,
    /// Root volume options.
    pub os_volume: Option<OsVolume>,
}

impl CreateInstanceRequest {
    /// Minimal request; optional fields start empty.
    pub fn new(
        name: impl Into<String>,
        instance_type: impl Into<String>,
        image_id: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            instance_type: instance_type.into(),
            image_id: image_id.into(),
            ssh_key_name: None,
            user_data: None,
            location: None,
            metadata: BTreeMap::new(),
            tags: BTreeMap::new(),
            public_ip: false,
            spot_max_price: None,
            os_volume: None,
        }
    }
}

// ============================================================================
// Image and SSH key types
// ============================================================================

/// An OS image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub os_type: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
}

/// A registered SSH key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshKey {
    pub id: String,
    pub name: String,
    pub public_key: String,
    pub created_at: Option<DateTime<Utc>>,
}

// ============================================================================
// Load balancer types
// ============================================================================

/// Request to create a load balancer.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LoadBalancerSpec {
    pub name: String,
    pub lb_type: String,
    pub health_check_path: String,
    pub targets: Vec<String>,
    pub tags: BTreeMap<String, String>,
}

/// A load balancer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadBalancer {
    pub id: String,
    pub name: String,
    pub dns_name: String,
    pub state: String,
    pub lb_type: String,
    pub targets: Vec<String>,
}

/// Operations the provider reconcilers need from the cloud.
#[async_trait]
pub trait CloudClient: Send + Sync {
    /// Create an instance and return it as the API reports it afterwards.
    ///
    /// Once the create call has been accepted this returns `Ok` with the new
    /// id, even if the instance cannot be read back yet.
    async fn create_instance(&self, req: CreateInstanceRequest) -> Result<Instance, CloudError>;

    /// Get an instance by ID.
    async fn get_instance(&self, id: &str) -> Result<Instance, CloudError>;

    /// Delete an instance.
    async fn delete_instance(&self, id: &str) -> Result<(), CloudError>;

    /// Power on a stopped instance.
    async fn start_instance(&self, id: &str) -> Result<(), CloudError>;

    /// Power off an instance.
    async fn stop_instance(&self, id: &str) -> Result<(), CloudError>;

    /// List available images.
    async fn list_images(&self) -> Result<Vec<Image>, CloudError>;

    /// Get an image by ID.
    async fn get_image(&self, id: &str) -> Result<Image, CloudError>;

    /// List registered SSH keys.
    async fn list_ssh_keys(&self) -> Result<Vec<SshKey>, CloudError>;

    /// Register an SSH public key.
    async fn create_ssh_key(&self, name: &str, public_key: &str) -> Result<SshKey, CloudError>;

    /// Remove an SSH key.
    async fn delete_ssh_key(&self, id: &str) -> Result<(), CloudError>;

    /// Create a load balancer.
    async fn create_load_balancer(&self, spec: LoadBalancerSpec)
        -> Result<LoadBalancer, CloudError>;

    /// Get a load balancer by ID.
    async fn get_load_balancer(&self, id: &str) -> Result<LoadBalancer, CloudError>;

    /// Delete a load balancer.
    async fn delete_load_balancer(&self, id: &str) -> Result<(), CloudError>;

    /// Replace the targets behind a load balancer.
    async fn update_load_balancer_targets(
        &self,
        id: &str,
        targets: Vec<String>,
    ) -> Result<(), CloudError>;
}
