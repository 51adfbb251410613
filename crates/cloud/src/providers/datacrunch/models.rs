//! DataCrunch REST API models.
//!
//! One typed schema per endpoint. Fields the API always returns are required;
//! everything else is optional and tolerated when missing or null.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::providers::traits::{Image, Instance, InstanceState, SshKey};

// ============================================================================
// Authentication
// ============================================================================

/// Body for `POST /oauth/token`.
#[derive(Debug, Serialize)]
pub struct TokenRequest<'a> {
    pub grant_type: &'static str,
    pub client_id: &'a str,
    pub client_secret: &'a str,
}

/// Response from `POST /oauth/token`.
#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub token_type: Option<String>,
    /// Token lifetime in seconds.
    pub expires_in: i64,
}

// ============================================================================
// Instances
// ============================================================================

/// Body for `POST /instances`.
#[derive(Debug, Serialize)]
pub struct CreateInstanceBody {
    pub hostname: String,
    pub instance_type: String,
    pub image: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssh_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_data: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location_code: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
    pub public_ip: bool,
    pub is_spot: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spot_max_price: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub os_volume: Option<OsVolumeBody>,
}

/// Root volume section of [`CreateInstanceBody`].
#[derive(Debug, Serialize)]
pub struct OsVolumeBody {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<i64>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub volume_type: Option<String>,
}

/// Response from `POST /instances`.
#[derive(Debug, Deserialize)]
pub struct CreateInstanceResponse {
    pub id: String,
}

/// Response from `GET /instances/{id}`.
#[derive(Debug, Deserialize)]
pub struct InstanceResource {
    pub id: String,
    pub hostname: String,
    pub status: String,
    #[serde(default)]
    pub instance_type: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub public_ip: Option<String>,
    #[serde(default)]
    pub private_ip: Option<String>,
    #[serde(default)]
    pub ssh_key: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
}

impl From<InstanceResource> for Instance {
    fn from(resource: InstanceResource) -> Self {
        Self {
            id: resource.id,
            name: resource.hostname,
            state: InstanceState::from(resource.status),
            instance_type: resource.instance_type.unwrap_or_default(),
            image_id: resource.image.unwrap_or_default(),
            public_ip: non_empty(resource.public_ip),
            private_ip: non_empty(resource.private_ip),
            ssh_key_name: non_empty(resource.ssh_key),
            created_at: parse_timestamp(resource.created_at.as_deref()),
        }
    }
}

// ============================================================================
// Images
// ============================================================================

/// Response from `GET /images`.
#[derive(Debug, Deserialize)]
pub struct ImageList {
    #[serde(default)]
    pub images: Vec<ImageResource>,
}

/// Image entry, also the response from `GET /images/{id}`.
#[derive(Debug, Deserialize)]
pub struct ImageResource {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub os_type: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
}

impl From<ImageResource> for Image {
    fn from(resource: ImageResource) -> Self {
        Self {
            id: resource.id,
            name: resource.name,
            description: non_empty(resource.description),
            os_type: non_empty(resource.os_type),
            created_at: parse_timestamp(resource.created_at.as_deref()),
        }
    }
}

// ============================================================================
// SSH keys
// ============================================================================

/// Response from `GET /ssh-keys`.
#[derive(Debug, Deserialize)]
pub struct SshKeyList {
    #[serde(default)]
    pub ssh_keys: Vec<SshKeyResource>,
}

/// SSH key entry, also the response from `POST /ssh-keys`.
#[derive(Debug, Deserialize)]
pub struct SshKeyResource {
    pub id: String,
    pub name: String,
    pub public_key: String,
    #[serde(default)]
    pub created_at: Option<String>,
}

impl From<SshKeyResource> for SshKey {
    fn from(resource: SshKeyResource) -> Self {
        Self {
            id: resource.id,
            name: resource.name,
            public_key: resource.public_key,
            created_at: parse_timestamp(resource.created_at.as_deref()),
        }
    }
}

/// Body for `POST /ssh-keys`.
#[derive(Debug, Serialize)]
pub struct CreateSshKeyBody<'a> {
    pub name: &'a str,
    pub public_key: &'a str,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

fn parse_timestamp(raw: Option<&str>) -> Option<DateTime<Utc>> {
    raw.and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_resource_tolerates_missing_optionals() {
        let resource: InstanceResource = serde_json::from_str(
            r#"{"id":"inst-1","hostname":"worker-0","status":"running","public_ip":"","created_at":"2024-05-01T10:00:00Z"}"#,
        )
        .unwrap();
        let instance = Instance::from(resource);

        assert_eq!(instance.state, InstanceState::Running);
        assert_eq!(instance.public_ip, None);
        assert_eq!(instance.private_ip, None);
        assert!(instance.created_at.is_some());
        assert_eq!(instance.instance_type, "");
    }

    #[test]
    fn create_body_omits_unset_fields() {
        let body = CreateInstanceBody {
            hostname: "worker-0".to_string(),
            instance_type: "1xH100".to_string(),
            image: "ubuntu-22.04-cuda-12.1".to_string(),
            ssh_key: None,
            user_data: Some("ZWNobyBoaQ==".to_string()),
            location_code: None,
            metadata: BTreeMap::new(),
            tags: BTreeMap::new(),
            public_ip: true,
            is_spot: false,
            spot_max_price: None,
            os_volume: None,
        };
        let json = serde_json::to_value(&body).unwrap();

        assert_eq!(json["hostname"], "worker-0");
        assert_eq!(json["user_data"], "ZWNobyBoaQ==");
        assert!(json.get("ssh_key").is_none());
        assert!(json.get("tags").is_none());
    }
}
