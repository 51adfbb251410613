//! `DataCrunchMachine` Custom Resource Definition

use std::collections::BTreeMap;
use std::fmt;

use capdc_cloud::InstanceState;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::conditions::Condition;

/// Finalizer guarding the machine's cloud instance.
pub const MACHINE_FINALIZER: &str = "datacrunchmachine.infrastructure.cluster.x-k8s.io";

/// Scheme of provider IDs issued by this provider.
pub const PROVIDER_ID_SCHEME: &str = "datacrunch";

/// Cluster API machine status error recorded when the instance is lost.
pub const UPDATE_MACHINE_ERROR: &str = "UpdateError";

/// Root volume options.
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Volume {
    /// Size in GB
    #[serde(default)]
    pub size: i64,
    #[serde(default, rename = "type", skip_serializing_if = "String::is_empty")]
    pub volume_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iops: Option<i64>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkInterface {
    #[serde(default, rename = "subnetID", skip_serializing_if = "String::is_empty")]
    pub subnet_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_index: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub associate_public_ip_address: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delete_on_termination: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secondary_private_ip_address_count: Option<i64>,
    #[serde(default, rename = "securityGroupIDs", skip_serializing_if = "Vec::is_empty")]
    pub security_group_ids: Vec<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SpotMachineOptions {
    /// Maximum hourly price; empty means the on-demand price
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_price: Option<String>,
}

/// `DataCrunchMachine` describes one GPU instance backing a Cluster API machine.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[kube(
    group = "infrastructure.cluster.x-k8s.io",
    version = "v1beta1",
    kind = "DataCrunchMachine"
)]
#[kube(namespaced)]
#[kube(status = "DataCrunchMachineStatus")]
#[kube(shortname = "dcm")]
#[kube(printcolumn = r#"{"name":"Cluster","type":"string","jsonPath":".metadata.labels['cluster\\.x-k8s\\.io/cluster-name']"}"#)]
#[kube(printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.instanceState"}"#)]
#[kube(printcolumn = r#"{"name":"Ready","type":"boolean","jsonPath":".status.ready"}"#)]
#[kube(printcolumn = r#"{"name":"ProviderID","type":"string","jsonPath":".spec.providerID"}"#)]
#[kube(printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#)]
#[serde(rename_all = "camelCase")]
pub struct DataCrunchMachineSpec {
    /// Instance type (e.g. `1xH100`, `8xA100`)
    pub instance_type: String,

    /// Image ID or slug; defaults to the configured image
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ssh_key_name: String,

    /// `datacrunch://<instance-id>`, set once by the controller
    #[serde(default, rename = "providerID", skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub additional_metadata: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub additional_tags: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_volume: Option<Volume>,

    /// Set to false to gzip the bootstrap data before upload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uncompressed_user_data: Option<bool>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub network_interfaces: Vec<NetworkInterface>,

    #[serde(default, rename = "publicIP", skip_serializing_if = "Option::is_none")]
    pub public_ip: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spot: Option<SpotMachineOptions>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq)]
pub enum MachineAddressType {
    Hostname,
    #[serde(rename = "InternalIP")]
    InternalIp,
    #[serde(rename = "ExternalIP")]
    ExternalIp,
    #[serde(rename = "InternalDNS")]
    InternalDns,
    #[serde(rename = "ExternalDNS")]
    ExternalDns,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
pub struct MachineAddress {
    #[serde(rename = "type")]
    pub address_type: MachineAddressType,
    pub address: String,
}

impl MachineAddress {
    pub fn new(address_type: MachineAddressType, address: impl Into<String>) -> Self {
        Self {
            address_type,
            address: address.into(),
        }
    }
}

/// Status of the `DataCrunchMachine`
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DataCrunchMachineStatus {
    #[serde(default)]
    pub ready: bool,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub addresses: Vec<MachineAddress>,

    /// Last state reported by DataCrunch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<String>")]
    pub instance_state: Option<InstanceState>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Terminal error; once set the machine is never reconciled against the cloud again
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interruption_reason: Option<String>,
}

impl DataCrunchMachine {
    /// Status, initialised on first access.
    pub fn status_mut(&mut self) -> &mut DataCrunchMachineStatus {
        self.status.get_or_insert_with(DataCrunchMachineStatus::default)
    }

    /// Whether a terminal failure has been recorded.
    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.status
            .as_ref()
            .is_some_and(|s| s.failure_reason.is_some() || s.failure_message.is_some())
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.status.as_ref().is_some_and(|s| s.ready)
    }
}

/// Parsed `<scheme>://<instance-id>` provider ID.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProviderId {
    instance_id: String,
}

impl ProviderId {
    pub fn new(instance_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
        }
    }

    /// Parse a provider ID issued by this provider.
    ///
    /// Returns `None` for a foreign scheme or an empty instance ID.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        let (scheme, instance_id) = raw.split_once("://")?;
        if scheme != PROVIDER_ID_SCHEME || instance_id.is_empty() {
            return None;
        }
        Some(Self::new(instance_id))
    }

    #[must_use]
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{PROVIDER_ID_SCHEME}://{}", self.instance_id)
    }
}
