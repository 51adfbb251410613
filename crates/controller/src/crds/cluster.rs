//! `DataCrunchCluster` Custom Resource Definition

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::conditions::Condition;

/// Finalizer guarding cluster-level cloud resources.
pub const CLUSTER_FINALIZER: &str = "datacrunchcluster.infrastructure.cluster.x-k8s.io";

/// Host and port of the workload cluster API server.
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq)]
pub struct ApiEndpoint {
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: i32,
}

impl ApiEndpoint {
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.host.is_empty() && self.port == 0
    }
}

/// Control plane load balancer options.
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DataCrunchLoadBalancerSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(default, rename = "type", skip_serializing_if = "String::is_empty")]
    pub lb_type: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub health_check_path: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DataCrunchNetworkSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vpc: Option<DataCrunchVpcSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subnets: Vec<DataCrunchSubnetSpec>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DataCrunchVpcSpec {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cidr_block: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DataCrunchSubnetSpec {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cidr_block: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub availability_zone: String,
    #[serde(default)]
    pub is_public: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
}

/// Location of the secret holding DataCrunch API credentials.
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq)]
pub struct SecretReference {
    pub name: String,
    /// Defaults to the namespace of the referencing object
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// `DataCrunchCluster` describes the cloud side of a Cluster API cluster.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[kube(
    group = "infrastructure.cluster.x-k8s.io",
    version = "v1beta1",
    kind = "DataCrunchCluster"
)]
#[kube(namespaced)]
#[kube(status = "DataCrunchClusterStatus")]
#[kube(shortname = "dcc")]
#[kube(printcolumn = r#"{"name":"Cluster","type":"string","jsonPath":".metadata.labels['cluster\\.x-k8s\\.io/cluster-name']"}"#)]
#[kube(printcolumn = r#"{"name":"Ready","type":"boolean","jsonPath":".status.ready"}"#)]
#[kube(printcolumn = r#"{"name":"Endpoint","type":"string","jsonPath":".spec.controlPlaneEndpoint.host"}"#)]
#[kube(printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#)]
#[serde(rename_all = "camelCase")]
pub struct DataCrunchClusterSpec {
    /// DataCrunch location code
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub region: String,

    /// API server endpoint; filled in by the controller when left empty
    #[serde(default)]
    pub control_plane_endpoint: ApiEndpoint,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_plane_load_balancer: Option<DataCrunchLoadBalancerSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<DataCrunchNetworkSpec>,

    /// Secret with `clientID`, `clientSecret` and optional `baseURL` keys
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials_ref: Option<SecretReference>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FailureDomainSpec {
    #[serde(default)]
    pub control_plane: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DataCrunchNetworkStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vpc: Option<DataCrunchVpcStatus>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subnets: Vec<DataCrunchSubnetStatus>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DataCrunchVpcStatus {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cidr_block: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub state: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DataCrunchSubnetStatus {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cidr_block: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub availability_zone: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub state: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DataCrunchLoadBalancerStatus {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub dns_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub state: String,
}

/// Status of the `DataCrunchCluster`
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DataCrunchClusterStatus {
    /// True once network and load balancer reconciliation have succeeded
    #[serde(default)]
    pub ready: bool,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub failure_domains: BTreeMap<String, FailureDomainSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<DataCrunchNetworkStatus>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_balancer: Option<DataCrunchLoadBalancerStatus>,
}

impl DataCrunchCluster {
    /// Status, initialised on first access.
    pub fn status_mut(&mut self) -> &mut DataCrunchClusterStatus {
        self.status.get_or_insert_with(DataCrunchClusterStatus::default)
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.status.as_ref().is_some_and(|s| s.ready)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_deserializes_from_manifest_fields() {
        let spec: DataCrunchClusterSpec = serde_json::from_value(serde_json::json!({
            "region": "FIN-01",
            "controlPlaneEndpoint": {"host": "10.0.0.1", "port": 6443},
            "controlPlaneLoadBalancer": {"enabled": true, "type": "nlb", "healthCheckPath": "/readyz"},
            "credentialsRef": {"name": "dc-creds"}
        }))
        .unwrap();

        assert_eq!(spec.region, "FIN-01");
        assert!(!spec.control_plane_endpoint.is_zero());
        assert_eq!(
            spec.control_plane_load_balancer.unwrap().health_check_path,
            "/readyz"
        );
        assert_eq!(spec.credentials_ref.unwrap().name, "dc-creds");
    }

    #[test]
    fn empty_endpoint_is_zero() {
        let spec: DataCrunchClusterSpec = serde_json::from_str("{}").unwrap();
        assert!(spec.control_plane_endpoint.is_zero());
    }
}
