//! Read-only views of the core Cluster API resources this provider follows.
//!
//! Only the fields the reconcilers consult are modelled; everything else on
//! the live objects is ignored on deserialization.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{CustomResource, Resource};
use serde::{Deserialize, Serialize};

/// API group of the core Cluster API resources.
pub const CAPI_GROUP: &str = "cluster.x-k8s.io";

/// Label linking infrastructure objects to their Cluster API cluster.
pub const CLUSTER_NAME_LABEL: &str = "cluster.x-k8s.io/cluster-name";

/// Annotation that pauses reconciliation of an object.
pub const PAUSED_ANNOTATION: &str = "cluster.x-k8s.io/paused";

/// Label matched against the configured watch filter.
pub const WATCH_FILTER_LABEL: &str = "cluster.x-k8s.io/watch-filter";

/// Reference to another object in the same API server.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectRef {
    #[serde(default)]
    pub api_version: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// `cluster.x-k8s.io/v1beta1` Cluster.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default)]
#[kube(
    group = "cluster.x-k8s.io",
    version = "v1beta1",
    kind = "Cluster",
    namespaced,
    status = "ClusterStatus",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    #[serde(default)]
    pub paused: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub infrastructure_ref: Option<ObjectRef>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    #[serde(default)]
    pub infrastructure_ready: bool,
}

impl Cluster {
    /// Whether the infrastructure provider has reported the cluster ready.
    #[must_use]
    pub fn infrastructure_ready(&self) -> bool {
        self.status
            .as_ref()
            .is_some_and(|s| s.infrastructure_ready)
    }

    /// Name of the infrastructure object when it is of the given kind.
    #[must_use]
    pub fn infrastructure_name(&self, kind: &str) -> Option<&str> {
        self.spec
            .infrastructure_ref
            .as_ref()
            .filter(|r| r.kind == kind && !r.name.is_empty())
            .map(|r| r.name.as_str())
    }
}

/// `cluster.x-k8s.io/v1beta1` Machine.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default)]
#[kube(
    group = "cluster.x-k8s.io",
    version = "v1beta1",
    kind = "Machine",
    namespaced,
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct MachineSpec {
    #[serde(default)]
    pub cluster_name: String,

    #[serde(default)]
    pub bootstrap: Bootstrap,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub infrastructure_ref: Option<ObjectRef>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct Bootstrap {
    /// Secret holding the bootstrap data under key `value`, once generated
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_secret_name: Option<String>,
}

impl Machine {
    /// Cluster name from the cluster label, falling back to `spec.clusterName`.
    #[must_use]
    pub fn cluster_name(&self) -> Option<&str> {
        self.metadata
            .labels
            .as_ref()
            .and_then(|labels| labels.get(CLUSTER_NAME_LABEL))
            .map(String::as_str)
            .or(Some(self.spec.cluster_name.as_str()))
            .filter(|name| !name.is_empty())
    }

    /// Name of the infrastructure object when it is of the given kind.
    #[must_use]
    pub fn infrastructure_name(&self, kind: &str) -> Option<&str> {
        self.spec
            .infrastructure_ref
            .as_ref()
            .filter(|r| r.kind == kind && !r.name.is_empty())
            .map(|r| r.name.as_str())
    }
}

/// Name of the first owner of `kind` in the Cluster API group.
#[must_use]
pub fn owner_name<'a>(meta: &'a ObjectMeta, kind: &str) -> Option<&'a str> {
    meta.owner_references
        .as_deref()
        .unwrap_or_default()
        .iter()
        .find(|owner| {
            owner.kind == kind
                && owner
                    .api_version
                    .split_once('/')
                    .is_some_and(|(group, _)| group == CAPI_GROUP)
        })
        .map(|owner| owner.name.as_str())
}

/// Whether reconciliation is paused through the cluster or the object itself.
#[must_use]
pub fn is_paused<K: Resource>(cluster: &Cluster, object: &K) -> bool {
    cluster.spec.paused || has_paused_annotation(cluster.meta()) || has_paused_annotation(object.meta())
}

fn has_paused_annotation(meta: &ObjectMeta) -> bool {
    meta.annotations
        .as_ref()
        .is_some_and(|annotations| annotations.contains_key(PAUSED_ANNOTATION))
}
