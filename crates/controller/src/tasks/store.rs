//! Reads from and writes back to the Kubernetes API.

use std::collections::BTreeMap;
use std::fmt::Debug;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::api::PostParams;
use kube::core::object::{HasSpec, HasStatus};
use kube::{Api, Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use super::types::{Error, Result};

/// Decoded contents of a secret, keyed by data key.
pub type SecretData = BTreeMap<String, Vec<u8>>;

/// Read access to secrets.
#[async_trait]
pub trait SecretReader: Send + Sync {
    /// Fetch a secret's data; `None` when the secret does not exist.
    async fn read(&self, namespace: &str, name: &str) -> Result<Option<SecretData>>;
}

/// [`SecretReader`] backed by the API server.
pub struct KubeSecretReader {
    client: Client,
}

impl KubeSecretReader {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SecretReader for KubeSecretReader {
    async fn read(&self, namespace: &str, name: &str) -> Result<Option<SecretData>> {
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let Some(secret) = secrets.get_opt(name).await? else {
            return Ok(None);
        };

        let data = secret
            .data
            .unwrap_or_default()
            .into_iter()
            .map(|(key, value)| (key, value.0))
            .collect();
        Ok(Some(data))
    }
}

/// Writes needed to bring the stored object in line with the reconciled one.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WritePlan {
    /// Metadata or spec changed: `replace` the object
    pub replace_object: bool,
    /// Status changed and the object is staying: `replace_status`
    pub replace_status: bool,
    /// Deletion is pending and the last finalizer is gone
    pub released: bool,
}

impl WritePlan {
    #[must_use]
    pub fn is_noop(&self) -> bool {
        !self.replace_object && !self.replace_status
    }
}

/// Decide which writes `persist` issues for `before` -> `after`.
pub fn plan_write<K>(before: &K, after: &K) -> WritePlan
where
    K: Resource + HasSpec + HasStatus,
    K::Spec: PartialEq,
    K::Status: PartialEq,
{
    let released = after.meta().deletion_timestamp.is_some() && after.finalizers().is_empty();
    let replace_object =
        before.finalizers() != after.finalizers() || before.spec() != after.spec();
    let replace_status = !released && before.status() != after.status();
    WritePlan {
        replace_object,
        replace_status,
        released,
    }
}

/// Carry the resourceVersion of a successful write into `after`, so the
/// status write that follows is checked against it.
pub fn adopt_resource_version<K: Resource>(after: &mut K, written: &K) {
    after.meta_mut().resource_version = written.meta().resource_version.clone();
}

/// A 404 on the object write only means the API server already removed an
/// object whose last finalizer was just dropped.
#[must_use]
pub fn is_gone_after_release(err: &kube::Error, plan: &WritePlan) -> bool {
    plan.released && matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

/// Write the reconciled object back.
///
/// Metadata and spec go through `replace`, which carries the resourceVersion
/// read at the start of the reconcile and fails with 409 if the object moved
/// on meanwhile. Status follows through the status subresource. Nothing is
/// written when nothing changed.
pub async fn persist<K>(api: &Api<K>, before: &K, after: &mut K) -> Result<()>
where
    K: Resource + HasSpec + HasStatus + Clone + Serialize + DeserializeOwned + Debug,
    K::Spec: PartialEq,
    K::Status: PartialEq,
{
    let plan = plan_write(before, after);
    if plan.is_noop() {
        return Ok(());
    }
    let name = after.meta().name.clone().ok_or(Error::MissingObjectKey)?;

    if plan.replace_object {
        debug!(name = %name, "Updating object");
        match api.replace(&name, &PostParams::default(), after).await {
            Ok(written) => adopt_resource_version(after, &written),
            Err(e) if is_gone_after_release(&e, &plan) => return Ok(()),
            Err(e) => return Err(e.into()),
        }
    }

    if plan.replace_status {
        debug!(name = %name, "Updating status");
        let body = serde_json::to_vec(after)?;
        api.replace_status(&name, &PostParams::default(), body)
            .await?;
    }
    Ok(())
}

/// Add `finalizer` if missing; returns whether it was added.
pub fn add_finalizer<K: Resource>(obj: &mut K, finalizer: &str) -> bool {
    if has_finalizer(obj, finalizer) {
        return false;
    }
    obj.finalizers_mut().push(finalizer.to_string());
    true
}

/// Remove `finalizer` if present.
pub fn remove_finalizer<K: Resource>(obj: &mut K, finalizer: &str) {
    obj.finalizers_mut().retain(|f| f != finalizer);
}

pub fn has_finalizer<K: Resource>(obj: &K, finalizer: &str) -> bool {
    obj.finalizers().iter().any(|f| f == finalizer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crds::{DataCrunchMachine, DataCrunchMachineSpec, MACHINE_FINALIZER};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    fn stored() -> DataCrunchMachine {
        let mut machine = DataCrunchMachine::new("m", DataCrunchMachineSpec::default());
        machine.metadata.resource_version = Some("41".to_string());
        machine.metadata.finalizers = Some(vec![MACHINE_FINALIZER.to_string()]);
        machine
    }

    fn api_error(code: u16) -> kube::Error {
        kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: "stubbed".to_string(),
            reason: "Stubbed".to_string(),
            code,
        })
    }

    #[test]
    fn unchanged_object_writes_nothing() {
        let before = stored();
        let plan = plan_write(&before, &before.clone());
        assert!(plan.is_noop());
        assert!(!plan.released);
    }

    #[test]
    fn status_only_change_skips_object_replace() {
        let before = stored();
        let mut after = before.clone();
        after.status_mut().ready = true;

        let plan = plan_write(&before, &after);
        assert!(!plan.replace_object);
        assert!(plan.replace_status);
    }

    #[test]
    fn spec_and_finalizer_changes_replace_object() {
        let before = stored();
        let mut stamped = before.clone();
        stamped.spec.provider_id = Some("datacrunch://inst-1".to_string());
        assert!(plan_write(&before, &stamped).replace_object);

        let fresh = DataCrunchMachine::new("m", DataCrunchMachineSpec::default());
        let mut finalized = fresh.clone();
        add_finalizer(&mut finalized, MACHINE_FINALIZER);
        let plan = plan_write(&fresh, &finalized);
        assert!(plan.replace_object);
        assert!(!plan.replace_status);
    }

    #[test]
    fn released_object_skips_status_and_tolerates_404() {
        let mut before = stored();
        before.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        let mut after = before.clone();
        remove_finalizer(&mut after, MACHINE_FINALIZER);
        after.status_mut().ready = false;

        let plan = plan_write(&before, &after);
        assert!(plan.released);
        assert!(plan.replace_object);
        assert!(!plan.replace_status);
        assert!(is_gone_after_release(&api_error(404), &plan));
        assert!(!is_gone_after_release(&api_error(409), &plan));
    }

    #[test]
    fn missing_object_is_an_error_while_finalized() {
        let before = stored();
        let mut after = before.clone();
        after.spec.provider_id = Some("datacrunch://inst-1".to_string());

        let plan = plan_write(&before, &after);
        assert!(!is_gone_after_release(&api_error(404), &plan));
    }

    #[test]
    fn status_write_uses_version_of_object_write() {
        let mut after = stored();
        let mut written = after.clone();
        written.metadata.resource_version = Some("42".to_string());

        adopt_resource_version(&mut after, &written);
        assert_eq!(after.metadata.resource_version.as_deref(), Some("42"));
    }

    #[test]
    fn finalizer_helpers_are_idempotent() {
        let mut machine = DataCrunchMachine::new("m", DataCrunchMachineSpec::default());

        assert!(add_finalizer(&mut machine, MACHINE_FINALIZER));
        assert!(!add_finalizer(&mut machine, MACHINE_FINALIZER));
        assert_eq!(machine.finalizers().len(), 1);

        remove_finalizer(&mut machine, MACHINE_FINALIZER);
        remove_finalizer(&mut machine, MACHINE_FINALIZER);
        assert!(!has_finalizer(&machine, MACHINE_FINALIZER));
    }
}
