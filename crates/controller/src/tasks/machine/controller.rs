use std::sync::Arc;

use capdc_cloud::{CloudClient, Instance, InstanceState};
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Api, Resource, ResourceExt};
use tracing::{debug, info, instrument, warn};

use super::instance::{create_instance, find_instance, machine_addresses};
use crate::crds::capi::{self, Cluster, Machine};
use crate::crds::conditions::{
    self, DATACRUNCH_CLIENT_FAILED, INSTANCE_CREATION_FAILED, INSTANCE_NOT_READY, INSTANCE_READY,
    INSTANCE_TERMINATED, WAITING_FOR_BOOTSTRAP_DATA, WAITING_FOR_CLUSTER_INFRASTRUCTURE,
};
use crate::crds::{
    ConditionSeverity, DataCrunchCluster, DataCrunchMachine, ProviderId, UPDATE_MACHINE_ERROR,
};
use crate::tasks::cloud::{self, credentials_location, SecretLocation};
use crate::tasks::config::ControllerConfig;
use crate::tasks::events::{INSTANCE_CREATED, INSTANCE_DELETED};
use crate::tasks::store::{add_finalizer, has_finalizer, persist, remove_finalizer};
use crate::tasks::types::{object_key, CallGuard, Context, Error, Result, Services, MACHINE_FINALIZER};

/// Everything a machine reconcile needs to know about its owners.
#[derive(Clone, Debug)]
pub struct MachineScope {
    pub cluster_name: String,
    /// Name of the owning Cluster API Machine
    pub machine_name: String,
    pub namespace: String,
    /// Location code of the DataCrunchCluster
    pub region: String,
    pub infrastructure_ready: bool,
    pub bootstrap_data_secret: Option<String>,
    pub credentials: SecretLocation,
}

/// Owner chain of a DataCrunchMachine.
struct Owners {
    machine: Machine,
    cluster: Cluster,
    infra_cluster: DataCrunchCluster,
}

impl MachineScope {
    fn from_owners(owners: &Owners, namespace: &str, config: &ControllerConfig) -> Self {
        Self {
            cluster_name: owners.cluster.name_any(),
            machine_name: owners.machine.name_any(),
            namespace: namespace.to_string(),
            region: owners.infra_cluster.spec.region.clone(),
            infrastructure_ready: owners.cluster.infrastructure_ready(),
            bootstrap_data_secret: owners.machine.spec.bootstrap.data_secret_name.clone(),
            credentials: credentials_location(&owners.infra_cluster, config),
        }
    }
}

/// Controller entry point for DataCrunchMachine.
#[instrument(skip(machine, ctx), fields(machine = %machine.name_any(), namespace = ?machine.namespace()))]
pub async fn reconcile_data_crunch_machine(
    machine: Arc<DataCrunchMachine>,
    ctx: Arc<Context>,
) -> Result<Action> {
    let namespace = machine.namespace().ok_or(Error::MissingObjectKey)?;
    let name = machine.name_any();
    let machines: Api<DataCrunchMachine> = Api::namespaced(ctx.client.clone(), &namespace);

    // The cached copy may be stale; work from what the API server has now.
    let Some(before) = machines.get_opt(&name).await? else {
        debug!("DataCrunchMachine no longer exists");
        return Ok(Action::await_change());
    };

    let owners = fetch_owners(&ctx, &before, &namespace).await?;
    if let Some(owners) = &owners {
        if capi::is_paused(&owners.cluster, &before) {
            info!("Reconciliation is paused for this object");
            return Ok(Action::await_change());
        }
    }

    let mut after = before.clone();
    let guard = ctx.call_guard();

    let outcome = if before.meta().deletion_timestamp.is_some() {
        let credentials = owners
            .as_ref()
            .map(|o| credentials_location(&o.infra_cluster, ctx.config()));
        reconcile_delete(&mut after, credentials.as_ref(), &ctx.services, &guard).await
    } else {
        let Some(owners) = owners else {
            return Ok(Action::await_change());
        };
        let scope = MachineScope::from_owners(&owners, &namespace, ctx.config());
        reconcile_normal(&mut after, &scope, &ctx.services, &guard).await
    };

    let mut persisted = persist(&machines, &before, &mut after).await;
    if persisted.as_ref().is_err_and(Error::is_conflict) && newly_stamped(&before, &after) {
        persisted = persist_stamp_after_conflict(&machines, &name, &after).await;
    }

    let settled = settle(outcome, persisted);
    if settled.is_ok() {
        ctx.reset_backoff(&object_key("DataCrunchMachine", &namespace, &name));
    }
    settled
}

/// Combine the reconcile outcome with the result of writing it back.
///
/// The reconcile error wins; a write failure alone fails the reconcile.
fn settle(outcome: Result<Action>, persisted: Result<()>) -> Result<Action> {
    match (outcome, persisted) {
        (Ok(action), Ok(())) => Ok(action),
        (Err(e), Ok(())) | (Ok(_), Err(e)) => Err(e),
        (Err(e), Err(persist_err)) => {
            warn!(error = %persist_err, "Failed to persist DataCrunchMachine after a failed reconcile");
            Err(e)
        }
    }
}

/// Whether this reconcile stamped the providerID.
fn newly_stamped(before: &DataCrunchMachine, after: &DataCrunchMachine) -> bool {
    before.spec.provider_id.is_none() && after.spec.provider_id.is_some()
}

/// The stored object moved on while an instance was being created. Re-read
/// it and write the stamp onto the latest version, so the instance is not
/// lost and created again on the next reconcile.
async fn persist_stamp_after_conflict(
    machines: &Api<DataCrunchMachine>,
    name: &str,
    stamped: &DataCrunchMachine,
) -> Result<()> {
    let latest = machines.get(name).await?;
    let Some(mut rebased) = rebase_stamp(&latest, stamped) else {
        return Err(Error::ProviderIdConflict {
            stored: latest.spec.provider_id.clone().unwrap_or_default(),
            created: stamped.spec.provider_id.clone().unwrap_or_default(),
        });
    };
    info!("Retrying providerID write on the latest DataCrunchMachine");
    persist(machines, &latest, &mut rebased).await
}

/// `latest` with the stamp, finalizer and status of `stamped` applied.
///
/// `None` when `latest` already records a different instance.
fn rebase_stamp(
    latest: &DataCrunchMachine,
    stamped: &DataCrunchMachine,
) -> Option<DataCrunchMachine> {
    match (&latest.spec.provider_id, &stamped.spec.provider_id) {
        (Some(stored), Some(ours)) if stored != ours => return None,
        (_, None) => return None,
        _ => {}
    }

    let mut rebased = latest.clone();
    rebased.spec.provider_id.clone_from(&stamped.spec.provider_id);
    if has_finalizer(stamped, MACHINE_FINALIZER) {
        add_finalizer(&mut rebased, MACHINE_FINALIZER);
    }
    rebased.status.clone_from(&stamped.status);
    Some(rebased)
}

/// Resolve the Machine, Cluster and DataCrunchCluster behind `dc_machine`.
///
/// `None` when any of them is not there yet; the watches bring the object
/// back once they appear.
async fn fetch_owners(
    ctx: &Context,
    dc_machine: &DataCrunchMachine,
    namespace: &str,
) -> Result<Option<Owners>> {
    let Some(machine_name) = capi::owner_name(dc_machine.meta(), "Machine") else {
        info!("Machine owner reference is not set yet");
        return Ok(None);
    };

    let machines: Api<Machine> = Api::namespaced(ctx.client.clone(), namespace);
    let Some(machine) = machines.get_opt(machine_name).await? else {
        info!(machine = %machine_name, "Owning Machine not found");
        return Ok(None);
    };

    let Some(cluster_name) = machine.cluster_name().map(str::to_string) else {
        info!(machine = %machine_name, "Machine is not associated with a cluster");
        return Ok(None);
    };
    let clusters: Api<Cluster> = Api::namespaced(ctx.client.clone(), namespace);
    let Some(cluster) = clusters.get_opt(&cluster_name).await? else {
        info!(cluster = %cluster_name, "Cluster not found");
        return Ok(None);
    };

    let Some(infra_name) = cluster.infrastructure_name("DataCrunchCluster") else {
        info!(cluster = %cluster_name, "Cluster has no DataCrunchCluster infrastructure reference");
        return Ok(None);
    };
    let infra_clusters: Api<DataCrunchCluster> = Api::namespaced(ctx.client.clone(), namespace);
    let Some(infra_cluster) = infra_clusters.get_opt(infra_name).await? else {
        info!(cluster = %infra_name, "DataCrunchCluster not found");
        return Ok(None);
    };

    Ok(Some(Owners {
        machine,
        cluster,
        infra_cluster,
    }))
}

/// Drive `machine` one step towards a running instance.
///
/// Mutates `machine` in place; the caller persists it.
pub async fn reconcile_normal(
    machine: &mut DataCrunchMachine,
    scope: &MachineScope,
    services: &Services,
    guard: &CallGuard,
) -> Result<Action> {
    if machine.is_failed() {
        debug!("Machine has a terminal failure recorded, skipping");
        return Ok(Action::await_change());
    }

    if add_finalizer(machine, MACHINE_FINALIZER) {
        debug!("Added finalizer");
        return Ok(Action::await_change());
    }

    if !scope.infrastructure_ready {
        info!(cluster = %scope.cluster_name, "Waiting for cluster infrastructure to be ready");
        mark_instance_not_ready(
            machine,
            WAITING_FOR_CLUSTER_INFRASTRUCTURE,
            ConditionSeverity::Info,
            "",
        );
        return Ok(Action::await_change());
    }

    if scope.bootstrap_data_secret.is_none() {
        info!(machine = %scope.machine_name, "Waiting for bootstrap data");
        mark_instance_not_ready(machine, WAITING_FOR_BOOTSTRAP_DATA, ConditionSeverity::Info, "");
        return Ok(Action::await_change());
    }

    let client = match cloud::connect(services, &scope.credentials, guard).await {
        Ok(client) => client,
        Err(e) => {
            mark_instance_not_ready(
                machine,
                DATACRUNCH_CLIENT_FAILED,
                ConditionSeverity::Error,
                e.to_string(),
            );
            return Err(e);
        }
    };

    let instance = match find_instance(client.as_ref(), machine, guard).await? {
        Some(instance) => instance,
        None if machine.spec.provider_id.is_some() => {
            // The providerID is never rewritten, so a replacement instance
            // could not be tracked.
            let provider_id = machine.spec.provider_id.clone().unwrap_or_default();
            warn!(provider_id = %provider_id, "Instance no longer exists");
            latch_failure(machine, format!("Instance {provider_id} no longer exists"));
            return Ok(Action::await_change());
        }
        None => create(client.as_ref(), machine, scope, services, guard).await?,
    };

    stamp_provider_id(machine, &instance.id);

    project_instance_state(machine, &instance, client.as_ref(), services, guard).await
}

async fn create(
    client: &dyn CloudClient,
    machine: &mut DataCrunchMachine,
    scope: &MachineScope,
    services: &Services,
    guard: &CallGuard,
) -> Result<Instance> {
    let created = create_instance(
        client,
        services.secrets.as_ref(),
        machine,
        scope,
        &services.config.default_image,
        guard,
    )
    .await;

    match created {
        Ok(instance) => {
            info!(instance_id = %instance.id, "Created DataCrunch instance");
            stamp_provider_id(machine, &instance.id);
            services
                .events
                .publish(
                    &machine.object_ref(&()),
                    EventType::Normal,
                    INSTANCE_CREATED,
                    "Create",
                    format!("Created new DataCrunch instance {}", instance.id),
                )
                .await;
            mark_instance_not_ready(machine, INSTANCE_NOT_READY, ConditionSeverity::Info, "");
            Ok(instance)
        }
        Err(e) => {
            warn!(error = %e, "Failed to create DataCrunch instance");
            mark_instance_not_ready(
                machine,
                INSTANCE_CREATION_FAILED,
                ConditionSeverity::Error,
                e.to_string(),
            );
            Err(e)
        }
    }
}

/// Reflect the observed instance state in status and decide when to look again.
async fn project_instance_state(
    machine: &mut DataCrunchMachine,
    instance: &Instance,
    client: &dyn CloudClient,
    services: &Services,
    guard: &CallGuard,
) -> Result<Action> {
    let requeue = services.config.requeue_interval();
    machine.status_mut().instance_state = Some(instance.state.clone());

    match &instance.state {
        InstanceState::Running => {
            let status = machine.status_mut();
            status.ready = true;
            status.addresses = machine_addresses(instance);
            conditions::mark_true(&mut status.conditions, INSTANCE_READY);
            // Look again later so provider-side stops and terminations are noticed.
            Ok(Action::requeue(services.config.sync_period()))
        }
        InstanceState::Pending => {
            debug!(instance_id = %instance.id, "Instance is pending");
            mark_instance_not_ready(
                machine,
                INSTANCE_NOT_READY,
                ConditionSeverity::Info,
                "Instance is pending",
            );
            Ok(Action::requeue(requeue))
        }
        InstanceState::Stopped => {
            info!(instance_id = %instance.id, "Starting stopped instance");
            let operation = format!("start instance {}", instance.id);
            guard
                .call(&operation, client.start_instance(&instance.id))
                .await
                .map_err(|e| e.requeue(requeue))?;
            Ok(Action::requeue(requeue))
        }
        InstanceState::Terminated => {
            warn!(instance_id = %instance.id, "Instance was terminated");
            latch_failure(machine, "Instance was terminated");
            Ok(Action::await_change())
        }
        other => {
            debug!(instance_id = %instance.id, state = %other, "Instance is in a transitional state");
            mark_instance_not_ready(
                machine,
                INSTANCE_NOT_READY,
                ConditionSeverity::Warning,
                format!("Instance is in unknown state: {other}"),
            );
            Ok(Action::requeue(requeue))
        }
    }
}

/// Tear down the instance and release the finalizer.
///
/// `credentials` is `None` when the owning clusters are already gone; the
/// finalizer is then released without touching the cloud.
pub async fn reconcile_delete(
    machine: &mut DataCrunchMachine,
    credentials: Option<&SecretLocation>,
    services: &Services,
    guard: &CallGuard,
) -> Result<Action> {
    if !has_finalizer(machine, MACHINE_FINALIZER) {
        return Ok(Action::await_change());
    }

    let requeue = services.config.requeue_interval();
    let client = match credentials {
        Some(location) => match cloud::connect(services, location, guard).await {
            Ok(client) => Some(client),
            Err(e) => {
                warn!(error = %e, "Could not build DataCrunch client, skipping instance cleanup");
                None
            }
        },
        None => {
            warn!("Cluster context is gone, skipping instance cleanup");
            None
        }
    };

    if let Some(client) = client {
        let lookup = match find_instance(client.as_ref(), machine, guard).await {
            Err(Error::InvalidProviderId(raw)) => {
                warn!(provider_id = %raw, "Ignoring malformed providerID during deletion");
                Ok(None)
            }
            other => other,
        };
        let instance = lookup.map_err(|e| e.requeue(requeue))?;

        if let Some(instance) = instance {
            info!(instance_id = %instance.id, "Deleting DataCrunch instance");
            let operation = format!("delete instance {}", instance.id);
            match guard
                .call(&operation, client.delete_instance(&instance.id))
                .await
            {
                Ok(()) => {}
                Err(e) if e.is_cloud_not_found() => {
                    debug!(instance_id = %instance.id, "Instance already gone");
                }
                Err(e) => return Err(e.requeue(requeue)),
            }

            services
                .events
                .publish(
                    &machine.object_ref(&()),
                    EventType::Normal,
                    INSTANCE_DELETED,
                    "Delete",
                    format!("Deleted DataCrunch instance {}", instance.id),
                )
                .await;
        }
    }

    remove_finalizer(machine, MACHINE_FINALIZER);
    info!("Removed finalizer");
    Ok(Action::await_change())
}

/// Record the instance in `spec.providerID`; an existing value is never replaced.
fn stamp_provider_id(machine: &mut DataCrunchMachine, instance_id: &str) {
    if machine.spec.provider_id.is_some() {
        return;
    }
    let provider_id = ProviderId::new(instance_id);
    info!(provider_id = %provider_id, "Setting providerID");
    machine.spec.provider_id = Some(provider_id.to_string());
}

fn mark_instance_not_ready(
    machine: &mut DataCrunchMachine,
    reason: &str,
    severity: ConditionSeverity,
    message: impl Into<String>,
) {
    conditions::mark_false(
        &mut machine.status_mut().conditions,
        INSTANCE_READY,
        reason,
        severity,
        message,
    );
}

fn latch_failure(machine: &mut DataCrunchMachine, message: impl Into<String>) {
    let message = message.into();
    let status = machine.status_mut();
    status.ready = false;
    status.failure_reason = Some(UPDATE_MACHINE_ERROR.to_string());
    status.failure_message = Some(message.clone());
    conditions::mark_false(
        &mut status.conditions,
        INSTANCE_READY,
        INSTANCE_TERMINATED,
        ConditionSeverity::Error,
        message,
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crds::capi::{Bootstrap, ClusterSpec, ClusterStatus, MachineSpec};
    use crate::crds::{DataCrunchClusterSpec, DataCrunchMachineSpec};
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn stamped() -> DataCrunchMachine {
        let mut machine = DataCrunchMachine::new("worker-0", DataCrunchMachineSpec::default());
        machine.metadata.finalizers = Some(vec![MACHINE_FINALIZER.to_string()]);
        machine.spec.provider_id = Some("datacrunch://inst-1".to_string());
        machine.status_mut().instance_state = Some(InstanceState::Pending);
        machine
    }

    fn concurrently_labelled() -> DataCrunchMachine {
        let mut latest = DataCrunchMachine::new("worker-0", DataCrunchMachineSpec::default());
        latest.metadata.resource_version = Some("7".to_string());
        latest.metadata.labels = Some(BTreeMap::from([(
            "cluster.x-k8s.io/cluster-name".to_string(),
            "demo".to_string(),
        )]));
        latest
    }

    #[test]
    fn stamp_is_rebased_onto_latest_object() {
        let latest = concurrently_labelled();

        let rebased = rebase_stamp(&latest, &stamped()).unwrap();

        assert_eq!(
            rebased.spec.provider_id.as_deref(),
            Some("datacrunch://inst-1")
        );
        assert_eq!(rebased.metadata.resource_version.as_deref(), Some("7"));
        assert_eq!(rebased.labels()["cluster.x-k8s.io/cluster-name"], "demo");
        assert!(has_finalizer(&rebased, MACHINE_FINALIZER));
        assert_eq!(
            rebased.status.as_ref().unwrap().instance_state,
            Some(InstanceState::Pending)
        );
    }

    #[test]
    fn stamp_is_not_rebased_over_another_instance() {
        let mut latest = concurrently_labelled();
        latest.spec.provider_id = Some("datacrunch://inst-other".to_string());
        assert!(rebase_stamp(&latest, &stamped()).is_none());

        latest.spec.provider_id = Some("datacrunch://inst-1".to_string());
        assert!(rebase_stamp(&latest, &stamped()).is_some());
    }

    #[test]
    fn only_a_fresh_stamp_is_retried() {
        let before = DataCrunchMachine::new("worker-0", DataCrunchMachineSpec::default());
        assert!(newly_stamped(&before, &stamped()));
        assert!(!newly_stamped(&stamped(), &stamped()));
        assert!(!newly_stamped(&before, &before));
    }

    #[test]
    fn reconcile_error_wins_over_persist_error() {
        let requeue = Action::requeue(Duration::from_secs(30));
        assert_eq!(settle(Ok(requeue.clone()), Ok(())).unwrap(), requeue);

        let err = settle(Ok(requeue), Err(Error::MissingObjectKey)).unwrap_err();
        assert!(matches!(err, Error::MissingObjectKey));

        let err = settle(
            Err(Error::BootstrapData("missing".to_string())),
            Err(Error::MissingObjectKey),
        )
        .unwrap_err();
        assert!(matches!(err, Error::BootstrapData(_)));
    }

    #[test]
    fn scope_is_built_from_owner_chain() {
        let mut machine = Machine::new(
            "demo-md-0-abcde",
            MachineSpec {
                cluster_name: "demo".to_string(),
                bootstrap: Bootstrap {
                    data_secret_name: Some("demo-md-0-abcde-bootstrap".to_string()),
                },
                ..MachineSpec::default()
            },
        );
        machine.metadata.namespace = Some("team-a".to_string());
        let mut cluster = Cluster::new("demo", ClusterSpec::default());
        cluster.status = Some(ClusterStatus {
            infrastructure_ready: true,
        });
        let mut infra_cluster = DataCrunchCluster::new(
            "demo",
            DataCrunchClusterSpec {
                region: "FIN-01".to_string(),
                ..DataCrunchClusterSpec::default()
            },
        );
        infra_cluster.metadata.namespace = Some("team-a".to_string());
        let owners = Owners {
            machine,
            cluster,
            infra_cluster,
        };

        let scope = MachineScope::from_owners(&owners, "team-a", &ControllerConfig::default());

        assert_eq!(scope.cluster_name, "demo");
        assert_eq!(scope.machine_name, "demo-md-0-abcde");
        assert_eq!(scope.region, "FIN-01");
        assert!(scope.infrastructure_ready);
        assert_eq!(
            scope.bootstrap_data_secret.as_deref(),
            Some("demo-md-0-abcde-bootstrap")
        );
        assert_eq!(scope.credentials.to_string(), "team-a/datacrunch-credentials");
    }
}
