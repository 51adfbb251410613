use std::sync::Arc;

use capdc_cloud::CloudClient;
use kube::runtime::controller::Action;
use kube::{Api, Resource, ResourceExt};
use tracing::{debug, info, instrument, warn};

use crate::crds::capi::{self, Cluster};
use crate::crds::conditions::{
    self, DATACRUNCH_CLIENT_FAILED, LOAD_BALANCER_READY, LOAD_BALANCER_RECONCILIATION_FAILED,
    NETWORK_INFRASTRUCTURE_READY, NETWORK_RECONCILIATION_FAILED,
};
use crate::crds::{
    ApiEndpoint, ConditionSeverity, DataCrunchCluster, DataCrunchNetworkStatus, FailureDomainSpec,
};
use crate::tasks::cloud::{self, credentials_location, SecretLocation};
use crate::tasks::store::{add_finalizer, has_finalizer, persist, remove_finalizer};
use crate::tasks::types::{object_key, CallGuard, Context, Error, Result, Services, CLUSTER_FINALIZER};

/// Failure domain advertised when none has been discovered.
pub const DEFAULT_FAILURE_DOMAIN: &str = "default";

/// Port of the placeholder control plane endpoint.
pub const DEFAULT_API_SERVER_PORT: i32 = 6443;

#[derive(Clone, Debug)]
pub struct ClusterScope {
    /// Name of the owning Cluster API cluster
    pub cluster_name: String,
    pub namespace: String,
    pub credentials: SecretLocation,
}

/// Controller entry point for DataCrunchCluster.
#[instrument(skip(dc_cluster, ctx), fields(cluster = %dc_cluster.name_any(), namespace = ?dc_cluster.namespace()))]
pub async fn reconcile_data_crunch_cluster(
    dc_cluster: Arc<DataCrunchCluster>,
    ctx: Arc<Context>,
) -> Result<Action> {
    let namespace = dc_cluster.namespace().ok_or(Error::MissingObjectKey)?;
    let name = dc_cluster.name_any();
    let dc_clusters: Api<DataCrunchCluster> = Api::namespaced(ctx.client.clone(), &namespace);

    let Some(before) = dc_clusters.get_opt(&name).await? else {
        debug!("DataCrunchCluster no longer exists");
        return Ok(Action::await_change());
    };

    let cluster = match capi::owner_name(before.meta(), "Cluster") {
        Some(owner) => {
            let clusters: Api<Cluster> = Api::namespaced(ctx.client.clone(), &namespace);
            clusters.get_opt(owner).await?
        }
        None => None,
    };
    if let Some(cluster) = &cluster {
        if capi::is_paused(cluster, &before) {
            info!("Reconciliation is paused for this object");
            return Ok(Action::await_change());
        }
    }

    let credentials = credentials_location(&before, ctx.config());
    let mut after = before.clone();
    let guard = ctx.call_guard();

    let outcome = if before.meta().deletion_timestamp.is_some() {
        reconcile_delete(&mut after, &credentials, &ctx.services, &guard).await
    } else {
        let Some(cluster) = cluster else {
            info!("Cluster owner reference is not set yet");
            return Ok(Action::await_change());
        };
        let scope = ClusterScope {
            cluster_name: cluster.name_any(),
            namespace: namespace.clone(),
            credentials,
        };
        reconcile_normal(&mut after, &scope, &ctx.services, &guard).await
    };

    let persisted = persist(&dc_clusters, &before, &mut after).await;
    let key = object_key("DataCrunchCluster", &namespace, &name);
    match (outcome, persisted) {
        (Ok(action), Ok(())) => {
            ctx.reset_backoff(&key);
            Ok(action)
        }
        (Err(e), Ok(())) | (Ok(_), Err(e)) => Err(e),
        (Err(e), Err(persist_err)) => {
            warn!(error = %persist_err, "Failed to persist DataCrunchCluster after a failed reconcile");
            Err(e)
        }
    }
}

/// Bring the cluster infrastructure up and report it ready.
pub async fn reconcile_normal(
    dc_cluster: &mut DataCrunchCluster,
    scope: &ClusterScope,
    services: &Services,
    guard: &CallGuard,
) -> Result<Action> {
    if add_finalizer(dc_cluster, CLUSTER_FINALIZER) {
        debug!("Added finalizer");
        return Ok(Action::await_change());
    }

    let requeue = services.config.requeue_interval();
    let client = match cloud::connect(services, &scope.credentials, guard).await {
        Ok(client) => client,
        Err(e) => {
            conditions::mark_false(
                &mut dc_cluster.status_mut().conditions,
                NETWORK_INFRASTRUCTURE_READY,
                DATACRUNCH_CLIENT_FAILED,
                ConditionSeverity::Error,
                e.to_string(),
            );
            return Err(e);
        }
    };

    if let Err(e) = reconcile_network(dc_cluster, client.as_ref()) {
        conditions::mark_false(
            &mut dc_cluster.status_mut().conditions,
            NETWORK_INFRASTRUCTURE_READY,
            NETWORK_RECONCILIATION_FAILED,
            ConditionSeverity::Error,
            e.to_string(),
        );
        return Err(e.requeue(requeue));
    }

    if let Err(e) = reconcile_load_balancer(dc_cluster, scope, client.as_ref()) {
        conditions::mark_false(
            &mut dc_cluster.status_mut().conditions,
            LOAD_BALANCER_READY,
            LOAD_BALANCER_RECONCILIATION_FAILED,
            ConditionSeverity::Error,
            e.to_string(),
        );
        return Err(e.requeue(requeue));
    }

    let status = dc_cluster.status_mut();
    status.ready = true;
    conditions::mark_true(&mut status.conditions, NETWORK_INFRASTRUCTURE_READY);
    conditions::mark_true(&mut status.conditions, LOAD_BALANCER_READY);
    info!(cluster = %scope.cluster_name, "DataCrunchCluster is ready");
    Ok(Action::await_change())
}

/// DataCrunch has no VPC API; record an empty network and a single failure domain.
#[allow(clippy::unnecessary_wraps)]
fn reconcile_network(dc_cluster: &mut DataCrunchCluster, _client: &dyn CloudClient) -> Result<()> {
    let status = dc_cluster.status_mut();
    status
        .network
        .get_or_insert_with(DataCrunchNetworkStatus::default);
    if status.failure_domains.is_empty() {
        status.failure_domains.insert(
            DEFAULT_FAILURE_DOMAIN.to_string(),
            FailureDomainSpec {
                control_plane: true,
                ..FailureDomainSpec::default()
            },
        );
    }
    Ok(())
}

/// Without a load balancer API the control plane endpoint is a placeholder
/// name derived from the cluster.
#[allow(clippy::unnecessary_wraps)]
fn reconcile_load_balancer(
    dc_cluster: &mut DataCrunchCluster,
    scope: &ClusterScope,
    _client: &dyn CloudClient,
) -> Result<()> {
    if !dc_cluster.spec.control_plane_endpoint.is_zero() {
        return Ok(());
    }

    let endpoint = ApiEndpoint {
        host: format!("cluster-{}.datacrunch.local", scope.cluster_name),
        port: DEFAULT_API_SERVER_PORT,
    };
    info!(host = %endpoint.host, port = endpoint.port, "Setting control plane endpoint");
    dc_cluster.spec.control_plane_endpoint = endpoint;
    Ok(())
}

/// Release cloud resources on a best-effort basis and drop the finalizer.
pub async fn reconcile_delete(
    dc_cluster: &mut DataCrunchCluster,
    credentials: &SecretLocation,
    services: &Services,
    guard: &CallGuard,
) -> Result<Action> {
    if !has_finalizer(dc_cluster, CLUSTER_FINALIZER) {
        return Ok(Action::await_change());
    }

    let client = match cloud::connect(services, credentials, guard).await {
        Ok(client) => Some(client),
        Err(e) => {
            warn!(error = %e, "Could not build DataCrunch client, skipping cloud cleanup");
            None
        }
    };

    let load_balancer = dc_cluster
        .status
        .as_ref()
        .and_then(|s| s.load_balancer.as_ref())
        .map(|lb| lb.id.clone())
        .filter(|id| !id.is_empty());

    if let (Some(client), Some(lb_id)) = (client, load_balancer) {
        let operation = format!("delete load balancer {lb_id}");
        if let Err(e) = guard
            .call(&operation, client.delete_load_balancer(&lb_id))
            .await
        {
            warn!(load_balancer = %lb_id, error = %e, "Failed to delete load balancer");
        }
    }

    remove_finalizer(dc_cluster, CLUSTER_FINALIZER);
    info!("Removed finalizer");
    Ok(Action::await_change())
}
