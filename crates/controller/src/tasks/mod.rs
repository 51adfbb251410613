use std::sync::Arc;

use futures::StreamExt;
use kube::runtime::controller::{self, Action, Controller};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config;
use kube::{Api, Client, Resource, ResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, Instrument};

use crate::crds::capi::{Cluster, Machine, CLUSTER_NAME_LABEL, WATCH_FILTER_LABEL};
use crate::crds::{DataCrunchCluster, DataCrunchMachine};

pub mod cloud;
pub mod cluster;
pub mod config;
pub mod events;
pub mod leader;
pub mod machine;
pub mod store;
pub mod types;

// Re-export commonly used items
pub use cluster::reconcile_data_crunch_cluster;
pub use config::ControllerConfig;
pub use machine::reconcile_data_crunch_machine;
pub use types::{CallGuard, Context, Error, Result, Services};

use cloud::DataCrunchConnector;
use events::KubeEventSink;
use store::KubeSecretReader;
use types::object_key;

/// Run the DataCrunchCluster and DataCrunchMachine controllers until shutdown.
#[instrument(skip_all, fields(namespace = ?config.watch_namespace))]
pub async fn run_controllers(
    client: Client,
    config: ControllerConfig,
    shutdown: CancellationToken,
) -> Result<()> {
    config
        .validate()
        .map_err(|e| Error::ConfigError(e.to_string()))?;

    let services = Services {
        connector: Arc::new(DataCrunchConnector::default()),
        secrets: Arc::new(KubeSecretReader::new(client.clone())),
        events: Arc::new(KubeEventSink::new(client.clone(), &config.event_component)),
        config: Arc::new(config),
    };
    let context = Arc::new(Context::new(client.clone(), services, shutdown.clone()));

    info!("Starting DataCrunchCluster and DataCrunchMachine controllers");
    tokio::select! {
        _ = async {
            tokio::join!(
                run_cluster_controller(client.clone(), context.clone()),
                run_machine_controller(client, context),
            )
        } => {}
        () = shutdown.cancelled() => {
            info!("Shutdown requested, stopping controllers");
        }
    }

    info!("Controllers shut down");
    Ok(())
}

fn api<K>(client: Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    K::DynamicType: Default,
{
    match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    }
}

fn watcher_config(config: &ControllerConfig) -> Config {
    let watcher_config = Config::default().any_semantic();
    match &config.watch_filter {
        Some(value) => watcher_config.labels(&format!("{WATCH_FILTER_LABEL}={value}")),
        None => watcher_config,
    }
}

async fn run_cluster_controller(client: Client, context: Arc<Context>) {
    let config = context.config().clone();
    let namespace = config.watch_namespace.as_deref();
    let dc_clusters: Api<DataCrunchCluster> = api(client.clone(), namespace);
    let clusters: Api<Cluster> = api(client, namespace);
    let watcher_config = watcher_config(&config);

    Controller::new(dc_clusters, watcher_config.clone())
        .watches(clusters, watcher_config, |cluster| {
            let namespace = cluster.namespace()?;
            let name = cluster.infrastructure_name("DataCrunchCluster")?;
            Some(ObjectRef::<DataCrunchCluster>::new(name).within(&namespace))
        })
        .with_config(controller::Config::default().concurrency(config.cluster_concurrency))
        .shutdown_on_signal()
        .run(reconcile_data_crunch_cluster, error_policy_cluster, context)
        .for_each(|result| log_reconcile_result("DataCrunchCluster", result))
        .await;

    info!("DataCrunchCluster controller shutting down");
}

async fn run_machine_controller(client: Client, context: Arc<Context>) {
    let config = context.config().clone();
    let namespace = config.watch_namespace.as_deref();
    let dc_machines: Api<DataCrunchMachine> = api(client.clone(), namespace);
    let machines: Api<Machine> = api(client.clone(), namespace);
    let clusters: Api<Cluster> = api(client, namespace);
    let watcher_config = watcher_config(&config);

    let controller = Controller::new(dc_machines, watcher_config.clone());
    let store = controller.store();

    controller
        .watches(machines, watcher_config.clone(), |machine| {
            let namespace = machine.namespace()?;
            let name = machine.infrastructure_name("DataCrunchMachine")?;
            Some(ObjectRef::<DataCrunchMachine>::new(name).within(&namespace))
        })
        // A cluster becoming ready releases every machine waiting on it.
        .watches(clusters, watcher_config, move |cluster| {
            let namespace = cluster.namespace();
            let cluster_name = cluster.name_any();
            store
                .state()
                .into_iter()
                .filter(|dcm| dcm.namespace() == namespace)
                .filter(|dcm| {
                    dcm.labels()
                        .get(CLUSTER_NAME_LABEL)
                        .is_some_and(|name| *name == cluster_name)
                })
                .map(|dcm| ObjectRef::from_obj(dcm.as_ref()))
                .collect::<Vec<_>>()
        })
        .with_config(controller::Config::default().concurrency(config.machine_concurrency))
        .shutdown_on_signal()
        .run(reconcile_data_crunch_machine, error_policy_machine, context)
        .for_each(|result| log_reconcile_result("DataCrunchMachine", result))
        .await;

    info!("DataCrunchMachine controller shutting down");
}

fn log_reconcile_result<K, E>(
    kind: &'static str,
    result: std::result::Result<(ObjectRef<K>, Action), controller::Error<Error, E>>,
) -> impl std::future::Future<Output = ()>
where
    K: Resource,
    E: std::error::Error + 'static,
{
    let span = tracing::info_span!("reconciliation_result", kind);
    let outcome = result.map_err(|e| e.to_string());
    async move {
        match outcome {
            Ok((object, action)) => {
                debug!(
                    name = %object.name,
                    namespace = ?object.namespace,
                    ?action,
                    "Reconciliation successful"
                );
            }
            Err(e) => {
                error!(error = %e, "Reconciliation error");
            }
        }
    }
    .instrument(span)
}

/// Requeue after the delay the reconciler asked for, or back off exponentially.
fn error_policy<K: Resource>(kind: &str, object: &K, err: &Error, ctx: &Context) -> Action {
    let key = object_key(
        kind,
        object.meta().namespace.as_deref().unwrap_or_default(),
        object.meta().name.as_deref().unwrap_or_default(),
    );
    let delay = err.retry_after().unwrap_or_else(|| ctx.next_backoff(&key));
    error!(
        error = %err,
        object = %key,
        retry_in_secs = delay.as_secs(),
        "Reconciliation failed"
    );
    Action::requeue(delay)
}

fn error_policy_cluster(dc_cluster: Arc<DataCrunchCluster>, err: &Error, ctx: Arc<Context>) -> Action {
    error_policy("DataCrunchCluster", dc_cluster.as_ref(), err, &ctx)
}

fn error_policy_machine(machine: Arc<DataCrunchMachine>, err: &Error, ctx: Arc<Context>) -> Action {
    error_policy("DataCrunchMachine", machine.as_ref(), err, &ctx)
}
