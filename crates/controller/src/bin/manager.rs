//! capdc manager - runs the DataCrunch infrastructure controllers
//!
//! Serves `/healthz` and `/readyz` next to the controllers and shuts both
//! down on SIGINT or SIGTERM. With `--leader-elect`, only the replica holding
//! the Lease runs the controllers, and losing it exits the process.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use axum::{extract::State, http::StatusCode, response::Json, routing::get, Router};
use capdc_controller::tasks::config::{ControllerConfig, CONFIG_PATH_ENV, DEFAULT_CONFIG_PATH};
use capdc_controller::tasks::leader::{default_identity, LeaderElector};
use capdc_controller::tasks::run_controllers;
use clap::Parser;
use serde_json::{json, Value};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::{
    timeout::TimeoutLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::{error, info, warn, Level};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "capdc-manager", version, about = "Cluster API provider for DataCrunch")]
struct Args {
    /// Controller configuration file
    #[arg(long, env = CONFIG_PATH_ENV, default_value = DEFAULT_CONFIG_PATH)]
    config: String,

    /// Address of the health endpoints
    #[arg(long, env = "CAPDC_HEALTH_ADDR", default_value = "0.0.0.0:9440")]
    health_addr: SocketAddr,

    /// Only reconcile objects labelled cluster.x-k8s.io/watch-filter=<value>
    #[arg(long, env = "CAPDC_WATCH_FILTER")]
    watch_filter: Option<String>,

    /// Restrict the controllers to one namespace
    #[arg(long, env = "CAPDC_NAMESPACE")]
    namespace: Option<String>,

    #[arg(long, env = "CAPDC_CLUSTER_CONCURRENCY")]
    cluster_concurrency: Option<u16>,

    #[arg(long, env = "CAPDC_MACHINE_CONCURRENCY")]
    machine_concurrency: Option<u16>,

    /// Re-check running machines at this interval
    #[arg(long, env = "CAPDC_SYNC_PERIOD_SECONDS")]
    sync_period_seconds: Option<u64>,

    /// Run only while holding the leader Lease
    #[arg(long, env = "CAPDC_LEADER_ELECT")]
    leader_elect: bool,

    #[arg(long, env = "CAPDC_LEADER_ELECT_LEASE_DURATION_SECONDS")]
    leader_elect_lease_duration_seconds: Option<u64>,

    #[arg(long, env = "CAPDC_LEADER_ELECT_RENEW_DEADLINE_SECONDS")]
    leader_elect_renew_deadline_seconds: Option<u64>,

    #[arg(long, env = "CAPDC_LEADER_ELECT_RETRY_PERIOD_SECONDS")]
    leader_elect_retry_period_seconds: Option<u64>,

    /// Emit logs as JSON
    #[arg(long, env = "CAPDC_LOG_JSON")]
    log_json: bool,
}

impl Args {
    fn apply(&self, config: &mut ControllerConfig) {
        if let Some(filter) = &self.watch_filter {
            config.watch_filter = Some(filter.clone());
        }
        if let Some(namespace) = &self.namespace {
            config.watch_namespace = Some(namespace.clone());
        }
        if let Some(concurrency) = self.cluster_concurrency {
            config.cluster_concurrency = concurrency;
        }
        if let Some(concurrency) = self.machine_concurrency {
            config.machine_concurrency = concurrency;
        }
        if let Some(seconds) = self.sync_period_seconds {
            config.sync_period_seconds = seconds;
        }

        let election = &mut config.leader_election;
        election.enabled |= self.leader_elect;
        if let Some(seconds) = self.leader_elect_lease_duration_seconds {
            election.lease_duration_seconds = seconds;
        }
        if let Some(seconds) = self.leader_elect_renew_deadline_seconds {
            election.renew_deadline_seconds = seconds;
        }
        if let Some(seconds) = self.leader_elect_retry_period_seconds {
            election.retry_period_seconds = seconds;
        }
    }
}

#[derive(Clone)]
struct AppState {
    client: kube::Client,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let json_layer = args.log_json.then(|| tracing_subscriber::fmt::layer().json());
    let text_layer = (!args.log_json).then(tracing_subscriber::fmt::layer);
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(json_layer)
        .with(text_layer)
        .init();

    info!(
        "Starting capdc manager v{}",
        env!("CARGO_PKG_VERSION")
    );

    let mut config = ControllerConfig::load(&args.config)?;
    args.apply(&mut config);
    config.validate()?;

    let client = kube::Client::try_default()
        .await
        .context("failed to create Kubernetes client")?;
    info!("Connected to Kubernetes cluster");

    let shutdown = CancellationToken::new();
    let controller_handle = {
        let client = client.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(run_manager(client, config, shutdown))
    };

    let app = Router::new()
        .route("/healthz", get(health_check))
        .route("/readyz", get(readiness_check))
        .layer(
            ServiceBuilder::new()
                .layer(
                    TraceLayer::new_for_http()
                        .make_span_with(DefaultMakeSpan::new().level(Level::DEBUG))
                        .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
                )
                .layer(TimeoutLayer::new(Duration::from_secs(10))),
        )
        .with_state(AppState { client });

    let listener = tokio::net::TcpListener::bind(args.health_addr)
        .await
        .with_context(|| format!("failed to bind {}", args.health_addr))?;
    info!(addr = %args.health_addr, "Health server listening");

    let server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                () = shutdown_signal() => {}
                () = server_shutdown.cancelled() => {}
            }
            server_shutdown.cancel();
        })
        .await?;

    let lost_leadership = match controller_handle.await {
        Ok(lost) => lost,
        Err(e) => {
            warn!(error = %e, "Controller task did not exit cleanly");
            false
        }
    };
    if lost_leadership {
        anyhow::bail!("leader election lost");
    }
    info!("capdc manager stopped");

    Ok(())
}

/// Run the controllers, behind leader election when enabled.
///
/// Returns whether leadership was lost while leading.
async fn run_manager(
    client: kube::Client,
    config: ControllerConfig,
    shutdown: CancellationToken,
) -> bool {
    let leadership = if config.leader_election.enabled {
        let elector = Arc::new(LeaderElector::new(
            client.clone(),
            &config.leader_election,
            default_identity(),
        ));
        match elector.acquire(&shutdown).await {
            Some(guard) => Some(guard),
            None => return false,
        }
    } else {
        None
    };

    if let Err(e) = run_controllers(client, config, shutdown).await {
        error!(error = %e, "Controller error");
    }

    match leadership {
        Some(guard) => {
            let lost = guard.is_lost();
            guard.release().await;
            lost
        }
        None => false,
    }
}

async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "capdc-manager",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Ready once the API server answers.
async fn readiness_check(State(state): State<AppState>) -> Result<Json<Value>, StatusCode> {
    match state.client.apiserver_version().await {
        Ok(_) => Ok(Json(json!({
            "status": "ready",
            "service": "capdc-manager",
            "version": env!("CARGO_PKG_VERSION")
        }))),
        Err(e) => {
            warn!(error = %e, "Readiness check failed");
            Err(StatusCode::SERVICE_UNAVAILABLE)
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C, shutting down gracefully");
        },
        () = terminate => {
            info!("Received SIGTERM, shutting down gracefully");
        },
    }
}
