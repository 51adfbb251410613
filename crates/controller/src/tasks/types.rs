use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use capdc_cloud::CloudError;
use dashmap::DashMap;
use kube::Client;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::cloud::CloudConnector;
use super::config::ControllerConfig;
use super::events::EventSink;
use super::store::SecretReader;

pub use crate::crds::cluster::CLUSTER_FINALIZER;
pub use crate::crds::machine::MACHINE_FINALIZER;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("DataCrunch API error: {0}")]
    Cloud(#[from] CloudError),

    #[error("Credentials error: {0}")]
    Credentials(String),

    #[error("Invalid provider ID {0:?}: expected datacrunch://<instance-id>")]
    InvalidProviderId(String),

    #[error("providerID is already {stored:?}, cannot record created instance {created:?}")]
    ProviderIdConflict { stored: String, created: String },

    #[error("Bootstrap data error: {0}")]
    BootstrapData(String),

    #[error("Missing object key")]
    MissingObjectKey,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("{operation} cancelled: controller is shutting down")]
    Cancelled { operation: String },

    #[error("{operation} exceeded the reconcile deadline")]
    DeadlineExceeded { operation: String },

    #[error("{source} (retry in {}s)", .after.as_secs())]
    Requeue {
        #[source]
        source: Box<Error>,
        after: Duration,
    },

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

impl Error {
    /// Wrap this error so the controller retries after a fixed delay.
    #[must_use]
    pub fn requeue(self, after: Duration) -> Self {
        Self::Requeue {
            source: Box::new(self),
            after,
        }
    }

    /// Fixed retry delay requested by the reconciler, if any.
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Requeue { after, .. } => Some(*after),
            _ => None,
        }
    }

    /// Whether a write was rejected because the object changed since it was read.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        match self {
            Self::KubeError(kube::Error::Api(ae)) => ae.code == 409,
            Self::Requeue { source, .. } => source.is_conflict(),
            _ => false,
        }
    }

    /// Whether the underlying failure is a cloud-side "not found".
    #[must_use]
    pub fn is_cloud_not_found(&self) -> bool {
        match self {
            Self::Cloud(err) => err.is_not_found(),
            Self::Requeue { source, .. } => source.is_cloud_not_found(),
            _ => false,
        }
    }
}

/// Key under which failures of one object are counted.
pub fn object_key(kind: &str, namespace: &str, name: &str) -> String {
    format!("{kind}/{namespace}/{name}")
}

/// Collaborators the reconcilers talk to, behind seams so tests can stub them.
#[derive(Clone)]
pub struct Services {
    pub connector: Arc<dyn CloudConnector>,
    pub secrets: Arc<dyn SecretReader>,
    pub events: Arc<dyn EventSink>,
    pub config: Arc<ControllerConfig>,
}

/// Shared controller state.
pub struct Context {
    pub client: Client,
    pub services: Services,
    /// Cancelled on process shutdown
    pub shutdown: CancellationToken,
    /// Consecutive failures per object key
    backoff: DashMap<String, u32>,
}

impl Context {
    pub fn new(client: Client, services: Services, shutdown: CancellationToken) -> Self {
        Self {
            client,
            services,
            shutdown,
            backoff: DashMap::new(),
        }
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.services.config
    }

    /// Guard for one reconcile invocation.
    pub fn call_guard(&self) -> CallGuard {
        CallGuard::new(self.shutdown.child_token(), self.config().reconcile_timeout())
    }

    /// Record a failure for `key` and return the exponential delay before the next attempt.
    pub fn next_backoff(&self, key: &str) -> Duration {
        let mut failures = self.backoff.entry(key.to_string()).or_insert(0);
        *failures = failures.saturating_add(1);
        self.config().backoff.delay(*failures)
    }

    /// Forget the failure history of `key` after a successful reconcile.
    pub fn reset_backoff(&self, key: &str) {
        self.backoff.remove(key);
    }
}

/// Cancellation and deadline applied to every external call made during one reconcile.
#[derive(Clone, Debug)]
pub struct CallGuard {
    token: CancellationToken,
    deadline: Instant,
}

impl CallGuard {
    pub fn new(token: CancellationToken, timeout: Duration) -> Self {
        Self {
            token,
            deadline: Instant::now() + timeout,
        }
    }

    /// Run `fut`, failing early on shutdown or once the deadline passes.
    pub async fn call<T, E, F>(&self, operation: &str, fut: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, E>>,
        E: Into<Error>,
    {
        tokio::select! {
            biased;
            () = self.token.cancelled() => Err(Error::Cancelled {
                operation: operation.to_string(),
            }),
            outcome = tokio::time::timeout_at(self.deadline, fut) => match outcome {
                Ok(result) => result.map_err(Into::into),
                Err(_) => Err(Error::DeadlineExceeded {
                    operation: operation.to_string(),
                }),
            },
        }
    }

    /// Like [`CallGuard::call`], but once `fut` has started it is awaited to
    /// the end regardless of shutdown or the deadline.
    ///
    /// For calls that must not be abandoned after the request went out, such
    /// as creating an instance whose id would otherwise be lost. The HTTP
    /// client's own timeout bounds them.
    pub async fn call_to_completion<T, E, F>(&self, operation: &str, fut: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, E>>,
        E: Into<Error>,
    {
        if self.token.is_cancelled() {
            return Err(Error::Cancelled {
                operation: operation.to_string(),
            });
        }
        if Instant::now() >= self.deadline {
            return Err(Error::DeadlineExceeded {
                operation: operation.to_string(),
            });
        }
        fut.await.map_err(Into::into)
    }
}
