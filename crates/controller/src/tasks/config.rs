//! Controller configuration
//!
//! Loaded from a mounted YAML file. Every key is optional; anything missing
//! takes the default shown in [`ControllerConfig::default`].

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Default location of the mounted configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "/config/config.yaml";

/// Environment variable overriding [`DEFAULT_CONFIG_PATH`].
pub const CONFIG_PATH_ENV: &str = "CAPDC_CONFIG_PATH";

/// Main controller configuration structure
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ControllerConfig {
    /// Delay before re-checking instances that are still converging
    #[serde(default = "default_requeue_interval")]
    pub requeue_interval_seconds: u64,

    /// Interval at which running machines are re-checked against the provider
    #[serde(default = "default_sync_period")]
    pub sync_period_seconds: u64,

    /// Upper bound on the external calls made by one reconcile
    #[serde(default = "default_reconcile_timeout")]
    pub reconcile_timeout_seconds: u64,

    /// Parallel `DataCrunchCluster` reconciles
    #[serde(default = "default_concurrency")]
    pub cluster_concurrency: u16,

    /// Parallel `DataCrunchMachine` reconciles
    #[serde(default = "default_concurrency")]
    pub machine_concurrency: u16,

    /// Only reconcile objects labelled `cluster.x-k8s.io/watch-filter=<value>`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub watch_filter: Option<String>,

    /// Restrict watches to one namespace (all namespaces when unset)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub watch_namespace: Option<String>,

    /// Image used when a machine does not name one
    #[serde(default = "default_image")]
    pub default_image: String,

    #[serde(default)]
    pub credentials: CredentialsConfig,

    #[serde(default)]
    pub backoff: BackoffConfig,

    #[serde(default)]
    pub leader_election: LeaderElectionConfig,

    /// Reporting component on emitted Kubernetes events
    #[serde(default = "default_event_component")]
    pub event_component: String,
}

/// Fallback credentials secret for clusters without `credentialsRef`
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CredentialsConfig {
    #[serde(default = "default_credentials_secret")]
    pub secret_name: String,

    /// Namespace of the secret; defaults to the cluster's namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// Exponential retry delay for failures without an explicit requeue
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BackoffConfig {
    #[serde(default = "default_backoff_base")]
    pub base_seconds: u64,
    #[serde(default = "default_backoff_max")]
    pub max_seconds: u64,
}

/// Lease-based leader election between manager replicas
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LeaderElectionConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_lease_name")]
    pub lease_name: String,

    /// Namespace of the Lease; defaults to the pod's namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_namespace: Option<String>,

    /// How long standbys wait after the last renewal before taking over
    #[serde(default = "default_lease_duration")]
    pub lease_duration_seconds: u64,

    /// How long the leader keeps retrying a failed renewal before giving up
    #[serde(default = "default_renew_deadline")]
    pub renew_deadline_seconds: u64,

    #[serde(default = "default_retry_period")]
    pub retry_period_seconds: u64,
}

fn default_lease_name() -> String {
    "controller-leader-election-capdc".to_string()
}

fn default_lease_duration() -> u64 {
    15
}

fn default_renew_deadline() -> u64 {
    10
}

fn default_retry_period() -> u64 {
    2
}

impl Default for LeaderElectionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            lease_name: default_lease_name(),
            lease_namespace: None,
            lease_duration_seconds: default_lease_duration(),
            renew_deadline_seconds: default_renew_deadline(),
            retry_period_seconds: default_retry_period(),
        }
    }
}

impl LeaderElectionConfig {
    fn validate(&self) -> Result<(), anyhow::Error> {
        if !self.enabled {
            return Ok(());
        }
        if self.lease_name.trim().is_empty() {
            return Err(anyhow::anyhow!("leaderElection.leaseName must not be empty"));
        }
        if self.retry_period_seconds == 0
            || self.retry_period_seconds >= self.renew_deadline_seconds
            || self.renew_deadline_seconds >= self.lease_duration_seconds
        {
            return Err(anyhow::anyhow!(
                "leaderElection timings must satisfy 0 < retryPeriodSeconds < renewDeadlineSeconds < leaseDurationSeconds"
            ));
        }
        Ok(())
    }
}

fn default_requeue_interval() -> u64 {
    30
}

fn default_sync_period() -> u64 {
    600 // 10 minutes
}

fn default_reconcile_timeout() -> u64 {
    300 // 5 minutes
}

fn default_concurrency() -> u16 {
    10
}

fn default_image() -> String {
    "ubuntu-22.04-cuda-12.1".to_string()
}

fn default_credentials_secret() -> String {
    "datacrunch-credentials".to_string()
}

fn default_backoff_base() -> u64 {
    5
}

fn default_backoff_max() -> u64 {
    300
}

fn default_event_component() -> String {
    "capdc-manager".to_string()
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            secret_name: default_credentials_secret(),
            namespace: None,
        }
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_seconds: default_backoff_base(),
            max_seconds: default_backoff_max(),
        }
    }
}

impl BackoffConfig {
    /// Delay after `failures` consecutive failures: base * 2^(failures-1), capped.
    #[must_use]
    pub fn delay(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(16);
        let seconds = self
            .base_seconds
            .saturating_mul(1u64 << exponent)
            .min(self.max_seconds);
        Duration::from_secs(seconds)
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            requeue_interval_seconds: default_requeue_interval(),
            sync_period_seconds: default_sync_period(),
            reconcile_timeout_seconds: default_reconcile_timeout(),
            cluster_concurrency: default_concurrency(),
            machine_concurrency: default_concurrency(),
            watch_filter: None,
            watch_namespace: None,
            default_image: default_image(),
            credentials: CredentialsConfig::default(),
            backoff: BackoffConfig::default(),
            leader_election: LeaderElectionConfig::default(),
            event_component: default_event_component(),
        }
    }
}

impl ControllerConfig {
    #[must_use]
    pub fn requeue_interval(&self) -> Duration {
        Duration::from_secs(self.requeue_interval_seconds)
    }

    #[must_use]
    pub fn sync_period(&self) -> Duration {
        Duration::from_secs(self.sync_period_seconds)
    }

    #[must_use]
    pub fn reconcile_timeout(&self) -> Duration {
        Duration::from_secs(self.reconcile_timeout_seconds)
    }

    /// Validate that the configuration can drive the controllers
    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if self.requeue_interval_seconds == 0 {
            return Err(anyhow::anyhow!("requeueIntervalSeconds must be greater than zero"));
        }
        if self.sync_period_seconds == 0 {
            return Err(anyhow::anyhow!("syncPeriodSeconds must be greater than zero"));
        }
        if self.reconcile_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("reconcileTimeoutSeconds must be greater than zero"));
        }
        if self.cluster_concurrency == 0 || self.machine_concurrency == 0 {
            return Err(anyhow::anyhow!(
                "clusterConcurrency and machineConcurrency must be greater than zero"
            ));
        }
        if self.default_image.trim().is_empty() {
            return Err(anyhow::anyhow!("defaultImage must not be empty"));
        }
        if self.credentials.secret_name.trim().is_empty() {
            return Err(anyhow::anyhow!("credentials.secretName must not be empty"));
        }
        if self.backoff.base_seconds == 0 || self.backoff.max_seconds < self.backoff.base_seconds {
            return Err(anyhow::anyhow!(
                "backoff.baseSeconds must be positive and not exceed backoff.maxSeconds"
            ));
        }
        self.leader_election.validate()
    }

    /// Load configuration from mounted config file
    pub fn from_mounted_file(config_path: &str) -> Result<Self, anyhow::Error> {
        let config_str = std::fs::read_to_string(config_path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file {config_path}: {e}"))?;

        serde_yaml::from_str(&config_str)
            .map_err(|e| anyhow::anyhow!("Failed to parse config YAML: {e}"))
    }

    /// Path of the config file: `CAPDC_CONFIG_PATH` or the default mount.
    #[must_use]
    pub fn config_path() -> String {
        std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string())
    }

    /// Load from `path`, falling back to defaults when the file is unreadable,
    /// then validate.
    pub fn load(path: &str) -> Result<Self, anyhow::Error> {
        let config = match Self::from_mounted_file(path) {
            Ok(cfg) => {
                debug!(path = %path, "Loaded controller configuration");
                cfg
            }
            Err(e) => {
                warn!(path = %path, error = %e, "Failed to load configuration, using defaults");
                Self::default()
            }
        };

        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    #[test]
    fn test_config_deserialization() {
        let yaml = r#"
requeueIntervalSeconds: 15
reconcileTimeoutSeconds: 120
machineConcurrency: 4
watchFilter: "team-a"
credentials:
  secretName: "dc-creds"
  namespace: "capdc-system"
backoff:
  baseSeconds: 2
"#;

        let config: ControllerConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.requeue_interval(), Duration::from_secs(15));
        assert_eq!(config.reconcile_timeout_seconds, 120);
        assert_eq!(config.sync_period(), Duration::from_secs(600));
        assert_eq!(config.machine_concurrency, 4);
        assert_eq!(config.cluster_concurrency, 10);
        assert_eq!(config.watch_filter.as_deref(), Some("team-a"));
        assert_eq!(config.credentials.secret_name, "dc-creds");
        assert_eq!(config.backoff.base_seconds, 2);
        assert_eq!(config.backoff.max_seconds, 300);
        assert_eq!(config.default_image, "ubuntu-22.04-cuda-12.1");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_document_yields_defaults() {
        let config: ControllerConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config, ControllerConfig::default());
    }

    #[test]
    fn test_validation_rejects_zero_concurrency() {
        let config = ControllerConfig {
            cluster_concurrency: 0,
            ..ControllerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_leader_election_defaults_and_timings() {
        let yaml = r#"
leaderElection:
  enabled: true
  leaseNamespace: "capdc-system"
"#;
        let config: ControllerConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(config.leader_election.enabled);
        assert_eq!(config.leader_election.lease_name, "controller-leader-election-capdc");
        assert_eq!(config.leader_election.lease_duration_seconds, 15);
        assert!(config.validate().is_ok());

        let mut config = config;
        config.leader_election.renew_deadline_seconds = 20;
        assert!(config.validate().is_err());

        config.leader_election.enabled = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_backoff_doubles_until_cap() {
        let backoff = BackoffConfig::default();
        assert_eq!(backoff.delay(1), Duration::from_secs(5));
        assert_eq!(backoff.delay(2), Duration::from_secs(10));
        assert_eq!(backoff.delay(4), Duration::from_secs(40));
        assert_eq!(backoff.delay(10), Duration::from_secs(300));
        assert_eq!(backoff.delay(u32::MAX), Duration::from_secs(300));
    }

    #[test]
    #[serial]
    fn test_config_path_env_override() {
        std::env::remove_var(CONFIG_PATH_ENV);
        assert_eq!(ControllerConfig::config_path(), DEFAULT_CONFIG_PATH);

        std::env::set_var(CONFIG_PATH_ENV, "/tmp/capdc.yaml");
        assert_eq!(ControllerConfig::config_path(), "/tmp/capdc.yaml");
        std::env::remove_var(CONFIG_PATH_ENV);
    }

    #[test]
    #[serial]
    fn test_load_falls_back_to_defaults() {
        let config = ControllerConfig::load("/nonexistent/capdc.yaml").unwrap();
        assert_eq!(config, ControllerConfig::default());

        let path = std::env::temp_dir().join("capdc-controller-config-test.yaml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "requeueIntervalSeconds: 0").unwrap();
        let err = ControllerConfig::load(path.to_str().unwrap()).unwrap_err();
        assert!(err.to_string().contains("requeueIntervalSeconds"));
        std::fs::remove_file(path).unwrap();
    }
}
