//! Leader election on a `coordination.k8s.io/v1` Lease.
//!
//! Only the replica holding the lease runs the controllers. Every write to
//! the lease carries the resourceVersion it was read at, so two replicas can
//! never both win the same round; the loser sees a 409 and waits.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, PostParams};
use kube::Client;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::config::LeaderElectionConfig;
use super::types::Result;

/// What to do with the lease after reading it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseDecision {
    /// We hold it: bump the renew time
    Renew,
    /// Released or expired: claim it
    TakeOver { transitions: i32 },
    /// Someone else holds a live lease
    Wait,
}

/// Decide how `identity` should treat a lease read at `now`.
#[must_use]
pub fn decide(spec: Option<&LeaseSpec>, identity: &str, now: DateTime<Utc>) -> LeaseDecision {
    let holder = spec
        .and_then(|s| s.holder_identity.as_deref())
        .filter(|h| !h.is_empty());
    let transitions = spec.and_then(|s| s.lease_transitions).unwrap_or(0);

    match holder {
        Some(holder) if holder == identity => LeaseDecision::Renew,
        None => LeaseDecision::TakeOver { transitions },
        Some(_) => {
            let renew_time = spec.and_then(|s| s.renew_time.as_ref());
            let duration = spec.and_then(|s| s.lease_duration_seconds);
            let expired = match (renew_time, duration) {
                (Some(renewed), Some(secs)) => {
                    now > renewed.0 + chrono::Duration::seconds(i64::from(secs))
                }
                _ => true,
            };
            if expired {
                LeaseDecision::TakeOver { transitions }
            } else {
                LeaseDecision::Wait
            }
        }
    }
}

/// Identity of this replica: the pod name when running in a cluster.
#[must_use]
pub fn default_identity() -> String {
    std::env::var("POD_NAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_else(|_| format!("capdc-manager-{}", std::process::id()))
}

/// Namespace of the lease: configured, else the pod's own namespace.
#[must_use]
pub fn lease_namespace(config: &LeaderElectionConfig) -> String {
    config
        .lease_namespace
        .clone()
        .or_else(|| std::env::var("POD_NAMESPACE").ok())
        .unwrap_or_else(|| "default".to_string())
}

pub struct LeaderElector {
    client: Client,
    lease_name: String,
    namespace: String,
    identity: String,
    lease_duration: Duration,
    renew_deadline: Duration,
    retry_period: Duration,
}

impl LeaderElector {
    pub fn new(client: Client, config: &LeaderElectionConfig, identity: String) -> Self {
        Self {
            client,
            lease_name: config.lease_name.clone(),
            namespace: lease_namespace(config),
            identity,
            lease_duration: Duration::from_secs(config.lease_duration_seconds),
            renew_deadline: Duration::from_secs(config.renew_deadline_seconds),
            retry_period: Duration::from_secs(config.retry_period_seconds),
        }
    }

    /// Wait until the lease is ours.
    ///
    /// Returns `None` if `shutdown` fires first. Once acquired, the lease is
    /// renewed in the background; losing it cancels `shutdown`.
    pub async fn acquire(self: Arc<Self>, shutdown: &CancellationToken) -> Option<LeaderGuard> {
        info!(
            identity = %self.identity,
            lease = %self.lease_name,
            namespace = %self.namespace,
            "Waiting for leadership"
        );

        loop {
            match self.try_acquire_or_renew().await {
                Ok(true) => {
                    info!(identity = %self.identity, "Leadership acquired");
                    return Some(self.guard(shutdown.clone()));
                }
                Ok(false) => {
                    debug!(identity = %self.identity, "Lease held by another replica");
                }
                Err(e) => {
                    warn!(identity = %self.identity, error = %e, "Failed to acquire lease, retrying");
                }
            }

            tokio::select! {
                () = shutdown.cancelled() => return None,
                () = tokio::time::sleep(self.retry_period) => {}
            }
        }
    }

    fn guard(self: &Arc<Self>, shutdown: CancellationToken) -> LeaderGuard {
        let lost = Arc::new(AtomicBool::new(false));
        let elector = Arc::clone(self);
        let renewal = tokio::spawn({
            let lost = Arc::clone(&lost);
            async move { elector.renewal_loop(shutdown, lost).await }
        });

        LeaderGuard {
            elector: Arc::clone(self),
            renewal,
            lost,
        }
    }

    async fn renewal_loop(&self, shutdown: CancellationToken, lost: Arc<AtomicBool>) {
        let mut last_renewed = Instant::now();
        loop {
            tokio::select! {
                () = shutdown.cancelled() => return,
                () = tokio::time::sleep(self.retry_period) => {}
            }

            match self.try_acquire_or_renew().await {
                Ok(true) => last_renewed = Instant::now(),
                Ok(false) => {
                    warn!(identity = %self.identity, "Lease taken by another replica");
                    break;
                }
                Err(e) if last_renewed.elapsed() < self.renew_deadline => {
                    debug!(identity = %self.identity, error = %e, "Lease renewal failed, retrying");
                }
                Err(e) => {
                    warn!(identity = %self.identity, error = %e, "Could not renew lease before the deadline");
                    break;
                }
            }
        }

        lost.store(true, Ordering::SeqCst);
        shutdown.cancel();
    }

    /// One compare-and-swap round on the lease.
    async fn try_acquire_or_renew(&self) -> Result<bool> {
        let api: Api<Lease> = Api::namespaced(self.client.clone(), &self.namespace);
        let now = Utc::now();

        let Some(existing) = api.get_opt(&self.lease_name).await? else {
            return self.create_lease(&api, now).await;
        };

        let mut updated = existing.clone();
        let spec = updated.spec.get_or_insert_with(LeaseSpec::default);
        match decide(existing.spec.as_ref(), &self.identity, now) {
            LeaseDecision::Wait => return Ok(false),
            LeaseDecision::Renew => {
                spec.renew_time = Some(MicroTime(now));
            }
            LeaseDecision::TakeOver { transitions } => {
                spec.holder_identity = Some(self.identity.clone());
                spec.lease_duration_seconds = Some(self.lease_duration_secs());
                spec.acquire_time = Some(MicroTime(now));
                spec.renew_time = Some(MicroTime(now));
                spec.lease_transitions = Some(transitions + 1);
            }
        }

        match api
            .replace(&self.lease_name, &PostParams::default(), &updated)
            .await
        {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                debug!(identity = %self.identity, "Lease changed while updating it");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn create_lease(&self, api: &Api<Lease>, now: DateTime<Utc>) -> Result<bool> {
        let lease = Lease {
            metadata: ObjectMeta {
                name: Some(self.lease_name.clone()),
                namespace: Some(self.namespace.clone()),
                ..ObjectMeta::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(self.identity.clone()),
                lease_duration_seconds: Some(self.lease_duration_secs()),
                acquire_time: Some(MicroTime(now)),
                renew_time: Some(MicroTime(now)),
                lease_transitions: Some(0),
                ..LeaseSpec::default()
            }),
        };

        match api.create(&PostParams::default(), &lease).await {
            Ok(_) => {
                info!(identity = %self.identity, "Created lease");
                Ok(true)
            }
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Clear the holder so a standby can take over without waiting for expiry.
    async fn release_lease(&self) -> Result<()> {
        let api: Api<Lease> = Api::namespaced(self.client.clone(), &self.namespace);
        let Some(mut lease) = api.get_opt(&self.lease_name).await? else {
            return Ok(());
        };
        let Some(spec) = lease.spec.as_mut() else {
            return Ok(());
        };
        if spec.holder_identity.as_deref() != Some(self.identity.as_str()) {
            return Ok(());
        }

        spec.holder_identity = None;
        api.replace(&self.lease_name, &PostParams::default(), &lease)
            .await?;
        info!(identity = %self.identity, "Lease released");
        Ok(())
    }

    fn lease_duration_secs(&self) -> i32 {
        i32::try_from(self.lease_duration.as_secs()).unwrap_or(i32::MAX)
    }
}

/// Held while this replica leads; the background renewal stops on drop.
pub struct LeaderGuard {
    elector: Arc<LeaderElector>,
    renewal: JoinHandle<()>,
    lost: Arc<AtomicBool>,
}

impl LeaderGuard {
    /// Whether the lease was lost after it had been acquired.
    #[must_use]
    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }

    /// Stop renewing and hand the lease back.
    pub async fn release(self) {
        self.renewal.abort();
        if self.is_lost() {
            return;
        }
        if let Err(e) = self.elector.release_lease().await {
            warn!(error = %e, "Failed to release lease");
        }
    }
}

impl Drop for LeaderGuard {
    fn drop(&mut self) {
        self.renewal.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn held_by(holder: Option<&str>, renewed_secs_ago: i64, duration: i32) -> LeaseSpec {
        LeaseSpec {
            holder_identity: holder.map(str::to_string),
            renew_time: Some(MicroTime(
                Utc::now() - chrono::Duration::seconds(renewed_secs_ago),
            )),
            lease_duration_seconds: Some(duration),
            lease_transitions: Some(3),
            ..LeaseSpec::default()
        }
    }

    #[test]
    fn holder_renews_its_own_lease() {
        let spec = held_by(Some("pod-a"), 5, 15);
        assert_eq!(decide(Some(&spec), "pod-a", Utc::now()), LeaseDecision::Renew);
    }

    #[test]
    fn live_lease_of_another_replica_is_respected() {
        let spec = held_by(Some("pod-a"), 5, 15);
        assert_eq!(decide(Some(&spec), "pod-b", Utc::now()), LeaseDecision::Wait);
    }

    #[test]
    fn expired_lease_is_taken_over() {
        let spec = held_by(Some("pod-a"), 20, 15);
        assert_eq!(
            decide(Some(&spec), "pod-b", Utc::now()),
            LeaseDecision::TakeOver { transitions: 3 }
        );
    }

    #[test]
    fn released_or_empty_lease_is_taken_over() {
        let released = held_by(None, 1, 15);
        assert_eq!(
            decide(Some(&released), "pod-b", Utc::now()),
            LeaseDecision::TakeOver { transitions: 3 }
        );
        assert_eq!(
            decide(None, "pod-b", Utc::now()),
            LeaseDecision::TakeOver { transitions: 0 }
        );
    }

    #[test]
    fn configured_namespace_wins() {
        let config = LeaderElectionConfig {
            lease_namespace: Some("capdc-system".to_string()),
            ..LeaderElectionConfig::default()
        };
        assert_eq!(lease_namespace(&config), "capdc-system");
    }
}
