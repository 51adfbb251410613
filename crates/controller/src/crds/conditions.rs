//! Cluster API style conditions shared by the infrastructure resources.
//!
//! Conditions form an ordered set keyed by type: `Ready` sorts first, the
//! rest alphabetically. `lastTransitionTime` only moves when the status flips.

use chrono::{SecondsFormat, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// Condition types
pub const READY: &str = "Ready";
pub const NETWORK_INFRASTRUCTURE_READY: &str = "NetworkInfrastructureReady";
pub const LOAD_BALANCER_READY: &str = "LoadBalancerReady";
pub const INSTANCE_READY: &str = "InstanceReady";

// Condition reasons
pub const DATACRUNCH_CLIENT_FAILED: &str = "DataCrunchClientFailed";
pub const NETWORK_RECONCILIATION_FAILED: &str = "NetworkReconciliationFailed";
pub const LOAD_BALANCER_RECONCILIATION_FAILED: &str = "LoadBalancerReconciliationFailed";
pub const WAITING_FOR_CLUSTER_INFRASTRUCTURE: &str = "WaitingForClusterInfrastructure";
pub const WAITING_FOR_BOOTSTRAP_DATA: &str = "WaitingForBootstrapData";
pub const INSTANCE_CREATION_FAILED: &str = "InstanceCreationFailed";
pub const INSTANCE_NOT_READY: &str = "InstanceNotReady";
pub const INSTANCE_TERMINATED: &str = "InstanceTerminated";

/// Severity of a `False` condition.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, JsonSchema, PartialEq, Eq)]
pub enum ConditionSeverity {
    Error,
    Warning,
    Info,
    #[default]
    #[serde(rename = "")]
    None,
}

impl ConditionSeverity {
    #[must_use]
    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }
}

/// A single observation of one aspect of a resource.
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition
    #[serde(rename = "type")]
    pub condition_type: String,

    /// Status of the condition (True, False, or Unknown)
    pub status: String,

    /// Severity, only meaningful when status is False
    #[serde(default, skip_serializing_if = "ConditionSeverity::is_none")]
    pub severity: ConditionSeverity,

    /// Last time the condition transitioned (RFC3339 format)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,

    /// Reason for the condition's last transition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Human-readable message about the condition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Condition {
    #[must_use]
    pub fn is_true(&self) -> bool {
        self.status == "True"
    }
}

/// Set `condition_type` to True.
pub fn mark_true(conditions: &mut Vec<Condition>, condition_type: &str) {
    set(
        conditions,
        Condition {
            condition_type: condition_type.to_string(),
            status: "True".to_string(),
            severity: ConditionSeverity::None,
            last_transition_time: None,
            reason: None,
            message: None,
        },
    );
}

/// Set `condition_type` to False with a reason, severity and message.
///
/// An empty message is stored as absent.
pub fn mark_false(
    conditions: &mut Vec<Condition>,
    condition_type: &str,
    reason: &str,
    severity: ConditionSeverity,
    message: impl Into<String>,
) {
    let message = message.into();
    set(
        conditions,
        Condition {
            condition_type: condition_type.to_string(),
            status: "False".to_string(),
            severity,
            last_transition_time: None,
            reason: Some(reason.to_string()),
            message: (!message.is_empty()).then_some(message),
        },
    );
}

/// Look up a condition by type.
#[must_use]
pub fn get<'a>(conditions: &'a [Condition], condition_type: &str) -> Option<&'a Condition> {
    conditions
        .iter()
        .find(|c| c.condition_type == condition_type)
}

/// Whether `condition_type` is present and True.
#[must_use]
pub fn is_true(conditions: &[Condition], condition_type: &str) -> bool {
    get(conditions, condition_type).is_some_and(Condition::is_true)
}

fn set(conditions: &mut Vec<Condition>, mut condition: Condition) {
    match conditions
        .iter_mut()
        .find(|c| c.condition_type == condition.condition_type)
    {
        Some(existing) => {
            condition.last_transition_time = if existing.status == condition.status {
                existing.last_transition_time.take()
            } else {
                Some(now())
            };
            *existing = condition;
        }
        None => {
            condition.last_transition_time = Some(now());
            conditions.push(condition);
        }
    }

    conditions.sort_by(|a, b| {
        let a_ready = a.condition_type == READY;
        let b_ready = b.condition_type == READY;
        b_ready
            .cmp(&a_ready)
            .then_with(|| a.condition_type.cmp(&b.condition_type))
    });
}

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}
