//! Kubernetes Event recording.
//!
//! Events are fire-and-forget: a failed publish is logged and never fails
//! the reconcile.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

pub const INSTANCE_CREATED: &str = "InstanceCreated";
pub const INSTANCE_DELETED: &str = "InstanceDeleted";

/// Publishes Kubernetes Events about reconciled objects.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(
        &self,
        reference: &ObjectReference,
        event_type: EventType,
        reason: &str,
        action: &str,
        note: String,
    );
}

/// [`EventSink`] backed by `kube::runtime::events::Recorder`.
pub struct KubeEventSink {
    recorder: Recorder,
}

impl KubeEventSink {
    /// `component` appears as the reporting controller on each event.
    pub fn new(client: Client, component: &str) -> Self {
        let reporter = Reporter {
            controller: component.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventSink for KubeEventSink {
    async fn publish(
        &self,
        reference: &ObjectReference,
        event_type: EventType,
        reason: &str,
        action: &str,
        note: String,
    ) {
        let event = Event {
            type_: event_type,
            reason: reason.to_string(),
            note: Some(note),
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, reference).await {
            warn!(reason, action, error = %e, "Failed to publish Kubernetes event");
        }
    }
}
