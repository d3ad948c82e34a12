//! Kubernetes events describing sync outcomes.

use async_trait::async_trait;
use crds::FeatureFlag;
use kube::{Client, Resource, ResourceExt};
use kube_runtime::events::{Event, EventType, Recorder, Reporter};
use tracing::warn;

/// Reason used when a FeatureFlag is synced successfully
pub const SUCCESS_SYNCED: &str = "Synced";
/// Reason used when a ConfigMap fails to sync due to an existing, unowned ConfigMap
pub const ERR_RESOURCE_EXISTS: &str = "ErrResourceExists";
/// Message used when a FeatureFlag is synced successfully
pub const MESSAGE_RESOURCE_SYNCED: &str = "FeatureFlag synced successfully";

/// Name reported as the source of events
pub const REPORTING_CONTROLLER: &str = "featureflag-controller";

/// Event severity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// Informational
    Normal,
    /// Something needs attention
    Warning,
}

/// Fire-and-forget event publication
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Records an event against `flag`. Failures are logged, never returned.
    async fn publish(&self, flag: &FeatureFlag, kind: EventKind, reason: &str, message: &str);
}

/// [`EventSink`] backed by the `events.k8s.io` API
#[derive(Clone)]
pub struct KubeEventSink {
    recorder: Recorder,
}

impl KubeEventSink {
    /// Creates a sink; `instance` is usually the pod name
    pub fn new(client: Client, instance: Option<String>) -> Self {
        let reporter = Reporter {
            controller: REPORTING_CONTROLLER.to_string(),
            instance,
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventSink for KubeEventSink {
    async fn publish(&self, flag: &FeatureFlag, kind: EventKind, reason: &str, message: &str) {
        let event = Event {
            type_: match kind {
                EventKind::Normal => EventType::Normal,
                EventKind::Warning => EventType::Warning,
            },
            reason: reason.to_string(),
            note: Some(message.to_string()),
            action: "Sync".to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, &flag.object_ref(&())).await {
            warn!(
                "Failed to publish {} event for FeatureFlag {}/{}: {}",
                reason,
                flag.namespace().unwrap_or_default(),
                flag.name_any(),
                e
            );
        }
    }
}
