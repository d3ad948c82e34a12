//! Test utilities for unit testing the controller
//!
//! Builders for test objects, caches pre-filled through the real reflector
//! writer, and recording doubles for the cluster store and the event sink.

use crate::cache::{CacheFeeder, ResourceCache, NOTIFICATION_BUFFER};
use crate::events::{EventKind, EventSink};
use crate::store::ClusterStore;
use async_trait::async_trait;
use crds::{FeatureFlag, FeatureFlagSpec, FeatureFlagStatus};
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::{Resource, ResourceExt};
use kube_runtime::watcher;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Mutex;
use tokio::sync::mpsc;

/// Helper to create a test FeatureFlag
pub fn create_test_feature_flag(name: &str, namespace: &str, config_map_name: &str) -> FeatureFlag {
    FeatureFlag {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            uid: Some(format!("uid-{name}")),
            generation: Some(1),
            resource_version: Some("1".to_string()),
            ..Default::default()
        },
        spec: FeatureFlagSpec {
            config_map_name: config_map_name.to_string(),
        },
        status: None,
    }
}

/// Helper to create a test ConfigMap, controlled by `owner` when given
pub fn create_test_config_map(name: &str, namespace: &str, owner: Option<&FeatureFlag>) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            uid: Some(format!("uid-cm-{name}")),
            resource_version: Some("1".to_string()),
            owner_references: owner.and_then(|flag| flag.controller_owner_ref(&())).map(|r| vec![r]),
            ..Default::default()
        },
        data: Some(BTreeMap::from([("enabled".to_string(), "true".to_string())])),
        ..Default::default()
    }
}

/// Helper to create a ConfigMap controlled by an arbitrary owner
pub fn create_foreign_config_map(name: &str, namespace: &str, owner_kind: &str, owner_name: &str) -> ConfigMap {
    let mut cm = create_test_config_map(name, namespace, None);
    cm.metadata.owner_references = Some(vec![OwnerReference {
        api_version: "apps/v1".to_string(),
        kind: owner_kind.to_string(),
        name: owner_name.to_string(),
        uid: format!("uid-{}-{owner_name}", owner_kind.to_lowercase()),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }]);
    cm
}

/// Builds a synced cache holding `objects`, fed through the reflector writer
///
/// The feeder is returned so tests can apply further events.
pub fn create_test_cache<K>(kind: &'static str, objects: &[K]) -> (CacheFeeder<K>, ResourceCache<K>)
where
    K: Resource + Clone + Debug + Send + Sync + 'static,
    K::DynamicType: Default + Eq + Hash + Clone,
{
    let (tx, _rx) = mpsc::channel(NOTIFICATION_BUFFER);
    let mut feeder = CacheFeeder::new(kind, tx);
    feeder.apply(&watcher::Event::Init);
    for obj in objects {
        feeder.apply(&watcher::Event::InitApply(obj.clone()));
    }
    feeder.apply(&watcher::Event::InitDone);
    let cache = feeder.cache();
    (feeder, cache)
}

/// A write recorded by [`MockClusterStore`]
#[derive(Debug, Clone, PartialEq)]
pub enum StoreAction {
    /// `create_config_map` was called
    CreateConfigMap {
        /// Target namespace
        namespace: String,
        /// ConfigMap name
        name: String,
        /// Name of the controller owner, if any
        owner: Option<String>,
    },
    /// `update_feature_flag_status` was called
    UpdateStatus {
        /// Flag namespace
        namespace: String,
        /// Flag name
        name: String,
        /// Resource version sent for optimistic concurrency
        resource_version: Option<String>,
        /// Status written
        status: FeatureFlagStatus,
    },
}

/// Recording [`ClusterStore`] with injectable failures
#[derive(Debug, Default)]
pub struct MockClusterStore {
    actions: Mutex<Vec<StoreAction>>,
    create_failures: Mutex<Vec<kube::Error>>,
    status_failures: Mutex<Vec<kube::Error>>,
}

impl MockClusterStore {
    /// Create a new mock store
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `create_config_map` call fail with `error`
    pub fn fail_next_create(&self, error: kube::Error) {
        self.create_failures.lock().unwrap().push(error);
    }

    /// Makes the next `update_feature_flag_status` call fail with `error`
    pub fn fail_next_status_update(&self, error: kube::Error) {
        self.status_failures.lock().unwrap().push(error);
    }

    /// All recorded writes, in call order
    pub fn actions(&self) -> Vec<StoreAction> {
        self.actions.lock().unwrap().clone()
    }

    /// Recorded ConfigMap creations
    pub fn creates(&self) -> Vec<StoreAction> {
        self.actions()
            .into_iter()
            .filter(|a| matches!(a, StoreAction::CreateConfigMap { .. }))
            .collect()
    }

    /// Recorded status updates
    pub fn status_updates(&self) -> Vec<StoreAction> {
        self.actions()
            .into_iter()
            .filter(|a| matches!(a, StoreAction::UpdateStatus { .. }))
            .collect()
    }
}

#[async_trait]
impl ClusterStore for MockClusterStore {
    async fn create_config_map(&self, namespace: &str, config_map: &ConfigMap) -> Result<ConfigMap, kube::Error> {
        let owner = config_map
            .owner_references()
            .iter()
            .find(|r| r.controller == Some(true))
            .map(|r| r.name.clone());
        self.actions.lock().unwrap().push(StoreAction::CreateConfigMap {
            namespace: namespace.to_string(),
            name: config_map.name_any(),
            owner,
        });
        if let Some(error) = self.create_failures.lock().unwrap().pop() {
            return Err(error);
        }
        let mut created = config_map.clone();
        created.metadata.namespace = Some(namespace.to_string());
        created.metadata.uid = Some(format!("uid-cm-{}", config_map.name_any()));
        created.metadata.resource_version = Some("1".to_string());
        Ok(created)
    }

    async fn update_feature_flag_status(
        &self,
        flag: &FeatureFlag,
        status: &FeatureFlagStatus,
    ) -> Result<FeatureFlag, kube::Error> {
        self.actions.lock().unwrap().push(StoreAction::UpdateStatus {
            namespace: flag.namespace().unwrap_or_default(),
            name: flag.name_any(),
            resource_version: flag.resource_version(),
            status: status.clone(),
        });
        if let Some(error) = self.status_failures.lock().unwrap().pop() {
            return Err(error);
        }
        let mut updated = flag.clone();
        updated.status = Some(status.clone());
        Ok(updated)
    }
}

/// An event captured by [`RecordingEventSink`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedEvent {
    /// `namespace/name` of the flag
    pub object: String,
    /// Severity
    pub kind: EventKind,
    /// Machine-readable reason
    pub reason: String,
    /// Human-readable message
    pub message: String,
}

/// [`EventSink`] that keeps every published event
#[derive(Debug, Default)]
pub struct RecordingEventSink {
    events: Mutex<Vec<RecordedEvent>>,
}

impl RecordingEventSink {
    /// Create an empty sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Events published so far
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventSink for RecordingEventSink {
    async fn publish(&self, flag: &FeatureFlag, kind: EventKind, reason: &str, message: &str) {
        self.events.lock().unwrap().push(RecordedEvent {
            object: crate::key::object_key(flag),
            kind,
            reason: reason.to_string(),
            message: message.to_string(),
        });
    }
}

/// Shorthand for a transient store error
pub fn service_error(message: &str) -> kube::Error {
    kube::Error::Service(message.into())
}
