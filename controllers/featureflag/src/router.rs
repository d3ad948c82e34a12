//! Routes cache notifications onto the work queue.
//!
//! FeatureFlag changes enqueue the flag itself. ConfigMap changes enqueue
//! the FeatureFlag that controls the ConfigMap, if that flag is still in
//! the cache; everything else is ignored.

use crate::cache::{Notification, ResourceCache};
use crate::key::object_key;
use crate::metrics::Metrics;
use crate::workqueue::WorkQueue;
use crds::{FeatureFlag, FEATURE_FLAG_KIND};
use k8s_openapi::api::core::v1::ConfigMap;
use kube::ResourceExt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, trace};

/// Turns cache notifications into reconciliation keys
pub struct EventRouter {
    flags: ResourceCache<FeatureFlag>,
    queue: Arc<WorkQueue<String>>,
    metrics: Arc<Metrics>,
}

impl EventRouter {
    /// Creates a router resolving ConfigMap owners through `flags`
    pub fn new(flags: ResourceCache<FeatureFlag>, queue: Arc<WorkQueue<String>>, metrics: Arc<Metrics>) -> Self {
        Self { flags, queue, metrics }
    }

    /// Handles a FeatureFlag notification. Deletes are ignored; the owned
    /// ConfigMap is garbage collected through its owner reference.
    pub fn handle_feature_flag(&self, notification: &Notification<FeatureFlag>) {
        match notification {
            Notification::Added(flag) | Notification::Updated { new: flag, .. } => {
                self.enqueue(object_key(flag.as_ref()));
            }
            Notification::Deleted(flag) => {
                debug!("FeatureFlag {} deleted", object_key(flag.as_ref()));
            }
        }
    }

    /// Handles a ConfigMap notification by enqueueing its controlling FeatureFlag.
    pub fn handle_config_map(&self, notification: &Notification<ConfigMap>) {
        let (config_map, deleted) = match notification {
            Notification::Added(cm) => (cm, false),
            Notification::Updated { old, new } => {
                // Periodic resyncs re-deliver unchanged objects
                if old.resource_version() == new.resource_version() {
                    return;
                }
                (new, false)
            }
            Notification::Deleted(cm) => (cm, true),
        };

        let Some(flag) = self.owning_flag(config_map) else {
            return;
        };
        if deleted {
            self.metrics.configmap_deleted.inc();
        }
        self.enqueue(object_key(flag.as_ref()));
    }

    /// Resolves the FeatureFlag controlling `config_map` through the flag cache.
    pub fn owning_flag(&self, config_map: &ConfigMap) -> Option<Arc<FeatureFlag>> {
        let owner = config_map
            .owner_references()
            .iter()
            .find(|r| r.controller == Some(true))?;
        if owner.kind != FEATURE_FLAG_KIND {
            return None;
        }
        let namespace = config_map.namespace().unwrap_or_default();
        let flag = self.flags.get(&namespace, &owner.name);
        if flag.is_none() {
            trace!(
                "Ignoring orphaned ConfigMap {}/{} of FeatureFlag {}",
                namespace,
                config_map.name_any(),
                owner.name
            );
        }
        flag
    }

    fn enqueue(&self, key: String) {
        trace!("Enqueueing {}", key);
        self.queue.add(key);
        self.metrics.workqueue_depth.set(i64::try_from(self.queue.len()).unwrap_or(i64::MAX));
    }

    /// Drains both notification channels until they are closed.
    pub async fn run(
        self,
        mut flags: mpsc::Receiver<Notification<FeatureFlag>>,
        mut config_maps: mpsc::Receiver<Notification<ConfigMap>>,
    ) {
        info!("Starting event router");
        let mut flags_open = true;
        let mut config_maps_open = true;
        while flags_open || config_maps_open {
            tokio::select! {
                notification = flags.recv(), if flags_open => match notification {
                    Some(notification) => self.handle_feature_flag(&notification),
                    None => flags_open = false,
                },
                notification = config_maps.recv(), if config_maps_open => match notification {
                    Some(notification) => self.handle_config_map(&notification),
                    None => config_maps_open = false,
                },
            }
        }
        info!("Event router stopped");
    }
}
