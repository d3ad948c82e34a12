//! FeatureFlag reconciliation.
//!
//! [`Reconciler::sync`] converges one FeatureFlag key:
//! 1. Resolve the flag from the cache (gone means nothing to do)
//! 2. Ensure the named ConfigMap exists and is controlled by the flag
//! 3. Record the confirmed link in the flag's status
//! 4. Publish a `Synced` event
//!
//! All reads come from the caches; writes go through [`ClusterStore`].

use crate::cache::ResourceCache;
use crate::error::ControllerError;
use crate::events::{EventKind, EventSink, ERR_RESOURCE_EXISTS, MESSAGE_RESOURCE_SYNCED, SUCCESS_SYNCED};
use crate::expectations::Expectations;
use crate::key::split_key;
use crate::metrics::Metrics;
use crate::store::ClusterStore;
use crds::{FeatureFlag, FeatureFlagStatus};
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::{Resource, ResourceExt};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Converges FeatureFlags onto their ConfigMaps
pub struct Reconciler {
    flags: ResourceCache<FeatureFlag>,
    config_maps: ResourceCache<ConfigMap>,
    store: Arc<dyn ClusterStore>,
    events: Arc<dyn EventSink>,
    metrics: Arc<Metrics>,
    expectations: Expectations,
}

impl Reconciler {
    /// Creates a reconciler reading from the given caches
    pub fn new(
        flags: ResourceCache<FeatureFlag>,
        config_maps: ResourceCache<ConfigMap>,
        store: Arc<dyn ClusterStore>,
        events: Arc<dyn EventSink>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            flags,
            config_maps,
            store,
            events,
            metrics,
            expectations: Expectations::new(),
        }
    }

    /// Reconciles the FeatureFlag identified by `key` (`namespace/name`).
    ///
    /// Safe to call any number of times for the same key: once the
    /// ConfigMap exists and the status reflects it, a sync issues no writes.
    /// Writes of earlier syncs count as done until the caches show them.
    pub async fn sync(&self, key: &str) -> Result<(), ControllerError> {
        let (namespace, name) = split_key(key)?;

        let Some(flag) = self.flags.get(namespace, name) else {
            debug!("FeatureFlag {} in work queue no longer exists", key);
            self.expectations.forget(key);
            return Ok(());
        };

        let config_map_name = flag.spec.config_map_name.as_str();
        if config_map_name.is_empty() {
            return Err(ControllerError::MissingConfigMapName(key.to_string()));
        }

        let config_map = match self.config_maps.get(namespace, config_map_name) {
            Some(existing) => {
                self.expectations.observe_config_map(key);
                if !is_controlled_by(&existing, &flag) {
                    let err = ControllerError::ResourceExists(config_map_name.to_string());
                    warn!("FeatureFlag {}: {}", key, err);
                    self.events
                        .publish(&flag, EventKind::Warning, ERR_RESOURCE_EXISTS, &err.to_string())
                        .await;
                    return Err(err);
                }
                existing
            }
            None => match self.expectations.created_config_map(key, config_map_name) {
                Some(pending) => {
                    debug!("ConfigMap {}/{} already created, waiting for the cache", namespace, config_map_name);
                    pending
                }
                None => {
                    let created = Arc::new(
                        self.store
                            .create_config_map(namespace, &new_config_map(&flag))
                            .await?,
                    );
                    info!("Created ConfigMap {}/{} for FeatureFlag {}", namespace, config_map_name, key);
                    self.metrics.configmap_created.inc();
                    self.expectations.expect_config_map(key, created.clone());
                    created
                }
            },
        };

        let desired = desired_status(&flag, &config_map);
        let current = self.expectations.current_status(key, &flag);
        if status_needs_update(current.as_ref(), &desired) {
            self.store.update_feature_flag_status(&flag, &desired).await?;
            debug!("Updated status of FeatureFlag {}", key);
            self.expectations.expect_status(key, &flag, desired);
        } else {
            debug!("Status of FeatureFlag {} already up to date", key);
        }

        self.metrics.configmaps.inc();
        self.events
            .publish(&flag, EventKind::Normal, SUCCESS_SYNCED, MESSAGE_RESOURCE_SYNCED)
            .await;
        Ok(())
    }
}

/// Owner reference marking `flag` as the managing controller.
pub fn owner_reference(flag: &FeatureFlag) -> OwnerReference {
    OwnerReference {
        api_version: FeatureFlag::api_version(&()).to_string(),
        kind: FeatureFlag::kind(&()).to_string(),
        name: flag.name_any(),
        uid: flag.uid().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// ConfigMap created for `flag` when none exists yet. The payload starts empty.
pub fn new_config_map(flag: &FeatureFlag) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(flag.spec.config_map_name.clone()),
            namespace: flag.namespace(),
            owner_references: Some(vec![owner_reference(flag)]),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Whether `config_map`'s controller owner reference points at `flag`
/// (same kind and API version, matched by UID).
pub fn is_controlled_by(config_map: &ConfigMap, flag: &FeatureFlag) -> bool {
    let Some(uid) = flag.meta().uid.as_deref() else {
        return false;
    };
    config_map.owner_references().iter().any(|r| {
        r.controller == Some(true)
            && r.uid == uid
            && r.kind == FeatureFlag::kind(&())
            && r.api_version == FeatureFlag::api_version(&())
    })
}

/// Status describing the confirmed link between `flag` and `config_map`
pub fn desired_status(flag: &FeatureFlag, config_map: &ConfigMap) -> FeatureFlagStatus {
    FeatureFlagStatus {
        config_map_name: Some(config_map.name_any()),
        config_map_uid: config_map.uid(),
        observed_generation: flag.meta().generation,
    }
}

/// Whether the stored status differs from `desired`
pub fn status_needs_update(current: Option<&FeatureFlagStatus>, desired: &FeatureFlagStatus) -> bool {
    current != Some(desired)
}


#[cfg(test)]
#[path = "reconciler_test.rs"]
mod reconciler_test;
