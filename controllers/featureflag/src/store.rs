//! Write path to the cluster.
//!
//! The reconciler never calls `kube::Api` directly; it goes through
//! [`ClusterStore`] so that tests can record and fail writes.

use async_trait::async_trait;
use crds::{FeatureFlag, FeatureFlagStatus};
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::{Patch, PatchParams, PostParams};
use kube::{Api, Client, ResourceExt};
use serde_json::json;
use tracing::debug;

/// Writes issued by the reconciler
#[async_trait]
pub trait ClusterStore: Send + Sync {
    /// Creates `config_map` in `namespace`
    async fn create_config_map(&self, namespace: &str, config_map: &ConfigMap) -> Result<ConfigMap, kube::Error>;

    /// Replaces the status of `flag` through the status subresource.
    ///
    /// The write carries `flag`'s resource version, so it fails with a
    /// conflict if the flag changed since it was read.
    async fn update_feature_flag_status(
        &self,
        flag: &FeatureFlag,
        status: &FeatureFlagStatus,
    ) -> Result<FeatureFlag, kube::Error>;
}

/// [`ClusterStore`] backed by the Kubernetes API
#[derive(Clone)]
pub struct KubeClusterStore {
    client: Client,
}

impl KubeClusterStore {
    /// Creates a store using `client`
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ClusterStore for KubeClusterStore {
    async fn create_config_map(&self, namespace: &str, config_map: &ConfigMap) -> Result<ConfigMap, kube::Error> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        debug!("Creating ConfigMap {}/{}", namespace, config_map.name_any());
        api.create(&PostParams::default(), config_map).await
    }

    async fn update_feature_flag_status(
        &self,
        flag: &FeatureFlag,
        status: &FeatureFlagStatus,
    ) -> Result<FeatureFlag, kube::Error> {
        let namespace = flag.namespace().unwrap_or_default();
        let api: Api<FeatureFlag> = Api::namespaced(self.client.clone(), &namespace);
        let patch = json!({
            "metadata": { "resourceVersion": flag.resource_version() },
            "status": status,
        });
        debug!("Updating status of FeatureFlag {}/{}", namespace, flag.name_any());
        api.patch_status(&flag.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await
    }
}
