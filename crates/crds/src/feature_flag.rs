//! FeatureFlag CRD
//!
//! Declares a feature flag whose values are materialised into a ConfigMap
//! owned by the flag.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// API group of the FeatureFlag kind
pub const API_GROUP: &str = "featured.io";

/// Kind name, as it appears in owner references
pub const FEATURE_FLAG_KIND: &str = "FeatureFlag";

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[kube(
    group = "featured.io",
    version = "v1alpha1",
    kind = "FeatureFlag",
    namespaced,
    status = "FeatureFlagStatus",
    shortname = "ff",
    printcolumn = r#"{"name":"ConfigMap","type":"string","jsonPath":".spec.configMapName"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct FeatureFlagSpec {
    /// Name of the ConfigMap managed for this flag (same namespace)
    #[serde(default)]
    pub config_map_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FeatureFlagStatus {
    /// Name of the ConfigMap confirmed as owned by this flag
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_map_name: Option<String>,

    /// UID of the owned ConfigMap
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_map_uid: Option<String>,

    /// `metadata.generation` of the flag when the link was last confirmed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}
