//! Controller-specific error types.
//!
//! This module defines the error taxonomy of the FeatureFlag Controller.
//! Errors returned by the reconciler are classified by the work queue layer
//! through [`ControllerError::is_retryable`].

use thiserror::Error;
use kube::Error as KubeError;

/// Errors that can occur in the FeatureFlag Controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Kubernetes API error (transient, retried with backoff)
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    /// Work queue key is not of the form `namespace/name`
    #[error("invalid resource key: {0}")]
    MalformedKey(String),

    /// FeatureFlag is missing `spec.configMapName`
    #[error("{0}: configmap name must be specified")]
    MissingConfigMapName(String),

    /// A same-named ConfigMap exists that is not controlled by the FeatureFlag
    #[error("Resource {0:?} already exists and is not managed by FeatureFlag")]
    ResourceExists(String),

    /// Caches did not sync before the stop signal fired
    #[error("failed to wait for caches to sync")]
    CacheSyncAborted,

    /// A cache writer went away before the initial listing completed
    #[error("cache for {0} stopped before it synced")]
    CacheClosed(&'static str),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Resource watch failed
    #[error("Resource watch failed: {0}")]
    Watch(String),
}

impl ControllerError {
    /// Whether the key should be put back on the queue with backoff.
    ///
    /// Malformed keys and missing configuration cannot be fixed by retrying;
    /// a later update to the FeatureFlag re-enqueues it naturally.
    pub fn is_retryable(&self) -> bool {
        match self {
            ControllerError::Kube(_) | ControllerError::ResourceExists(_) => true,
            ControllerError::MalformedKey(_)
            | ControllerError::MissingConfigMapName(_)
            | ControllerError::CacheSyncAborted
            | ControllerError::CacheClosed(_)
            | ControllerError::InvalidConfig(_)
            | ControllerError::Watch(_) => false,
        }
    }
}
