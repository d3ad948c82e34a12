//! Command-line and environment configuration.

use crate::error::ControllerError;
use clap::Parser;
use std::time::Duration;

/// FeatureFlag Controller
#[derive(Parser, Debug, Clone)]
#[command(name = "featureflag-controller")]
#[command(version, about = "Reconciles FeatureFlag resources into owned ConfigMaps")]
pub struct Config {
    /// Number of worker loops processing FeatureFlag keys
    #[arg(long, env = "WORKERS", default_value_t = 2)]
    pub workers: usize,

    /// Namespace to watch (empty for all namespaces)
    #[arg(long, env = "WATCH_NAMESPACE", default_value = "")]
    pub namespace: String,

    /// Seconds between cache resyncs (0 disables resync)
    #[arg(long, env = "RESYNC_INTERVAL_SECS", default_value_t = 600)]
    pub resync_interval_secs: u64,

    /// Default log filter, overridden by RUST_LOG
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Emit logs as JSON
    #[arg(long, env = "LOG_JSON", default_value_t = false)]
    pub log_json: bool,

    /// Address of the metrics and probe server
    #[arg(long, env = "METRICS_ADDRESS", default_value = "0.0.0.0:9710")]
    pub metrics_address: String,

    /// Path metrics are served on
    #[arg(long, env = "METRICS_PATH", default_value = "/metrics")]
    pub metrics_path: String,

    /// Delay before the first retry of a failed key, in milliseconds
    #[arg(long, env = "BACKOFF_BASE_MS", default_value_t = 5)]
    pub backoff_base_ms: u64,

    /// Upper bound for the retry delay, in seconds
    #[arg(long, env = "BACKOFF_MAX_SECS", default_value_t = 1000)]
    pub backoff_max_secs: u64,
}

impl Config {
    /// Rejects values the controller cannot run with.
    pub fn validate(&self) -> Result<(), ControllerError> {
        if self.workers == 0 {
            return Err(ControllerError::InvalidConfig("workers must be at least 1".to_string()));
        }
        if self.backoff_base() > self.backoff_max() {
            return Err(ControllerError::InvalidConfig(format!(
                "backoff base ({:?}) must not exceed backoff max ({:?})",
                self.backoff_base(),
                self.backoff_max()
            )));
        }
        if !self.metrics_path.starts_with('/') {
            return Err(ControllerError::InvalidConfig(format!(
                "metrics path {:?} must start with '/'",
                self.metrics_path
            )));
        }
        Ok(())
    }

    /// Resync period, `None` when disabled
    pub fn resync_interval(&self) -> Option<Duration> {
        (self.resync_interval_secs > 0).then(|| Duration::from_secs(self.resync_interval_secs))
    }

    /// First retry delay
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    /// Retry delay ceiling
    pub fn backoff_max(&self) -> Duration {
        Duration::from_secs(self.backoff_max_secs)
    }

    /// Namespace filter, `None` for all namespaces
    pub fn watch_namespace(&self) -> Option<&str> {
        (!self.namespace.is_empty()).then_some(self.namespace.as_str())
    }
}
