//! Writes the caches have not caught up with yet.
//!
//! A sync that creates a ConfigMap or writes a flag's status can be followed
//! by another sync of the same key before the watches deliver those writes.
//! [`Expectations`] remembers them per flag key so the next sync treats them
//! as already done instead of repeating them. Entries are cleared as soon as
//! the caches show the write, and ignored once [`EXPECTATION_TTL`] has passed.

use crds::{FeatureFlag, FeatureFlagStatus};
use k8s_openapi::api::core::v1::ConfigMap;
use kube::ResourceExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

/// How long a write is trusted without the caches confirming it
pub const EXPECTATION_TTL: Duration = Duration::from_secs(300);

#[derive(Debug)]
struct Pending<T> {
    value: T,
    recorded_at: Instant,
}

impl<T> Pending<T> {
    fn new(value: T) -> Self {
        Self {
            value,
            recorded_at: Instant::now(),
        }
    }

    fn expired(&self) -> bool {
        self.recorded_at.elapsed() >= EXPECTATION_TTL
    }
}

#[derive(Debug)]
struct WrittenStatus {
    /// Resource version of the flag the status was written against
    against: Option<String>,
    status: FeatureFlagStatus,
}

#[derive(Debug, Default)]
struct Entry {
    config_map: Option<Pending<Arc<ConfigMap>>>,
    status: Option<Pending<WrittenStatus>>,
}

/// Per-key record of unconfirmed writes
#[derive(Debug, Default)]
pub struct Expectations {
    entries: Mutex<HashMap<String, Entry>>,
}

impl Expectations {
    /// Creates an empty record
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Remembers that `config_map` was created for `key`.
    pub fn expect_config_map(&self, key: &str, config_map: Arc<ConfigMap>) {
        self.entries().entry(key.to_string()).or_default().config_map = Some(Pending::new(config_map));
    }

    /// ConfigMap named `name` created for `key` that the cache has not shown yet.
    pub fn created_config_map(&self, key: &str, name: &str) -> Option<Arc<ConfigMap>> {
        let mut entries = self.entries();
        let entry = entries.get_mut(key)?;
        match &entry.config_map {
            Some(pending) if !pending.expired() && pending.value.name_any() == name => Some(pending.value.clone()),
            Some(_) => {
                trace!("Dropping stale ConfigMap expectation for {}", key);
                entry.config_map = None;
                None
            }
            None => None,
        }
    }

    /// Clears the ConfigMap expectation of `key` once the cache shows the ConfigMap.
    pub fn observe_config_map(&self, key: &str) {
        if let Some(entry) = self.entries().get_mut(key) {
            entry.config_map = None;
        }
    }

    /// Remembers that `status` was written to `flag`.
    pub fn expect_status(&self, key: &str, flag: &FeatureFlag, status: FeatureFlagStatus) {
        self.entries().entry(key.to_string()).or_default().status = Some(Pending::new(WrittenStatus {
            against: flag.resource_version(),
            status,
        }));
    }

    /// Status `flag` has, counting a write the cache has not shown yet.
    ///
    /// The written status only stands in while the cached flag is still the
    /// revision it was written against; any newer revision replaces it.
    pub fn current_status(&self, key: &str, flag: &FeatureFlag) -> Option<FeatureFlagStatus> {
        let mut entries = self.entries();
        if let Some(entry) = entries.get_mut(key) {
            match &entry.status {
                Some(pending) if !pending.expired() && pending.value.against == flag.resource_version() => {
                    return Some(pending.value.status.clone());
                }
                Some(_) => entry.status = None,
                None => {}
            }
        }
        flag.status.clone()
    }

    /// Drops everything recorded for `key`.
    pub fn forget(&self, key: &str) {
        self.entries().remove(key);
    }

    /// Number of keys with unconfirmed writes
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries()
            .values()
            .filter(|e| e.config_map.is_some() || e.status.is_some())
            .count()
    }

    /// Whether no write is awaiting confirmation
    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
