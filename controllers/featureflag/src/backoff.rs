//! # Exponential Backoff
//!
//! Per-key exponential failure backoff used by the work queue when a
//! reconciliation is requeued after an error.
//!
//! Each consecutive failure of the same key doubles the delay, starting at
//! `base` and capped at `max`. A success resets the key (see
//! [`ExponentialBackoff::forget`]). With the defaults (5ms, 1000s) the
//! sequence is 5ms, 10ms, 20ms, 40ms, ... reaching the cap after ~18 failures.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;

/// Default delay applied to the first failure of a key
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(5);

/// Default ceiling for the per-key delay
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(1000);

/// Exponential per-item failure backoff
///
/// Tracks the number of consecutive failures per key. Not synchronised on its
/// own; the work queue keeps it behind the same lock as its key sets.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff<T> {
    base: Duration,
    max: Duration,
    failures: HashMap<T, u32>,
}

impl<T: Eq + Hash + Clone> ExponentialBackoff<T> {
    /// Create a backoff with the given base and ceiling
    #[must_use]
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: HashMap::new(),
        }
    }

    /// Record a failure for `key` and return the delay before it should be retried
    pub fn when(&mut self, key: &T) -> Duration {
        let count = self.failures.entry(key.clone()).or_insert(0);
        let delay = Self::calculate_for_failure_count(*count, self.base, self.max);
        *count = count.saturating_add(1);
        delay
    }

    /// Number of failures recorded for `key` since it was last forgotten
    pub fn num_requeues(&self, key: &T) -> u32 {
        self.failures.get(key).copied().unwrap_or(0)
    }

    /// Reset the failure count for `key`
    pub fn forget(&mut self, key: &T) {
        self.failures.remove(key);
    }

    /// Calculate the delay for a given number of previous failures (stateless)
    ///
    /// `failures` is 0-indexed: the first failure waits `base`, the second
    /// `2 * base`, and so on, capped at `max`.
    #[must_use]
    pub fn calculate_for_failure_count(failures: u32, base: Duration, max: Duration) -> Duration {
        // 2^31 * base already overflows any sensible ceiling
        let exp = failures.min(31);
        let multiplier = 1u32 << exp;
        base.checked_mul(multiplier)
            .map_or(max, |delay| delay.min(max))
    }
}

impl<T: Eq + Hash + Clone> Default for ExponentialBackoff<T> {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY)
    }
}
