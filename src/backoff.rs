//! Per-object retry delays for failed reconciles.
//!
//! The controller runtime owns scheduling; this only decides how long a failing object waits
//! before its next attempt.

use std::{
    collections::HashMap,
    hash::Hash,
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};

/// Exponential backoff: `base * 2^failures`, capped at `max`.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    base: Duration,
    max: Duration,
}

impl ExponentialBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// Delay before the next attempt after `failures` previous failures.
    pub fn delay(&self, failures: u32) -> Duration {
        let factor = 2u32.checked_pow(failures).unwrap_or(u32::MAX);
        self.base.checked_mul(factor).unwrap_or(self.max).min(self.max)
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(5), Duration::from_secs(1000))
    }
}

/// Consecutive failure counts keyed by object
pub struct RetryTracker<K> {
    backoff: ExponentialBackoff,
    failures: Mutex<HashMap<K, u32>>,
}

impl<K: Eq + Hash + Clone> RetryTracker<K> {
    pub fn new(backoff: ExponentialBackoff) -> Self {
        Self {
            backoff,
            failures: Mutex::new(HashMap::new()),
        }
    }

    fn failures_mut(&self) -> MutexGuard<'_, HashMap<K, u32>> {
        self.failures.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a failure of `key` and return how long to wait before retrying it.
    pub fn next_delay(&self, key: &K) -> Duration {
        let mut failures = self.failures_mut();
        let count = failures.entry(key.clone()).or_insert(0);
        let delay = self.backoff.delay(*count);
        *count = count.saturating_add(1);
        delay
    }

    /// Reset the failure count of `key`.
    pub fn forget(&self, key: &K) {
        self.failures_mut().remove(key);
    }

    pub fn failures(&self, key: &K) -> u32 {
        self.failures_mut().get(key).copied().unwrap_or(0)
    }
}

impl<K: Eq + Hash + Clone> Default for RetryTracker<K> {
    fn default() -> Self {
        Self::new(ExponentialBackoff::default())
    }
}
