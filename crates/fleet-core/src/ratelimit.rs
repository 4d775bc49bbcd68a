//! Per-kind exponential back-off: base 2s, cap 10 min,
//! keyed by object identity so one hot deployment's retries don't starve
//! another's.

use std::{
    collections::HashMap,
    hash::Hash,
    time::{Duration, Instant},
};

const BASE: Duration = Duration::from_secs(2);
const CAP: Duration = Duration::from_secs(600);

/// Tracks consecutive-failure counts per key and returns the delay
/// before the next attempt should run. Not thread-safe by itself;
/// callers that share one instance across tasks wrap it in a mutex (the
/// work queue does this internally).
#[derive(Debug, Default)]
pub struct ExponentialBackoff<K> {
    failures: HashMap<K, (u32, Instant)>,
}

impl<K: Eq + Hash + Clone> ExponentialBackoff<K> {
    pub fn new() -> Self {
        Self {
            failures: HashMap::new(),
        }
    }

    /// Record a failure for `key` and return the delay to wait before
    /// retrying.
    pub fn failure(&mut self, key: K) -> Duration {
        let entry = self.failures.entry(key).or_insert((0, Instant::now()));
        entry.0 = entry.0.saturating_add(1);
        entry.1 = Instant::now();
        delay_for(entry.0)
    }

    /// Clear the failure count for `key`, e.g. after a successful
    /// reconcile. A key with no recorded failures is a no-op.
    pub fn forget(&mut self, key: &K) {
        self.failures.remove(key);
    }

    pub fn failure_count(&self, key: &K) -> u32 {
        self.failures.get(key).map_or(0, |(count, _)| *count)
    }
}

fn delay_for(failure_count: u32) -> Duration {
    let exponent = failure_count.saturating_sub(1).min(32);
    let multiplier = 1u64.checked_shl(exponent).unwrap_or(u64::MAX);
    BASE.checked_mul(multiplier.try_into().unwrap_or(u32::MAX))
        .unwrap_or(CAP)
        .min(CAP)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_failure_waits_base_delay() {
        let mut backoff = ExponentialBackoff::new();
        assert_eq!(backoff.failure("a"), BASE);
    }

    #[test]
    fn delay_doubles_and_caps() {
        let mut backoff: ExponentialBackoff<&str> = ExponentialBackoff::new();
        let mut last = Duration::ZERO;
        for _ in 0..20 {
            let delay = backoff.failure("a");
            assert!(delay >= last);
            assert!(delay <= CAP);
            last = delay;
        }
        assert_eq!(last, CAP);
    }

    #[test]
    fn forget_resets_the_count() {
        let mut backoff = ExponentialBackoff::new();
        backoff.failure("a");
        backoff.failure("a");
        assert_eq!(backoff.failure_count(&"a"), 2);
        backoff.forget(&"a");
        assert_eq!(backoff.failure_count(&"a"), 0);
    }

    #[test]
    fn keys_are_independent() {
        let mut backoff = ExponentialBackoff::new();
        backoff.failure("a");
        backoff.failure("a");
        backoff.failure("b");
        assert_eq!(backoff.failure_count(&"a"), 2);
        assert_eq!(backoff.failure_count(&"b"), 1);
    }
}
