//! Named counters shared by the store components.
//!
//! A [`MetricRegistry`] is created by the embedding process and handed to each
//! component at construction; there is no process-wide registry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};

/// Counter names emitted by this crate.
pub mod names {
    pub const RECONCILE_PASSES: &str = "reconcile_passes";
    pub const RECONCILE_FAILURES: &str = "reconcile_failures";
    pub const TELEMETRY_ENQUEUED: &str = "telemetry_enqueued";
    pub const TELEMETRY_DROPPED: &str = "telemetry_dropped";
    pub const TELEMETRY_WRITTEN: &str = "telemetry_written";
    pub const TELEMETRY_WRITE_FAILURES: &str = "telemetry_write_failures";
    pub const RETENTION_ROWS_DELETED: &str = "retention_rows_deleted";
    pub const USAGE_INCREMENTS: &str = "usage_increments";
}

/// Registry of monotonically increasing counters.
///
/// Lookups of an existing counter take only the read lock, so the hot path
/// (telemetry enqueue) never contends with other readers.
pub struct MetricRegistry {
    counters: RwLock<HashMap<String, AtomicU64>>,
}

impl MetricRegistry {
    /// Create a new empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            counters: RwLock::new(HashMap::new()),
        }
    }

    /// Increment a named counter by 1.
    pub fn increment_counter(&self, name: &str) {
        self.add_counter(name, 1);
    }

    /// Add a value to a named counter.
    pub fn add_counter(&self, name: &str, delta: u64) {
        let map = self.counters.read().unwrap_or_else(PoisonError::into_inner);
        if let Some(counter) = map.get(name) {
            counter.fetch_add(delta, Ordering::Relaxed);
            return;
        }
        drop(map);
        let mut map = self.counters.write().unwrap_or_else(PoisonError::into_inner);
        map.entry(name.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(delta, Ordering::Relaxed);
    }

    /// Read a counter value (0 if never touched).
    #[must_use]
    pub fn counter_value(&self, name: &str) -> u64 {
        let map = self.counters.read().unwrap_or_else(PoisonError::into_inner);
        map.get(name).map_or(0, |c| c.load(Ordering::Relaxed))
    }

    /// Get all counter values.
    #[must_use]
    pub fn counter_values(&self) -> HashMap<String, u64> {
        let map = self.counters.read().unwrap_or_else(PoisonError::into_inner);
        map.iter()
            .map(|(k, v)| (k.clone(), v.load(Ordering::Relaxed)))
            .collect()
    }

    /// Number of registered counters.
    #[must_use]
    pub fn counter_count(&self) -> usize {
        self.counters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Default for MetricRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MetricRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricRegistry")
            .field("counters", &self.counter_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn untouched_counter_reads_zero() {
        let registry = MetricRegistry::new();
        assert_eq!(registry.counter_value(names::TELEMETRY_DROPPED), 0);
        assert_eq!(registry.counter_count(), 0);
    }

    #[test]
    fn add_and_increment_accumulate() {
        let registry = MetricRegistry::new();
        registry.increment_counter("a");
        registry.add_counter("a", 4);
        registry.increment_counter("b");
        assert_eq!(registry.counter_value("a"), 5);
        let all = registry.counter_values();
        assert_eq!(all.len(), 2);
        assert_eq!(all["b"], 1);
    }

    #[test]
    fn concurrent_increments_are_counted() {
        let registry = Arc::new(MetricRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        registry.increment_counter(names::TELEMETRY_ENQUEUED);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(registry.counter_value(names::TELEMETRY_ENQUEUED), 8000);
    }
}
