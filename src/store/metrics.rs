//! Per-queue operation counters.
//!
//! Metrics are keyed by queue name and constructed once per (registry,
//! queue-name) pair. The registry is passed into each store instance
//! explicitly so lifecycle ownership stays with the caller and tests can
//! observe counters in isolation, instead of reading process-wide globals.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Counters for one queue.
#[derive(Debug, Default)]
pub struct QueueMetrics {
    pub dequeues: AtomicU64,
    pub heartbeats: AtomicU64,
    pub requeues: AtomicU64,
    pub completes: AtomicU64,
    pub erroreds: AtomicU64,
    pub faileds: AtomicU64,
    pub resets: AtomicU64,
    pub reset_failures: AtomicU64,
}

impl QueueMetrics {
    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

/// Registry of queue metrics, shared by the stores of one process.
#[derive(Debug, Default, Clone)]
pub struct MetricsRegistry {
    inner: Arc<Mutex<HashMap<String, Arc<QueueMetrics>>>>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Metrics for the named queue, created on first use.
    pub fn for_queue(&self, name: &str) -> Arc<QueueMetrics> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(QueueMetrics::default()))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_queue_shares_counters() {
        let registry = MetricsRegistry::new();
        let a = registry.for_queue("uploads");
        let b = registry.for_queue("uploads");
        QueueMetrics::incr(&a.dequeues);
        assert_eq!(QueueMetrics::get(&b.dequeues), 1);

        let other = registry.for_queue("batches");
        assert_eq!(QueueMetrics::get(&other.dequeues), 0);
    }
}
