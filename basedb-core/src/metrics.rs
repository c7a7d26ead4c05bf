//! # Metrics
//!
//! Lock-free counters for the backend. A [`Metrics`] handle is cheap to
//! clone and shared between the server and its background tasks.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Clone, Default)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

#[derive(Default)]
struct MetricsInner {
    // Modify path
    modifies_applied: AtomicU64,
    bytes_flushed: AtomicU64,
    schema_mismatches: AtomicU64,
    nodes_created: AtomicU64,

    // Query path
    queries_executed: AtomicU64,
    query_errors: AtomicU64,

    // Blocks
    blocks_saved: AtomicU64,
    blocks_loaded: AtomicU64,
    blocks_unloaded: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one applied modify batch of `bytes`.
    pub fn record_modify(&self, bytes: u64, created: u64) {
        self.inner.modifies_applied.fetch_add(1, Ordering::Relaxed);
        self.inner.bytes_flushed.fetch_add(bytes, Ordering::Relaxed);
        self.inner.nodes_created.fetch_add(created, Ordering::Relaxed);
    }

    pub fn record_schema_mismatch(&self) {
        self.inner.schema_mismatches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_queries(&self, count: u64) {
        self.inner.queries_executed.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_query_error(&self) {
        self.inner.query_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_blocks_saved(&self, count: u64) {
        self.inner.blocks_saved.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_block_loaded(&self) {
        self.inner.blocks_loaded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_block_unloaded(&self) {
        self.inner.blocks_unloaded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let i = &self.inner;
        MetricsSnapshot {
            modifies_applied: i.modifies_applied.load(Ordering::Relaxed),
            bytes_flushed: i.bytes_flushed.load(Ordering::Relaxed),
            schema_mismatches: i.schema_mismatches.load(Ordering::Relaxed),
            nodes_created: i.nodes_created.load(Ordering::Relaxed),
            queries_executed: i.queries_executed.load(Ordering::Relaxed),
            query_errors: i.query_errors.load(Ordering::Relaxed),
            blocks_saved: i.blocks_saved.load(Ordering::Relaxed),
            blocks_loaded: i.blocks_loaded.load(Ordering::Relaxed),
            blocks_unloaded: i.blocks_unloaded.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub modifies_applied: u64,
    pub bytes_flushed: u64,
    pub schema_mismatches: u64,
    pub nodes_created: u64,
    pub queries_executed: u64,
    pub query_errors: u64,
    pub blocks_saved: u64,
    pub blocks_loaded: u64,
    pub blocks_unloaded: u64,
}

/// Logs the duration of an operation when stopped.
pub struct Timer {
    start: Instant,
    name: &'static str,
}

impl Timer {
    pub fn new(name: &'static str) -> Self {
        Self {
            start: Instant::now(),
            name,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Stop and log; returns the elapsed milliseconds.
    pub fn stop(self) -> u64 {
        let ms = self.elapsed().as_millis() as u64;
        tracing::debug!(name = self.name, duration_ms = ms, "operation completed");
        ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_are_shared_between_clones() {
        let m = Metrics::new();
        let other = m.clone();
        other.record_modify(128, 3);
        m.record_modify(64, 0);
        m.record_schema_mismatch();
        other.record_blocks_saved(2);

        let snap = m.snapshot();
        assert_eq!(snap.modifies_applied, 2);
        assert_eq!(snap.bytes_flushed, 192);
        assert_eq!(snap.nodes_created, 3);
        assert_eq!(snap.schema_mismatches, 1);
        assert_eq!(snap.blocks_saved, 2);
    }
}
