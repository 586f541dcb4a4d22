//! Counters describing rate limiter behavior.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Metrics tracking rate limiting statistics.
///
/// All counters are atomic and shared between clones.
#[derive(Debug, Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

#[derive(Debug, Default)]
struct MetricsInner {
    checks_allowed: AtomicU64,
    checks_limited: AtomicU64,
    blocks_issued: AtomicU64,
    store_failures: AtomicU64,
}

impl Metrics {
    /// Create a new metrics tracker.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner::default()),
        }
    }

    pub(crate) fn record_allowed(&self) {
        self.inner.checks_allowed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_limited(&self) {
        self.inner.checks_limited.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_block(&self) {
        self.inner.blocks_issued.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_store_failure(&self) {
        self.inner.store_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Checks that admitted the request, fail-open admissions included.
    pub fn checks_allowed(&self) -> u64 {
        self.inner.checks_allowed.load(Ordering::Relaxed)
    }

    /// Checks that rejected the request.
    pub fn checks_limited(&self) -> u64 {
        self.inner.checks_limited.load(Ordering::Relaxed)
    }

    /// Blocks started (one per violation, not per rejected request).
    pub fn blocks_issued(&self) -> u64 {
        self.inner.blocks_issued.load(Ordering::Relaxed)
    }

    /// Checks that failed open because the store was unavailable.
    pub fn store_failures(&self) -> u64 {
        self.inner.store_failures.load(Ordering::Relaxed)
    }

    /// Get a snapshot of all metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            checks_allowed: self.checks_allowed(),
            checks_limited: self.checks_limited(),
            blocks_issued: self.blocks_issued(),
            store_failures: self.store_failures(),
        }
    }

    /// Reset all metrics to zero.
    pub fn reset(&self) {
        self.inner.checks_allowed.store(0, Ordering::Relaxed);
        self.inner.checks_limited.store(0, Ordering::Relaxed);
        self.inner.blocks_issued.store(0, Ordering::Relaxed);
        self.inner.store_failures.store(0, Ordering::Relaxed);
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// A point-in-time snapshot of metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub checks_allowed: u64,
    pub checks_limited: u64,
    pub blocks_issued: u64,
    pub store_failures: u64,
}

impl MetricsSnapshot {
    /// Share of checks that were rejected (0.0 to 1.0).
    ///
    /// Returns 0.0 if no checks have been made.
    pub fn denial_rate(&self) -> f64 {
        let total = self.total_checks();
        if total == 0 {
            0.0
        } else {
            self.checks_limited as f64 / total as f64
        }
    }

    /// Total number of checks (allowed + limited).
    pub fn total_checks(&self) -> u64 {
        self.checks_allowed.saturating_add(self.checks_limited)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_initial_state() {
        let snapshot = Metrics::new().snapshot();
        assert_eq!(snapshot.total_checks(), 0);
        assert_eq!(snapshot.blocks_issued, 0);
        assert_eq!(snapshot.store_failures, 0);
    }

    #[test]
    fn test_snapshot() {
        let metrics = Metrics::new();
        metrics.record_allowed();
        metrics.record_allowed();
        metrics.record_limited();
        metrics.record_block();
        metrics.record_store_failure();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.checks_allowed, 2);
        assert_eq!(snapshot.checks_limited, 1);
        assert_eq!(snapshot.blocks_issued, 1);
        assert_eq!(snapshot.store_failures, 1);
    }

    #[test]
    fn test_denial_rate() {
        let metrics = Metrics::new();
        assert_eq!(metrics.snapshot().denial_rate(), 0.0);

        metrics.record_allowed();
        metrics.record_limited();
        assert!((metrics.snapshot().denial_rate() - 0.5).abs() < f64::EPSILON);

        metrics.record_limited();
        metrics.record_limited();
        assert!((metrics.snapshot().denial_rate() - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn test_reset() {
        let metrics = Metrics::new();
        metrics.record_allowed();
        metrics.record_block();
        metrics.reset();
        assert_eq!(metrics.snapshot(), Metrics::new().snapshot());
    }

    #[test]
    fn test_clones_share_counters() {
        let metrics1 = Metrics::new();
        let metrics2 = metrics1.clone();
        metrics1.record_allowed();
        metrics2.record_allowed();
        assert_eq!(metrics1.checks_allowed(), 2);
    }

    #[test]
    fn test_concurrent_updates() {
        use std::thread;

        let metrics = Metrics::new();
        let handles: Vec<_> = (0..10)
            .map(|_| {
                let m = metrics.clone();
                thread::spawn(move || {
                    for _ in 0..100 {
                        m.record_allowed();
                        m.record_limited();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(metrics.checks_allowed(), 1000);
        assert_eq!(metrics.checks_limited(), 1000);
    }
}
