//! Serving metrics.
//!
//! One shared set of atomic counters covers admission, caching and
//! publishing. Handles are cheap to clone and every clone sees the same
//! values.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Shared serving counters.
#[derive(Debug, Clone, Default)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

#[derive(Debug, Default)]
struct MetricsInner {
    requests_allowed: AtomicU64,
    requests_denied: AtomicU64,
    requests_degraded: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    cache_expired: AtomicU64,
    connections_total: AtomicU64,
    messages_published: AtomicU64,
    publish_misses: AtomicU64,
}

impl Metrics {
    /// Create a new metrics tracker.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_allowed(&self) {
        self.inner.requests_allowed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_denied(&self) {
        self.inner.requests_denied.fetch_add(1, Ordering::Relaxed);
    }

    /// Degraded admissions also count as allowed.
    pub(crate) fn record_degraded(&self) {
        self.inner.requests_degraded.fetch_add(1, Ordering::Relaxed);
        self.inner.requests_allowed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_cache_hit(&self) {
        self.inner.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_cache_miss(&self) {
        self.inner.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    /// An expired read is also a miss.
    pub(crate) fn record_cache_expired(&self) {
        self.inner.cache_expired.fetch_add(1, Ordering::Relaxed);
        self.inner.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_connection(&self) {
        self.inner.connections_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_published(&self, count: u64) {
        self.inner
            .messages_published
            .fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn record_publish_miss(&self) {
        self.inner.publish_misses.fetch_add(1, Ordering::Relaxed);
    }

    /// Get the number of admitted requests, degraded ones included.
    pub fn requests_allowed(&self) -> u64 {
        self.inner.requests_allowed.load(Ordering::Relaxed)
    }

    /// Get the number of rejected requests.
    pub fn requests_denied(&self) -> u64 {
        self.inner.requests_denied.load(Ordering::Relaxed)
    }

    /// Get the number of requests admitted without consulting the store.
    pub fn requests_degraded(&self) -> u64 {
        self.inner.requests_degraded.load(Ordering::Relaxed)
    }

    /// Get a snapshot of all metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        MetricsSnapshot {
            requests_allowed: load(&self.inner.requests_allowed),
            requests_denied: load(&self.inner.requests_denied),
            requests_degraded: load(&self.inner.requests_degraded),
            cache_hits: load(&self.inner.cache_hits),
            cache_misses: load(&self.inner.cache_misses),
            cache_expired: load(&self.inner.cache_expired),
            connections_total: load(&self.inner.connections_total),
            messages_published: load(&self.inner.messages_published),
            publish_misses: load(&self.inner.publish_misses),
        }
    }

    /// Reset all metrics to zero.
    pub fn reset(&self) {
        for counter in [
            &self.inner.requests_allowed,
            &self.inner.requests_denied,
            &self.inner.requests_degraded,
            &self.inner.cache_hits,
            &self.inner.cache_misses,
            &self.inner.cache_expired,
            &self.inner.connections_total,
            &self.inner.messages_published,
            &self.inner.publish_misses,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// A point-in-time snapshot of metrics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    /// Admitted requests, degraded ones included
    pub requests_allowed: u64,
    /// Rejected requests
    pub requests_denied: u64,
    /// Requests admitted while the counter store was unavailable
    pub requests_degraded: u64,
    /// Cache reads that returned a value
    pub cache_hits: u64,
    /// Cache reads that returned nothing, expired ones included
    pub cache_misses: u64,
    /// Cache reads that found an expired entry
    pub cache_expired: u64,
    /// Connections ever registered
    pub connections_total: u64,
    /// Messages delivered to connection outboxes
    pub messages_published: u64,
    /// Publishes addressed to unknown connections
    pub publish_misses: u64,
}

impl MetricsSnapshot {
    /// Get the total number of admission checks.
    pub fn total_requests(&self) -> u64 {
        self.requests_allowed.saturating_add(self.requests_denied)
    }

    /// Ratio of denied to total requests, 0.0 when nothing was checked.
    pub fn denial_rate(&self) -> f64 {
        let total = self.total_requests();
        if total == 0 {
            0.0
        } else {
            self.requests_denied as f64 / total as f64
        }
    }

    /// Ratio of cache hits to cache reads, 0.0 when nothing was read.
    pub fn cache_hit_rate(&self) -> f64 {
        let total = self.cache_hits.saturating_add(self.cache_misses);
        if total == 0 {
            0.0
        } else {
            self.cache_hits as f64 / total as f64
        }
    }
}
