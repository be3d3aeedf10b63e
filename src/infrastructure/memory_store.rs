//! Process-local counter store.
//!
//! Suitable for single-instance deployments and tests. Limits are only
//! enforced per process; use `RedisCounterStore` when several instances
//! must share one budget.

use crate::application::ports::{Clock, CounterReading, CounterStore, StoreError, Storage};
use crate::domain::window::WindowCounter;
use crate::infrastructure::clock::SystemClock;
use crate::infrastructure::storage::ShardedStorage;
use crate::application::error::BuildError;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

/// Increments between opportunistic purges of elapsed counters.
pub const DEFAULT_PURGE_EVERY: u64 = 4096;

/// Fixed-window counters held in sharded memory.
///
/// Each increment runs under the key's shard lock, so the read, the
/// optional window reopen and the add happen as one step. Every
/// `purge_every` increments the store also drops elapsed counters, so keys
/// that stop being used do not accumulate even without a sweeper.
#[derive(Debug, Clone)]
pub struct InMemoryCounterStore {
    counters: Arc<ShardedStorage<String, WindowCounter>>,
    clock: Arc<dyn Clock>,
    increments: Arc<AtomicU64>,
    purge_every: u64,
}

impl InMemoryCounterStore {
    /// Create a store reading time from `clock`.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            counters: Arc::new(ShardedStorage::new()),
            clock,
            increments: Arc::new(AtomicU64::new(0)),
            purge_every: DEFAULT_PURGE_EVERY,
        }
    }

    /// Purge elapsed counters every `every` increments; zero disables it.
    pub fn with_purge_every(mut self, every: u64) -> Self {
        self.purge_every = every;
        self
    }

    /// Number of tracked keys, expired ones included until purged.
    pub fn len(&self) -> usize {
        self.counters.len()
    }

    /// Check if no keys are tracked.
    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    /// Drop every counter whose window has elapsed. Returns how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.counters.len();
        self.counters.retain(|_, counter| !counter.is_expired(now));
        before.saturating_sub(self.counters.len())
    }

    /// Start a background task that drops elapsed counters every `interval`.
    ///
    /// Without it, keys that are never incremented again stay in memory.
    /// Must be called within a Tokio runtime. Abort the handle to stop it.
    ///
    /// # Errors
    /// Returns `BuildError::ZeroSweepInterval` if `interval` is zero.
    pub fn spawn_sweeper(&self, interval: Duration) -> Result<JoinHandle<()>, BuildError> {
        if interval.is_zero() {
            return Err(BuildError::ZeroSweepInterval);
        }

        let store = self.clone();
        Ok(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let purged = store.purge_expired();
                if purged > 0 {
                    debug!(purged, remaining = store.len(), "purged elapsed counters");
                }
            }
        }))
    }
}

impl Default for InMemoryCounterStore {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock::new()))
    }
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn increment(&self, key: &str, window: Duration) -> Result<CounterReading, StoreError> {
        let now = self.clock.now();
        let (count, ttl) = self.counters.with_entry_mut(
            key.to_string(),
            || WindowCounter::open(now, window),
            |counter| counter.increment(now, window),
        );

        if self.purge_every > 0
            && (self.increments.fetch_add(1, Ordering::Relaxed) + 1) % self.purge_every == 0
        {
            self.purge_expired();
        }
        Ok(CounterReading { count, ttl })
    }

    async fn reset(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.counters.remove(&key.to_string()).is_some())
    }

    async fn reset_prefix(&self, prefix: &str) -> Result<u64, StoreError> {
        let mut removed = 0;
        self.counters.retain(|key, _| {
            let keep = !key.starts_with(prefix);
            if !keep {
                removed += 1;
            }
            keep
        });
        Ok(removed)
    }
}
