//! Counter store that can be told to fail.

use crate::application::ports::{CounterReading, CounterStore, StoreError};
use crate::infrastructure::memory_store::InMemoryCounterStore;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Wraps an [`InMemoryCounterStore`] and simulates outages on demand.
///
/// Clones share the failure switch and call counter.
#[derive(Debug, Clone)]
pub struct FlakyCounterStore {
    inner: InMemoryCounterStore,
    failing: Arc<AtomicBool>,
    calls: Arc<AtomicU64>,
}

impl FlakyCounterStore {
    /// Wrap a working store.
    pub fn new(inner: InMemoryCounterStore) -> Self {
        Self {
            inner,
            failing: Arc::new(AtomicBool::new(false)),
            calls: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Make every subsequent call fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of calls that reached this store.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("connection refused".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl CounterStore for FlakyCounterStore {
    async fn increment(&self, key: &str, window: Duration) -> Result<CounterReading, StoreError> {
        self.check()?;
        self.inner.increment(key, window).await
    }

    async fn reset(&self, key: &str) -> Result<bool, StoreError> {
        self.check()?;
        self.inner.reset(key).await
    }

    async fn reset_prefix(&self, prefix: &str) -> Result<u64, StoreError> {
        self.check()?;
        self.inner.reset_prefix(prefix).await
    }
}
