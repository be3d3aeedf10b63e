//! Ports (interfaces) for the application layer.
//!
//! In hexagonal architecture, ports define the interfaces that the application
//! layer needs. Infrastructure adapters implement these ports.

use crate::domain::feature::FeatureSet;
use crate::domain::prediction::PredictionResult;
use async_trait::async_trait;
use std::fmt::Debug;
use std::hash::Hash;
use std::time::{Duration, Instant, SystemTime};
use thiserror::Error;

/// Port for obtaining current time.
///
/// Monotonic time drives windows and TTLs; wall-clock time only stamps
/// monitoring records. Infrastructure provides `SystemClock` and, for tests,
/// `MockClock`.
pub trait Clock: Send + Sync + Debug {
    /// Get the current monotonic instant.
    fn now(&self) -> Instant;

    /// Get the current wall-clock time.
    fn wall_time(&self) -> SystemTime;
}

/// Port for concurrent in-process key-value storage.
///
/// Every method operating on a single key is atomic with respect to other
/// operations on that key. No ordering is implied across keys.
pub trait Storage<K, V>: Send + Sync + Debug
where
    K: Hash + Eq + Clone + Send + Sync,
    V: Send + Sync,
{
    /// Access an entry with mutable access, creating it if necessary.
    ///
    /// # Arguments
    /// * `key` - The key to look up
    /// * `factory` - Function to create a new value if the key doesn't exist
    /// * `accessor` - Function that gets mutable access to the value
    ///
    /// # Returns
    /// The result from the accessor function
    fn with_entry_mut<F, R>(&self, key: K, factory: impl FnOnce() -> V, accessor: F) -> R
    where
        F: FnOnce(&mut V) -> R;

    /// Access an existing entry without creating one.
    ///
    /// Returns `None` if the key is absent.
    fn with_existing<F, R>(&self, key: &K, accessor: F) -> Option<R>
    where
        F: FnOnce(&mut V) -> R;

    /// Insert a value, returning the previous one.
    fn insert(&self, key: K, value: V) -> Option<V>;

    /// Remove a key, returning its value.
    fn remove(&self, key: &K) -> Option<V>;

    /// Remove a key only if the predicate holds for its current value.
    fn remove_if<P>(&self, key: &K, predicate: P) -> Option<V>
    where
        P: FnOnce(&V) -> bool;

    /// Get the number of entries in the storage.
    fn len(&self) -> usize;

    /// Check if the storage is empty.
    fn is_empty(&self) -> bool;

    /// Clear all entries from the storage.
    fn clear(&self);

    /// Iterate over all entries, providing access to both key and value.
    fn for_each<F>(&self, f: F)
    where
        F: FnMut(&K, &V);

    /// Remove entries for which the predicate returns false.
    fn retain<F>(&self, f: F)
    where
        F: FnMut(&K, &mut V) -> bool;
}

/// Error raised by a counter store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The store could not be reached
    #[error("counter store unavailable: {0}")]
    Unavailable(String),
    /// The store answered with an error
    #[error("counter store error: {0}")]
    Backend(String),
    /// The store answered with something we could not interpret
    #[error("unexpected counter store reply: {0}")]
    InvalidReply(String),
}

/// Counter value observed right after an increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterReading {
    /// Post-increment count within the current window
    pub count: u64,
    /// Time left before the window closes
    pub ttl: Duration,
}

/// Port for the shared fixed-window counter service.
///
/// `increment` must be a single indivisible operation: it increments the
/// counter for `key`, and if that increment created the counter (or found an
/// elapsed window) it sets the expiry to `window` from now. Two concurrent
/// increments never both observe an empty counter and no increment is lost.
#[async_trait]
pub trait CounterStore: Send + Sync + Debug {
    /// Atomically increment `key`, opening a window of length `window` on
    /// first use.
    async fn increment(&self, key: &str, window: Duration) -> Result<CounterReading, StoreError>;

    /// Delete the counter for `key`. Returns whether a counter existed.
    async fn reset(&self, key: &str) -> Result<bool, StoreError>;

    /// Delete every counter whose key starts with `prefix`. Returns how many
    /// were deleted.
    ///
    /// Not atomic across keys: counters created while the sweep runs may
    /// survive it.
    async fn reset_prefix(&self, prefix: &str) -> Result<u64, StoreError>;
}

/// Error returned by the external model.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("model call failed: {message}")]
pub struct ModelError {
    /// Human-readable cause
    pub message: String,
}

impl ModelError {
    /// Create a model error from a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Port for the opaque prediction model.
#[async_trait]
pub trait PredictionModel: Send + Sync {
    /// Produce a prediction for normalized features.
    async fn predict(&self, features: &FeatureSet) -> Result<PredictionResult, ModelError>;
}
