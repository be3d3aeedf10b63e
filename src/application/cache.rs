//! Time-bounded memoization of feature sets.
//!
//! Entries expire lazily: a read past an entry's expiry removes it and
//! reports a miss. Memory is unbounded unless the caller runs
//! [`FeatureCache::purge_expired`] or starts the background sweeper.

use crate::application::error::BuildError;
use crate::application::metrics::Metrics;
use crate::application::ports::{Clock, Storage};
use crate::infrastructure::clock::SystemClock;
use crate::infrastructure::storage::ShardedStorage;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Default time-to-live for [`FeatureCache::put`].
pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    expires_at: Instant,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// Result of [`FeatureCache::get_or_compute`].
#[derive(Debug, Clone, PartialEq)]
pub struct CacheLookup<V> {
    /// The cached or freshly computed value
    pub value: V,
    /// Whether the value came from the cache
    pub hit: bool,
}

/// Concurrent TTL cache keyed by string.
///
/// Operations on one key are serialized; different keys do not contend
/// beyond sharing a shard. Clones share the same entries.
pub struct FeatureCache<V> {
    entries: Arc<ShardedStorage<String, CacheEntry<V>>>,
    clock: Arc<dyn Clock>,
    default_ttl: Duration,
    metrics: Metrics,
}

impl<V> Clone for FeatureCache<V> {
    fn clone(&self) -> Self {
        Self {
            entries: Arc::clone(&self.entries),
            clock: Arc::clone(&self.clock),
            default_ttl: self.default_ttl,
            metrics: self.metrics.clone(),
        }
    }
}

impl<V: Send + Sync> fmt::Debug for FeatureCache<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeatureCache")
            .field("entries", &self.entries.len())
            .field("default_ttl", &self.default_ttl)
            .finish()
    }
}

impl<V> FeatureCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Create a builder.
    pub fn builder() -> FeatureCacheBuilder<V> {
        FeatureCacheBuilder::default()
    }

    /// Store `value` under `key` for `ttl`, replacing any existing entry.
    pub fn set(&self, key: impl Into<String>, value: V, ttl: Duration) {
        let expires_at = self.clock.now() + ttl;
        self.entries
            .insert(key.into(), CacheEntry { value, expires_at });
    }

    /// Store `value` under `key` with the default TTL.
    pub fn put(&self, key: impl Into<String>, value: V) {
        self.set(key, value, self.default_ttl);
    }

    /// Read a live entry.
    ///
    /// An expired entry is removed and reported as a miss.
    pub fn get(&self, key: &str) -> Option<V> {
        let key = key.to_string();
        let now = self.clock.now();

        if self
            .entries
            .remove_if(&key, |entry| entry.is_expired(now))
            .is_some()
        {
            self.metrics.record_cache_expired();
            debug!(key = %key, "cache entry expired");
            return None;
        }

        let value = self
            .entries
            .with_existing(&key, |entry| {
                (!entry.is_expired(now)).then(|| entry.value.clone())
            })
            .flatten();

        match value {
            Some(value) => {
                self.metrics.record_cache_hit();
                debug!(key = %key, "cache hit");
                Some(value)
            }
            None => {
                self.metrics.record_cache_miss();
                None
            }
        }
    }

    /// Return the cached value for `key`, or compute, store and return it.
    ///
    /// Only a successful computation is written. If the returned future is
    /// dropped before `compute` finishes, nothing is written.
    pub async fn get_or_compute<F, Fut, E>(
        &self,
        key: &str,
        ttl: Duration,
        compute: F,
    ) -> Result<CacheLookup<V>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if let Some(value) = self.get(key) {
            return Ok(CacheLookup { value, hit: true });
        }

        let value = compute().await?;
        self.set(key, value.clone(), ttl);
        Ok(CacheLookup { value, hit: false })
    }

    /// Remove an entry. Returns whether one existed.
    pub fn remove(&self, key: &str) -> bool {
        self.entries.remove(&key.to_string()).is_some()
    }

    /// Remove all entries.
    pub fn clear(&self) {
        self.entries.clear();
        info!("feature cache cleared");
    }

    /// Number of stored entries, including expired ones not yet evicted.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Default TTL used by [`put`](Self::put).
    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Evict every expired entry. Returns how many were evicted.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let mut purged = 0;
        self.entries.retain(|_, entry| {
            let keep = !entry.is_expired(now);
            if !keep {
                purged += 1;
            }
            keep
        });
        purged
    }

    /// Start a background task that purges expired entries every `interval`.
    ///
    /// Must be called within a Tokio runtime. Abort the handle to stop it.
    ///
    /// # Errors
    /// Returns `BuildError::ZeroSweepInterval` if `interval` is zero.
    pub fn spawn_sweeper(&self, interval: Duration) -> Result<JoinHandle<()>, BuildError> {
        if interval.is_zero() {
            return Err(BuildError::ZeroSweepInterval);
        }

        let cache = self.clone();
        Ok(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let purged = cache.purge_expired();
                if purged > 0 {
                    debug!(purged, "swept expired cache entries");
                }
            }
        }))
    }
}

/// Builder for [`FeatureCache`].
pub struct FeatureCacheBuilder<V> {
    default_ttl: Option<Duration>,
    clock: Option<Arc<dyn Clock>>,
    metrics: Option<Metrics>,
    _value: PhantomData<fn() -> V>,
}

impl<V> Default for FeatureCacheBuilder<V> {
    fn default() -> Self {
        Self {
            default_ttl: None,
            clock: None,
            metrics: None,
            _value: PhantomData,
        }
    }
}

impl<V> FeatureCacheBuilder<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Set the TTL used by `put`. Defaults to 300 seconds.
    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = Some(ttl);
        self
    }

    /// Set the clock used for expiry.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Share a metrics handle with other components.
    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Build the cache.
    ///
    /// # Errors
    /// Returns `BuildError::ZeroDefaultTtl` if the default TTL is zero.
    pub fn build(self) -> Result<FeatureCache<V>, BuildError> {
        let default_ttl = self.default_ttl.unwrap_or(DEFAULT_TTL);
        if default_ttl.is_zero() {
            return Err(BuildError::ZeroDefaultTtl);
        }

        Ok(FeatureCache {
            entries: Arc::new(ShardedStorage::new()),
            clock: self
                .clock
                .unwrap_or_else(|| Arc::new(SystemClock::new())),
            default_ttl,
            metrics: self.metrics.unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::mocks::MockClock;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn cache() -> (FeatureCache<String>, MockClock) {
        let clock = MockClock::new(Instant::now());
        let cache = FeatureCache::builder()
            .with_clock(Arc::new(clock.clone()))
            .build()
            .unwrap();
        (cache, clock)
    }

    #[test]
    fn test_set_then_get() {
        let (cache, _) = cache();
        cache.set("k", "v".to_string(), Duration::from_secs(10));
        assert_eq!(cache.get("k").as_deref(), Some("v"));
    }

    #[test]
    fn test_set_overwrites_value_and_expiry() {
        let (cache, clock) = cache();
        cache.set("k", "old".to_string(), Duration::from_secs(1));
        cache.set("k", "new".to_string(), Duration::from_secs(10));

        clock.advance(Duration::from_secs(5));
        assert_eq!(cache.get("k").as_deref(), Some("new"));
    }

    #[test]
    fn test_expired_read_is_miss_and_evicts() {
        let (cache, clock) = cache();
        cache.set("k", "v".to_string(), Duration::from_secs(10));

        clock.advance(Duration::from_secs(10));
        assert_eq!(cache.get("k"), None);
        assert_eq!(cache.len(), 0);

        let snapshot = cache.metrics.snapshot();
        assert_eq!(snapshot.cache_expired, 1);
        assert_eq!(snapshot.cache_misses, 1);
    }

    #[test]
    fn test_missing_key_is_miss() {
        let (cache, _) = cache();
        assert_eq!(cache.get("absent"), None);
        assert_eq!(cache.metrics.snapshot().cache_misses, 1);
    }

    #[test]
    fn test_put_uses_default_ttl() {
        let clock = MockClock::new(Instant::now());
        let cache: FeatureCache<u32> = FeatureCache::builder()
            .with_clock(Arc::new(clock.clone()))
            .with_default_ttl(Duration::from_secs(2))
            .build()
            .unwrap();

        cache.put("k", 7);
        clock.advance(Duration::from_secs(1));
        assert_eq!(cache.get("k"), Some(7));
        clock.advance(Duration::from_secs(1));
        assert_eq!(cache.get("k"), None);
    }

    #[test]
    fn test_remove_and_clear() {
        let (cache, _) = cache();
        cache.set("a", "1".to_string(), Duration::from_secs(10));
        cache.set("b", "2".to_string(), Duration::from_secs(10));

        assert!(cache.remove("a"));
        assert!(!cache.remove("a"));

        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_purge_expired() {
        let (cache, clock) = cache();
        cache.set("short", "1".to_string(), Duration::from_secs(1));
        cache.set("long", "2".to_string(), Duration::from_secs(100));

        clock.advance(Duration::from_secs(5));
        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_get_or_compute_caches_success() {
        let (cache, _) = cache();
        let calls = AtomicUsize::new(0);

        for expected_hit in [false, true] {
            let lookup = cache
                .get_or_compute("k", Duration::from_secs(10), || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, String>("computed".to_string())
                })
                .await
                .unwrap();
            assert_eq!(lookup.value, "computed");
            assert_eq!(lookup.hit, expected_hit);
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_get_or_compute_does_not_store_failure() {
        let (cache, _) = cache();

        let result = cache
            .get_or_compute("k", Duration::from_secs(10), || async {
                Err::<String, _>("boom".to_string())
            })
            .await;

        assert_eq!(result, Err("boom".to_string()));
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_or_compute_dropped_mid_compute_writes_nothing() {
        let (cache, _) = cache();

        let timed_out = tokio::time::timeout(
            Duration::from_secs(1),
            cache.get_or_compute("k", Duration::from_secs(10), || async {
                std::future::pending::<Result<String, String>>().await
            }),
        )
        .await;

        assert!(timed_out.is_err());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_get_or_compute_aborted_task_writes_nothing() {
        let (cache, _) = cache();
        let (started_tx, started_rx) = tokio::sync::oneshot::channel();

        let task = {
            let cache = cache.clone();
            tokio::spawn(async move {
                cache
                    .get_or_compute("k", Duration::from_secs(10), || async move {
                        let _ = started_tx.send(());
                        std::future::pending::<Result<String, String>>().await
                    })
                    .await
            })
        };

        started_rx.await.unwrap();
        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());
        assert!(cache.is_empty());
        assert_eq!(cache.get("k"), None);
    }

    #[test]
    fn test_debug_reports_entry_count() {
        let (cache, _) = cache();
        cache.set("k", "v".to_string(), Duration::from_secs(10));

        let rendered = format!("{:?}", cache);
        assert!(rendered.starts_with("FeatureCache"));
        assert!(rendered.contains("entries: 1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_purges_in_background() {
        let (cache, clock) = cache();
        cache.set("k", "v".to_string(), Duration::from_secs(1));
        clock.advance(Duration::from_secs(2));

        let handle = cache.spawn_sweeper(Duration::from_secs(1)).unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;

        assert_eq!(cache.len(), 0);
        handle.abort();
    }

    #[tokio::test]
    async fn test_sweeper_rejects_zero_interval() {
        let (cache, _) = cache();
        assert!(matches!(
            cache.spawn_sweeper(Duration::ZERO),
            Err(BuildError::ZeroSweepInterval)
        ));
    }

    #[test]
    fn test_build_rejects_zero_ttl() {
        let result = FeatureCache::<String>::builder()
            .with_default_ttl(Duration::ZERO)
            .build();
        assert!(matches!(result, Err(BuildError::ZeroDefaultTtl)));
    }
}
