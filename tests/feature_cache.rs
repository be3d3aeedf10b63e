use inference_gate::{Clock, FeatureCache, Metrics};
use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

#[derive(Debug, Clone)]
struct SteppedClock {
    now: Arc<Mutex<Instant>>,
}

impl SteppedClock {
    fn new() -> Self {
        Self {
            now: Arc::new(Mutex::new(Instant::now())),
        }
    }

    fn advance(&self, by: Duration) {
        *self.now.lock().unwrap() += by;
    }
}

impl Clock for SteppedClock {
    fn now(&self) -> Instant {
        *self.now.lock().unwrap()
    }

    fn wall_time(&self) -> SystemTime {
        SystemTime::UNIX_EPOCH
    }
}

fn cache(ttl: Duration) -> (FeatureCache<String>, SteppedClock, Metrics) {
    let clock = SteppedClock::new();
    let metrics = Metrics::new();
    let cache = FeatureCache::builder()
        .with_default_ttl(ttl)
        .with_clock(Arc::new(clock.clone()))
        .with_metrics(metrics.clone())
        .build()
        .unwrap();
    (cache, clock, metrics)
}

#[test]
fn test_entry_expires_at_ttl() {
    let (cache, clock, metrics) = cache(Duration::from_secs(10));
    cache.put("k", "v".to_string());

    clock.advance(Duration::from_secs(9));
    assert_eq!(cache.get("k").as_deref(), Some("v"));

    clock.advance(Duration::from_secs(1));
    assert_eq!(cache.get("k"), None);
    assert!(cache.is_empty());

    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.cache_hits, 1);
    assert_eq!(snapshot.cache_expired, 1);
    assert_eq!(snapshot.cache_misses, 1);
}

#[test]
fn test_set_overrides_default_ttl() {
    let (cache, clock, _) = cache(Duration::from_secs(300));
    cache.set("short", "a".to_string(), Duration::from_secs(1));
    cache.put("long", "b".to_string());

    clock.advance(Duration::from_secs(2));
    assert_eq!(cache.get("short"), None);
    assert_eq!(cache.get("long").as_deref(), Some("b"));
}

#[test]
fn test_overwrite_resets_expiry() {
    let (cache, clock, _) = cache(Duration::from_secs(10));
    cache.put("k", "old".to_string());
    clock.advance(Duration::from_secs(8));
    cache.put("k", "new".to_string());
    clock.advance(Duration::from_secs(8));

    assert_eq!(cache.get("k").as_deref(), Some("new"));
}

#[test]
fn test_purge_expired_keeps_live_entries() {
    let (cache, clock, _) = cache(Duration::from_secs(10));
    cache.put("a", "1".to_string());
    cache.set("b", "2".to_string(), Duration::from_secs(60));
    clock.advance(Duration::from_secs(30));

    assert_eq!(cache.len(), 2);
    assert_eq!(cache.purge_expired(), 1);
    assert_eq!(cache.len(), 1);
    assert_eq!(cache.get("b").as_deref(), Some("2"));
}

#[tokio::test]
async fn test_get_or_compute_only_computes_on_miss() {
    let (cache, clock, _) = cache(Duration::from_secs(10));
    let computed = AtomicUsize::new(0);
    let compute = || async {
        computed.fetch_add(1, Ordering::SeqCst);
        Ok::<_, Infallible>("value".to_string())
    };

    let first = cache.get_or_compute("k", Duration::from_secs(10), compute).await.unwrap();
    let second = cache.get_or_compute("k", Duration::from_secs(10), compute).await.unwrap();
    assert!(!first.hit);
    assert!(second.hit);
    assert_eq!(computed.load(Ordering::SeqCst), 1);

    clock.advance(Duration::from_secs(10));
    let third = cache.get_or_compute("k", Duration::from_secs(10), compute).await.unwrap();
    assert!(!third.hit);
    assert_eq!(computed.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_failed_compute_is_not_cached() {
    let (cache, _, _) = cache(Duration::from_secs(10));

    let result = cache
        .get_or_compute("k", Duration::from_secs(10), || async {
            Err::<String, _>("model offline")
        })
        .await;

    assert_eq!(result.unwrap_err(), "model offline");
    assert!(cache.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_writers_on_distinct_keys() {
    let (cache, _, _) = cache(Duration::from_secs(60));

    let handles: Vec<_> = (0..16)
        .map(|worker| {
            let cache = cache.clone();
            tokio::spawn(async move {
                for i in 0..100 {
                    let key = format!("{}:{}", worker, i);
                    cache.put(key.clone(), key.clone());
                    assert_eq!(cache.get(&key), Some(key));
                }
            })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(cache.len(), 1600);
}

#[test]
fn test_zero_ttl_is_rejected() {
    let result = FeatureCache::<String>::builder()
        .with_default_ttl(Duration::ZERO)
        .build();
    assert!(result.is_err());
}
