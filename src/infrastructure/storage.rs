//! Sharded in-process storage.
//!
//! Backs the feature cache, the connection registry and the in-memory
//! counter store.

use crate::application::ports::Storage;
use ahash::RandomState;
use dashmap::DashMap;
use std::fmt;
use std::hash::Hash;

/// Thread-safe sharded storage backed by DashMap.
///
/// Each key lives in one shard guarded by its own lock, so operations on
/// different keys rarely contend and operations on the same key serialize.
pub struct ShardedStorage<K, V>
where
    K: Eq + Hash + Clone,
{
    map: DashMap<K, V, RandomState>,
}

impl<K, V> ShardedStorage<K, V>
where
    K: Eq + Hash + Clone,
{
    /// Create a new sharded storage instance.
    pub fn new() -> Self {
        Self {
            map: DashMap::with_hasher(RandomState::new()),
        }
    }

    /// Check if a key exists.
    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: std::borrow::Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.map.contains_key(key)
    }

    /// Collect all keys.
    pub fn keys(&self) -> Vec<K> {
        self.map.iter().map(|entry| entry.key().clone()).collect()
    }
}

impl<K, V> Default for ShardedStorage<K, V>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> fmt::Debug for ShardedStorage<K, V>
where
    K: Eq + Hash + Clone,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShardedStorage")
            .field("len", &self.map.len())
            .finish()
    }
}

impl<K, V> Storage<K, V> for ShardedStorage<K, V>
where
    K: Hash + Eq + Clone + Send + Sync,
    V: Send + Sync,
{
    fn with_entry_mut<F, R>(&self, key: K, factory: impl FnOnce() -> V, accessor: F) -> R
    where
        F: FnOnce(&mut V) -> R,
    {
        let mut value_ref = self.map.entry(key).or_insert_with(factory);
        accessor(&mut value_ref)
    }

    fn with_existing<F, R>(&self, key: &K, accessor: F) -> Option<R>
    where
        F: FnOnce(&mut V) -> R,
    {
        self.map.get_mut(key).map(|mut value_ref| accessor(&mut value_ref))
    }

    fn insert(&self, key: K, value: V) -> Option<V> {
        self.map.insert(key, value)
    }

    fn remove(&self, key: &K) -> Option<V> {
        self.map.remove(key).map(|(_, value)| value)
    }

    fn remove_if<P>(&self, key: &K, predicate: P) -> Option<V>
    where
        P: FnOnce(&V) -> bool,
    {
        self.map
            .remove_if(key, |_, value| predicate(value))
            .map(|(_, value)| value)
    }

    fn len(&self) -> usize {
        self.map.len()
    }

    fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    fn clear(&self) {
        self.map.clear()
    }

    fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&K, &V),
    {
        for entry in self.map.iter() {
            f(entry.key(), entry.value());
        }
    }

    fn retain<F>(&self, f: F)
    where
        F: FnMut(&K, &mut V) -> bool,
    {
        self.map.retain(f);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_basic_operations() {
        let storage = ShardedStorage::new();

        assert_eq!(storage.insert("key1", 100), None);
        assert_eq!(storage.insert("key2", 200), None);
        assert_eq!(storage.insert("key1", 101), Some(100));

        assert_eq!(storage.with_existing(&"key1", |v| *v), Some(101));
        assert_eq!(storage.with_existing(&"key3", |v| *v), None);

        assert_eq!(storage.len(), 2);
        assert!(!storage.is_empty());
    }

    #[test]
    fn test_with_entry_mut_creates_once() {
        let storage = ShardedStorage::new();

        storage.with_entry_mut("k", || 0, |v| *v += 1);
        storage.with_entry_mut("k", || panic!("should exist"), |v| *v += 1);

        assert_eq!(storage.with_existing(&"k", |v| *v), Some(2));
    }

    #[test]
    fn test_remove_if() {
        let storage = ShardedStorage::new();
        storage.insert("key", 100);

        assert_eq!(storage.remove_if(&"key", |v| *v > 500), None);
        assert!(storage.contains_key("key"));

        assert_eq!(storage.remove_if(&"key", |v| *v == 100), Some(100));
        assert!(!storage.contains_key("key"));
    }

    #[test]
    fn test_clear_and_retain() {
        let storage = ShardedStorage::new();
        for i in 0..10 {
            storage.insert(i, i * 10);
        }

        storage.retain(|k, _| k % 2 == 0);
        assert_eq!(storage.len(), 5);

        storage.clear();
        assert!(storage.is_empty());
    }

    #[test]
    fn test_concurrent_increments_are_not_lost() {
        let storage = Arc::new(ShardedStorage::new());
        let mut handles = vec![];

        for _ in 0..10 {
            let storage_clone = Arc::clone(&storage);
            handles.push(thread::spawn(move || {
                for _ in 0..100 {
                    storage_clone.with_entry_mut("shared".to_string(), || 0u64, |v| *v += 1);
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(storage.with_existing(&"shared".to_string(), |v| *v), Some(1000));
    }
}
