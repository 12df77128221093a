//! Concurrent map with snapshot reads
//!
//! Backed by `DashMap`. Values are handed out as clones so callers never hold
//! a reference into the map's storage; in-place mutation goes through
//! [`ConcurrentMap::update`], which runs under the entry's shard lock.

use dashmap::DashMap;
use std::hash::Hash;

/// Thread-safe map owned by a single store
#[derive(Debug)]
pub struct ConcurrentMap<K, V>
where
    K: Eq + Hash,
{
    inner: DashMap<K, V>,
}

impl<K, V> Default for ConcurrentMap<K, V>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self {
            inner: DashMap::new(),
        }
    }
}

impl<K, V> ConcurrentMap<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Create an empty map
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace, returning the previous value
    #[inline]
    pub fn set(&self, key: K, value: V) -> Option<V> {
        self.inner.insert(key, value)
    }

    /// Clone out the value for `key`
    #[inline]
    #[must_use]
    pub fn get(&self, key: &K) -> Option<V> {
        self.inner.get(key).map(|entry| entry.value().clone())
    }

    /// Remove and return the value for `key`
    #[inline]
    pub fn delete(&self, key: &K) -> Option<V> {
        self.inner.remove(key).map(|(_, v)| v)
    }

    /// Whether `key` is present
    #[inline]
    #[must_use]
    pub fn contains_key(&self, key: &K) -> bool {
        self.inner.contains_key(key)
    }

    /// Mutate the value for `key` in place
    ///
    /// Returns `None` when the key is absent.
    pub fn update<R>(&self, key: &K, f: impl FnOnce(&mut V) -> R) -> Option<R> {
        self.inner.get_mut(key).map(|mut entry| f(entry.value_mut()))
    }

    /// Keep only entries for which `f` returns true
    #[inline]
    pub fn retain(&self, f: impl FnMut(&K, &mut V) -> bool) {
        self.inner.retain(f);
    }

    /// Remove everything
    #[inline]
    pub fn clear(&self) {
        self.inner.clear();
    }

    /// Snapshot of all values
    #[must_use]
    pub fn values(&self) -> Vec<V> {
        self.inner.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Snapshot of all entries
    #[must_use]
    pub fn entries(&self) -> Vec<(K, V)> {
        self.inner
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Number of entries
    #[inline]
    #[must_use]
    pub fn size(&self) -> usize {
        self.inner.len()
    }

    /// Whether the map is empty
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_set_get_delete() {
        let map = ConcurrentMap::new();
        assert!(map.set("a", 1).is_none());
        assert_eq!(map.set("a", 2), Some(1));
        assert_eq!(map.get(&"a"), Some(2));
        assert_eq!(map.delete(&"a"), Some(2));
        assert!(map.get(&"a").is_none());
        assert!(map.is_empty());
    }

    #[test]
    fn map_update_in_place() {
        let map = ConcurrentMap::new();
        map.set("counter", 1);
        let doubled = map.update(&"counter", |v| {
            *v *= 2;
            *v
        });
        assert_eq!(doubled, Some(2));
        assert_eq!(map.update(&"missing", |v| *v), None);
    }

    #[test]
    fn map_snapshots_are_detached() {
        let map = ConcurrentMap::new();
        map.set(1, "one".to_string());
        map.set(2, "two".to_string());

        let mut entries = map.entries();
        map.clear();

        entries.sort();
        assert_eq!(entries, vec![(1, "one".to_string()), (2, "two".to_string())]);
        assert_eq!(map.size(), 0);
    }

    #[test]
    fn map_retain() {
        let map = ConcurrentMap::new();
        for i in 0..10 {
            map.set(i, i);
        }
        map.retain(|_, v| *v % 2 == 0);
        assert_eq!(map.size(), 5);
        let mut values = map.values();
        values.sort_unstable();
        assert_eq!(values, vec![0, 2, 4, 6, 8]);
    }
}
