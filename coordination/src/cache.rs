//! Bounded least-recently-used cache
//!
//! Fixed-capacity key/value store backing the per-scope dedupe tables.
//! Both reads and writes promote the touched key to most-recently-used;
//! inserting a new key into a full cache evicts the least-recently-used
//! entry first.
//!
//! The cache is not internally synchronized. The coordinator holds it
//! behind a lock and performs each get-or-insert sequence under that lock.

use std::hash::Hash;
use std::num::NonZeroUsize;

use lru::LruCache;

/// Default capacity of a dedupe scope.
pub const DEFAULT_CAPACITY: usize = 50_000;

/// Fixed-capacity LRU map.
pub struct BoundedCache<K: Hash + Eq, V> {
    inner: LruCache<K, V>,
}

impl<K: Hash + Eq, V> BoundedCache<K, V> {
    /// Create a cache holding at most `capacity` entries.
    ///
    /// A capacity of zero is raised to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: LruCache::new(capacity),
        }
    }

    /// Look up `key`, marking it most-recently-used on a hit.
    pub fn get(&mut self, key: &K) -> Option<&V> {
        self.inner.get(key)
    }

    /// Mutable lookup, marking `key` most-recently-used on a hit.
    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        self.inner.get_mut(key)
    }

    /// Insert or overwrite `key`, marking it most-recently-used.
    ///
    /// Returns the entry evicted to make room, if any. Overwriting an
    /// existing key never evicts.
    pub fn set(&mut self, key: K, value: V) -> Option<(K, V)> {
        if self.inner.contains(&key) {
            self.inner.put(key, value);
            return None;
        }
        self.inner.push(key, value)
    }

    /// Check for `key` without touching its recency.
    pub fn contains(&self, key: &K) -> bool {
        self.inner.contains(key)
    }

    /// Read `key` without touching its recency.
    pub fn peek(&self, key: &K) -> Option<&V> {
        self.inner.peek(key)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.inner.cap().get()
    }
}

impl<K: Hash + Eq, V> Default for BoundedCache<K, V> {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
