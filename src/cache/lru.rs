//! Bounded LRU cache with optional per-entry expiry.
//!
//! The cache backs the in-process rate limiter and the default refresh-token
//! deny-list, so the hard requirement is that memory stays bounded by
//! capacity no matter how many distinct keys are thrown at it. Old entries
//! are evicted from the tail; expired entries are dropped lazily on access.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;
use std::time::{Duration, Instant};

const NIL: usize = usize::MAX;

struct Node<K, V> {
    key: K,
    value: V,
    expires: Option<Instant>,
    prev: usize,
    next: usize,
}

struct Inner<K, V> {
    index: HashMap<K, usize>,
    slots: Vec<Option<Node<K, V>>>,
    free: Vec<usize>,
    head: usize,
    tail: usize,
}

/// Fixed-capacity cache with O(1) `get`/`put`/`remove`.
///
/// Recency is tracked with an intrusive doubly-linked list over slab slots
/// (head = most recently used). A single mutex serializes all structural
/// mutation; entries are cloned out on read.
pub struct LruCache<K, V> {
    capacity: usize,
    inner: Mutex<Inner<K, V>>,
}

impl<K, V> LruCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Creates a cache holding at most `capacity` entries. A zero capacity
    /// is bumped to one so the cache stays usable.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            inner: Mutex::new(Inner {
                index: HashMap::new(),
                slots: Vec::new(),
                free: Vec::new(),
                head: NIL,
                tail: NIL,
            }),
        }
    }

    /// Returns the value for `key` and marks it most recently used.
    ///
    /// An entry whose expiry has elapsed is removed eagerly and reported as
    /// a miss.
    pub fn get(&self, key: &K) -> Option<V> {
        let mut inner = self.lock();
        let idx = *inner.index.get(key)?;
        let expired = inner.slots[idx]
            .as_ref()
            .and_then(|node| node.expires)
            .is_some_and(|at| at <= Instant::now());
        if expired {
            inner.remove_slot(idx);
            return None;
        }
        inner.detach(idx);
        inner.push_front(idx);
        inner.slots[idx].as_ref().map(|node| node.value.clone())
    }

    /// Inserts or updates `key`, making it most recently used.
    ///
    /// `ttl == Duration::ZERO` means the entry never expires. Inserting a
    /// new key beyond capacity evicts the least recently used entry,
    /// regardless of that entry's expiry.
    pub fn put(&self, key: K, value: V, ttl: Duration) {
        let expires = if ttl.is_zero() {
            None
        } else {
            Some(Instant::now() + ttl)
        };
        let mut inner = self.lock();
        if let Some(&idx) = inner.index.get(&key) {
            if let Some(node) = inner.slots[idx].as_mut() {
                node.value = value;
                node.expires = expires;
            }
            inner.detach(idx);
            inner.push_front(idx);
            return;
        }
        let idx = inner.insert_slot(Node {
            key: key.clone(),
            value,
            expires,
            prev: NIL,
            next: NIL,
        });
        inner.index.insert(key, idx);
        inner.push_front(idx);
        if inner.index.len() > self.capacity {
            let tail = inner.tail;
            inner.remove_slot(tail);
        }
    }

    /// Atomically replaces the value for `key` under a single lock
    /// acquisition.
    ///
    /// The closure sees the current unexpired value (an expired entry reads
    /// as absent and is removed). Returning `Some` stores that value with a
    /// fresh `ttl` and marks the entry most recently used; returning `None`
    /// leaves the cache untouched. Because the lock spans the whole
    /// read-modify-write, concurrent updates of one key never lose a step.
    pub fn update<F>(&self, key: K, ttl: Duration, f: F) -> Option<V>
    where
        F: FnOnce(Option<&V>) -> Option<V>,
    {
        let expires = if ttl.is_zero() {
            None
        } else {
            Some(Instant::now() + ttl)
        };
        let mut inner = self.lock();
        if let Some(&idx) = inner.index.get(&key) {
            let expired = inner.slots[idx]
                .as_ref()
                .and_then(|node| node.expires)
                .is_some_and(|at| at <= Instant::now());
            if expired {
                inner.remove_slot(idx);
            } else {
                let value = f(inner.slots[idx].as_ref().map(|node| &node.value))?;
                if let Some(node) = inner.slots[idx].as_mut() {
                    node.value = value.clone();
                    node.expires = expires;
                }
                inner.detach(idx);
                inner.push_front(idx);
                return Some(value);
            }
        }
        let value = f(None)?;
        let idx = inner.insert_slot(Node {
            key: key.clone(),
            value: value.clone(),
            expires,
            prev: NIL,
            next: NIL,
        });
        inner.index.insert(key, idx);
        inner.push_front(idx);
        if inner.index.len() > self.capacity {
            let tail = inner.tail;
            inner.remove_slot(tail);
        }
        Some(value)
    }

    /// Removes `key`, reporting whether it was present.
    pub fn remove(&self, key: &K) -> bool {
        let mut inner = self.lock();
        match inner.index.get(key).copied() {
            Some(idx) => {
                inner.remove_slot(idx);
                true
            }
            None => false,
        }
    }

    /// Current number of entries, counting expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.lock().index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of entries.
    #[must_use]
    pub fn cap(&self) -> usize {
        self.capacity
    }

    /// Fill ratio in `[0.0, 1.0]`.
    #[allow(clippy::cast_precision_loss)]
    pub fn load_factor(&self) -> f64 {
        self.len() as f64 / self.capacity as f64
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner<K, V>> {
        // A poisoned lock means a panic mid-mutation; the list is repaired
        // on the next structural operation, so keep serving.
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl<K, V> Inner<K, V>
where
    K: Eq + Hash + Clone,
{
    fn insert_slot(&mut self, node: Node<K, V>) -> usize {
        if let Some(idx) = self.free.pop() {
            self.slots[idx] = Some(node);
            idx
        } else {
            self.slots.push(Some(node));
            self.slots.len() - 1
        }
    }

    fn remove_slot(&mut self, idx: usize) {
        self.detach(idx);
        if let Some(node) = self.slots[idx].take() {
            self.index.remove(&node.key);
        }
        self.free.push(idx);
    }

    fn detach(&mut self, idx: usize) {
        let (prev, next) = match self.slots[idx].as_ref() {
            Some(node) => (node.prev, node.next),
            None => return,
        };
        if prev == NIL {
            if self.head == idx {
                self.head = next;
            }
        } else if let Some(node) = self.slots[prev].as_mut() {
            node.next = next;
        }
        if next == NIL {
            if self.tail == idx {
                self.tail = prev;
            }
        } else if let Some(node) = self.slots[next].as_mut() {
            node.prev = prev;
        }
        if let Some(node) = self.slots[idx].as_mut() {
            node.prev = NIL;
            node.next = NIL;
        }
    }

    fn push_front(&mut self, idx: usize) {
        let old_head = self.head;
        if let Some(node) = self.slots[idx].as_mut() {
            node.prev = NIL;
            node.next = old_head;
        }
        if old_head != NIL {
            if let Some(node) = self.slots[old_head].as_mut() {
                node.prev = idx;
            }
        }
        self.head = idx;
        if self.tail == NIL {
            self.tail = idx;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn get_returns_inserted_value() {
        let cache = LruCache::new(4);
        cache.put("a", 1, Duration::ZERO);
        assert_eq!(cache.get(&"a"), Some(1));
        assert_eq!(cache.get(&"b"), None);
    }

    #[test]
    fn put_updates_existing_key_without_growing() {
        let cache = LruCache::new(4);
        cache.put("a", 1, Duration::ZERO);
        cache.put("a", 2, Duration::ZERO);
        assert_eq!(cache.get(&"a"), Some(2));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn capacity_is_never_exceeded() {
        let cache = LruCache::new(3);
        for i in 0..100 {
            cache.put(i, i, Duration::ZERO);
            assert!(cache.len() <= cache.cap());
        }
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn overflow_evicts_least_recently_used() {
        let cache = LruCache::new(2);
        cache.put("a", 1, Duration::ZERO);
        cache.put("b", 2, Duration::ZERO);
        // Touch "a" so "b" becomes the LRU entry.
        assert_eq!(cache.get(&"a"), Some(1));
        cache.put("c", 3, Duration::ZERO);
        assert_eq!(cache.get(&"b"), None);
        assert_eq!(cache.get(&"a"), Some(1));
        assert_eq!(cache.get(&"c"), Some(3));
    }

    #[test]
    fn expired_entry_is_removed_on_read() {
        let cache = LruCache::new(4);
        cache.put("a", 1, Duration::from_millis(20));
        cache.put("b", 2, Duration::ZERO);
        thread::sleep(Duration::from_millis(40));
        assert_eq!(cache.get(&"a"), None);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&"b"), Some(2));
    }

    #[test]
    fn update_inserts_mutates_and_declines() {
        let cache = LruCache::new(4);
        assert_eq!(cache.update("a", Duration::ZERO, |old| {
            assert!(old.is_none());
            Some(1)
        }), Some(1));
        assert_eq!(cache.update("a", Duration::ZERO, |old| old.map(|v| v + 1)), Some(2));
        assert_eq!(cache.get(&"a"), Some(2));
        // Declining the update leaves the entry untouched.
        assert_eq!(cache.update("a", Duration::ZERO, |_| None), None);
        assert_eq!(cache.get(&"a"), Some(2));
        assert_eq!(cache.update("b", Duration::ZERO, |_| None), None);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn update_treats_expired_entry_as_absent() {
        let cache = LruCache::new(4);
        cache.put("a", 10, Duration::from_millis(20));
        thread::sleep(Duration::from_millis(40));
        assert_eq!(cache.update("a", Duration::ZERO, |old| {
            assert!(old.is_none());
            Some(1)
        }), Some(1));
        assert_eq!(cache.get(&"a"), Some(1));
    }

    #[test]
    fn remove_reports_presence() {
        let cache = LruCache::new(4);
        cache.put("a", 1, Duration::ZERO);
        assert!(cache.remove(&"a"));
        assert!(!cache.remove(&"a"));
        assert!(cache.is_empty());
    }

    #[test]
    fn load_factor_tracks_fill() {
        let cache = LruCache::new(4);
        assert!(cache.load_factor().abs() < f64::EPSILON);
        cache.put("a", 1, Duration::ZERO);
        cache.put("b", 2, Duration::ZERO);
        assert!((cache.load_factor() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn reinserting_after_eviction_reuses_slots() {
        let cache = LruCache::new(2);
        for i in 0..10 {
            cache.put(i, i, Duration::ZERO);
        }
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&9), Some(9));
        assert_eq!(cache.get(&8), Some(8));
    }
}
