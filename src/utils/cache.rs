//! Bounded least-recently-used map.
//!
//! Used wherever the core would otherwise grow an unbounded map: cached
//! connections, skipped message keys, retired group epochs. The capacity is a
//! hard cap; inserting into a full cache evicts the least recently used entry
//! and hands it back to the caller.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;

/// Map with a hard capacity and LRU eviction
#[derive(Debug, Clone)]
pub struct BoundedCache<K, V> {
    capacity: usize,
    entries: HashMap<K, V>,
    /// Front is least recently used
    order: VecDeque<K>,
}

impl<K: Eq + Hash + Clone, V> BoundedCache<K, V> {
    /// Create a cache holding at most `capacity` entries (minimum 1)
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    /// Maximum number of entries
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert or replace, returning the evicted entry if the cap was hit
    pub fn insert(&mut self, key: K, value: V) -> Option<(K, V)> {
        if self.entries.insert(key.clone(), value).is_some() {
            self.touch(&key);
            return None;
        }
        self.order.push_back(key);

        if self.entries.len() > self.capacity {
            let oldest = self.order.pop_front()?;
            let value = self.entries.remove(&oldest)?;
            return Some((oldest, value));
        }
        None
    }

    /// Look up and mark as recently used
    pub fn get(&mut self, key: &K) -> Option<&V> {
        if self.entries.contains_key(key) {
            self.touch(key);
        }
        self.entries.get(key)
    }

    /// Mutable lookup, marks as recently used
    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        if self.entries.contains_key(key) {
            self.touch(key);
        }
        self.entries.get_mut(key)
    }

    /// Look up without changing recency
    pub fn peek(&self, key: &K) -> Option<&V> {
        self.entries.get(key)
    }

    /// True if the key is cached
    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    /// Remove an entry
    pub fn remove(&mut self, key: &K) -> Option<V> {
        let value = self.entries.remove(key)?;
        self.order.retain(|k| k != key);
        Some(value)
    }

    /// Iterate in no particular order
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.entries.iter()
    }

    /// Drop entries failing the predicate
    pub fn retain(&mut self, mut keep: impl FnMut(&K, &V) -> bool) {
        self.entries.retain(|k, v| keep(k, v));
        let entries = &self.entries;
        self.order.retain(|k| entries.contains_key(k));
    }

    fn touch(&mut self, key: &K) {
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            if let Some(k) = self.order.remove(pos) {
                self.order.push_back(k);
            }
        }
    }
}
