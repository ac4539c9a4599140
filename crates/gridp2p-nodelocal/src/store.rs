//! NodeLocalStore — concurrent key/value map scoped to one grid node.
//!
//! Offers the three primitives callers need to build lock-free state on
//! top: plain reads, insert-if-absent, and compare-and-replace. None of
//! the operations can fail; a lost compare is reported as `false`.

use std::borrow::Borrow;
use std::hash::Hash;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::trace;

/// Thread-safe node-local store.
#[derive(Debug)]
pub struct NodeLocalStore<K, V>
where
    K: Eq + Hash,
{
    map: Arc<DashMap<K, V>>,
}

impl<K, V> Clone for NodeLocalStore<K, V>
where
    K: Eq + Hash,
{
    fn clone(&self) -> Self {
        Self {
            map: Arc::clone(&self.map),
        }
    }
}

impl<K, V> Default for NodeLocalStore<K, V>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> NodeLocalStore<K, V>
where
    K: Eq + Hash,
{
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            map: Arc::new(DashMap::new()),
        }
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Remove a key, returning its value if it was present.
    pub fn remove<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.map.remove(key).map(|(_, v)| v)
    }

    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.map.contains_key(key)
    }
}

impl<K, V> NodeLocalStore<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone + PartialEq,
{
    /// Current value for `key`, if any.
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.map.get(key).map(|guard| guard.value().clone())
    }

    /// Insert `value` unless `key` is already present.
    ///
    /// Returns the existing value when the key was present (nothing is
    /// written), or `None` when `value` was inserted.
    pub fn put_if_absent(&self, key: K, value: V) -> Option<V> {
        match self.map.entry(key) {
            Entry::Occupied(existing) => Some(existing.get().clone()),
            Entry::Vacant(slot) => {
                slot.insert(value);
                None
            }
        }
    }

    /// Replace the value for `key` with `new` only if it currently equals
    /// `expected`. Returns whether the replacement happened.
    pub fn compare_and_replace<Q>(&self, key: &Q, expected: &V, new: V) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        match self.map.get_mut(key) {
            Some(mut current) if *current == *expected => {
                *current = new;
                true
            }
            _ => false,
        }
    }

    /// Snapshot of all keys.
    pub fn keys(&self) -> Vec<K> {
        self.map.iter().map(|entry| entry.key().clone()).collect()
    }
}

impl<K> NodeLocalStore<K, u64>
where
    K: Eq + Hash + Clone,
{
    /// Increment the counter stored under `key`, treating an absent key as
    /// zero. Returns the value after the increment.
    ///
    /// Optimistic: seeds the key with `put_if_absent(key, 1)`, otherwise
    /// retries `compare_and_replace(current, current + 1)` until it wins.
    pub fn increment(&self, key: K) -> u64 {
        let mut attempts = 1u32;
        loop {
            // A concurrent remove sends us back to seeding the counter.
            let current = match self.get(&key) {
                Some(value) => value,
                None => match self.put_if_absent(key.clone(), 1) {
                    None => return 1,
                    Some(raced) => raced,
                },
            };
            let next = current + 1;
            if self.compare_and_replace(&key, &current, next) {
                if attempts > 1 {
                    trace!(attempts, "node-local counter increment retried");
                }
                return next;
            }
            attempts += 1;
        }
    }

    /// Counter value, zero when absent.
    pub fn counter<Q>(&self, key: &Q) -> u64
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.get(key).unwrap_or(0)
    }
}
