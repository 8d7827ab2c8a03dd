//! Per-key lock registry.
//!
//! Every key maps to exactly one `RwLock` guarding that key's state. The lock
//! owns the state, so holding the write guard is the only way to touch it.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;

/// A shared handle to one key's lock and the state behind it.
pub type KeyLock<T> = Arc<RwLock<T>>;

/// Concurrent map from key to its dedicated lock.
///
/// Lookup-or-insert goes through the `DashMap` entry API, which holds the
/// shard's write lock while inserting; two callers seeing a key for the first
/// time always receive the same lock instance. Different keys never contend
/// on their per-key locks.
pub struct KeyLockRegistry<T> {
    locks: DashMap<String, KeyLock<T>>,
}

impl<T> KeyLockRegistry<T> {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            locks: DashMap::new(),
        }
    }

    /// Fetch the lock for `key`, creating it with `init` on first sight.
    ///
    /// The second element is `true` when this call created the entry.
    pub fn lock_for_with<F>(&self, key: &str, init: F) -> (KeyLock<T>, bool)
    where
        F: FnOnce() -> T,
    {
        if let Some(existing) = self.locks.get(key) {
            return (Arc::clone(existing.value()), false);
        }

        let mut created = false;
        let entry = self.locks.entry(key.to_owned()).or_insert_with(|| {
            created = true;
            Arc::new(RwLock::new(init()))
        });
        (Arc::clone(entry.value()), created)
    }

    /// Fetch the lock for `key` if it has been seen.
    pub fn get(&self, key: &str) -> Option<KeyLock<T>> {
        self.locks.get(key).map(|entry| Arc::clone(entry.value()))
    }

    /// Number of keys with a lock.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// Whether no key has been seen.
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    /// Snapshot of the registered keys.
    pub fn keys(&self) -> Vec<String> {
        self.locks.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Remove idle keys and return how many were dropped.
    ///
    /// An entry is removed only if nobody outside the registry holds its
    /// `Arc` and `is_idle` says its state can go. The check runs under the
    /// shard write lock, so no caller can clone the handle in between; a key
    /// seen again later gets a fresh lock, never a second live one.
    pub fn sweep<F>(&self, mut is_idle: F) -> usize
    where
        F: FnMut(&mut T) -> bool,
    {
        let mut removed = 0;
        self.locks.retain(|_, lock| {
            if Arc::strong_count(lock) > 1 {
                return true;
            }
            let Some(mut state) = lock.try_write() else {
                return true;
            };
            if is_idle(&mut state) {
                removed += 1;
                false
            } else {
                true
            }
        });
        removed
    }
}

impl<T: Default> KeyLockRegistry<T> {
    /// Fetch the lock for `key`, creating a default state on first sight.
    pub fn lock_for(&self, key: &str) -> KeyLock<T> {
        self.lock_for_with(key, T::default).0
    }
}

impl<T> Default for KeyLockRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}
