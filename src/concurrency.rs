//! Per-identity locking
//!
//! Hands out one lock per key so writers touching the same frame identity or
//! attribute group serialise, while unrelated keys proceed in parallel.
//! Entries live only while someone holds or waits on them.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;

/// Lock registry keyed by string identity
#[derive(Debug, Default)]
pub struct LockManager {
    locks: Mutex<HashMap<String, Arc<RwLock<()>>>>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock for `key`, created on first use.
    ///
    /// Callers that take a lock this way must hand the key back to `release`
    /// once they have dropped the handle.
    pub fn get_lock(&self, key: &str) -> Arc<RwLock<()>> {
        let mut locks = self.locks.lock();
        locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    /// Forget the lock for `key` if no handle to it is left outside the map.
    pub fn release(&self, key: &str) {
        let mut locks = self.locks.lock();
        if locks.get(key).map_or(false, |lock| Arc::strong_count(lock) == 1) {
            locks.remove(key);
        }
    }

    /// Run `f` holding the write lock for `key`, then release the entry.
    pub fn with_write_lock<T, F: FnOnce() -> T>(&self, key: &str, f: F) -> T {
        let lock = self.get_lock(key);
        let result = {
            let _guard = lock.write();
            f()
        };
        drop(lock);
        self.release(key);
        result
    }

    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
