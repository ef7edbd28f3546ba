//! Cache Updater Module
//!
//! The mutation surface handed to [`SourceCache::edit`](super::SourceCache::edit).

use std::cell::RefCell;
use std::sync::Arc;

use crate::cache::ChangeAwareCache;
use crate::change::{Key, Value};

/// Derives a value's key.
pub type KeySelector<K, V> = Arc<dyn Fn(&V) -> K + Send + Sync>;

// == Intent ==
/// One mutation request inside an [`edit_batch`](super::SourceCache::edit_batch).
#[derive(Debug, Clone, PartialEq)]
pub enum Intent<K, V> {
    AddOrUpdate(V),
    RemoveKey(K),
    Refresh(K),
    Clear,
}

// == Cache Updater ==
/// Mutates a source cache inside one atomic edit.
///
/// The cache is borrowed for one operation at a time, so code running
/// between operations may read the cache, subscribe to it or drop a
/// subscription.
pub struct CacheUpdater<'a, K, V> {
    cache: &'a RefCell<ChangeAwareCache<K, V>>,
    key_selector: &'a KeySelector<K, V>,
}

impl<'a, K: Key, V: Value> CacheUpdater<'a, K, V> {
    pub(crate) fn new(
        cache: &'a RefCell<ChangeAwareCache<K, V>>,
        key_selector: &'a KeySelector<K, V>,
    ) -> Self {
        Self {
            cache,
            key_selector,
        }
    }

    pub fn add_or_update(&mut self, value: V) {
        let key = (self.key_selector)(&value);
        self.cache.borrow_mut().add_or_update(key, value);
    }

    pub fn add_or_update_many(&mut self, values: impl IntoIterator<Item = V>) {
        for value in values {
            self.add_or_update(value);
        }
    }

    pub fn remove_key(&mut self, key: &K) -> Option<V> {
        self.cache.borrow_mut().remove(key)
    }

    pub fn remove_keys<'k>(&mut self, keys: impl IntoIterator<Item = &'k K>) {
        for key in keys {
            self.remove_key(key);
        }
    }

    /// Removes the entry whose key `value` maps to.
    pub fn remove(&mut self, value: &V) -> Option<V> {
        let key = (self.key_selector)(value);
        self.remove_key(&key)
    }

    pub fn refresh(&mut self, key: &K) -> bool {
        self.cache.borrow_mut().refresh(key)
    }

    /// Refreshes every entry.
    pub fn refresh_all(&mut self) {
        let keys: Vec<K> = self.cache.borrow().keys().cloned().collect();
        for key in &keys {
            self.refresh(key);
        }
    }

    pub fn clear(&mut self) {
        self.cache.borrow_mut().clear();
    }

    /// Current value of `key`, including this edit's changes so far.
    pub fn lookup(&self, key: &K) -> Option<V> {
        self.cache.borrow().lookup(key).cloned()
    }

    pub fn count(&self) -> usize {
        self.cache.borrow().len()
    }

    // == Apply ==
    /// Applies one intent.
    pub fn apply(&mut self, intent: Intent<K, V>) {
        match intent {
            Intent::AddOrUpdate(value) => self.add_or_update(value),
            Intent::RemoveKey(key) => {
                self.remove_key(&key);
            }
            Intent::Refresh(key) => {
                self.refresh(&key);
            }
            Intent::Clear => self.clear(),
        }
    }
}
