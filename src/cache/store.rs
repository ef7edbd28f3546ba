//! Change-Aware Cache Module
//!
//! Keyed storage that records the net effect of every mutation since the
//! last flush and hands it out as one change batch.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::change::{Change, ChangeSet, Key, Value};

/// Value equality used to suppress no-op updates.
pub type Equality<V> = Arc<dyn Fn(&V, &V) -> bool + Send + Sync>;

// == Pending Change ==
/// What happened to one key since the last flush.
#[derive(Debug)]
struct PendingChange<V> {
    /// Value visible before the buffer opened, None = key was absent
    origin: Option<V>,
    /// An add or update replaced the value at least once
    replaced: bool,
    /// A refresh was requested while the key was present
    refreshed: bool,
}

impl<V> PendingChange<V> {
    fn new(origin: Option<V>) -> Self {
        Self {
            origin,
            replaced: false,
            refreshed: false,
        }
    }
}

// == Change-Aware Cache ==
/// In-memory keyed storage with a pending-changes buffer.
///
/// Mutations are visible immediately through [`lookup`](Self::lookup);
/// [`capture_changes`](Self::capture_changes) turns everything that happened
/// since the previous capture into a batch with at most one change per key.
pub struct ChangeAwareCache<K, V> {
    /// Key-value storage
    data: HashMap<K, V>,
    /// Net mutation record per touched key
    pending: HashMap<K, PendingChange<V>>,
    /// Touched keys in first-touch order
    order: Vec<K>,
    /// Optional equality; equal re-adds are no-ops
    equality: Option<Equality<V>>,
}

impl<K: Key, V: Value> ChangeAwareCache<K, V> {
    // == Constructor ==
    /// Creates an empty cache where every add of an existing key is an update.
    pub fn new() -> Self {
        Self {
            data: HashMap::new(),
            pending: HashMap::new(),
            order: Vec::new(),
            equality: None,
        }
    }

    /// Creates an empty cache that ignores re-adds of an equal value.
    pub fn with_equality(equality: Equality<V>) -> Self {
        Self {
            equality: Some(equality),
            ..Self::new()
        }
    }

    // == Add Or Update ==
    /// Stores `value` under `key`.
    ///
    /// A no-op when an equality is configured and the stored value is equal.
    pub fn add_or_update(&mut self, key: K, value: V) {
        if let (Some(equality), Some(current)) = (&self.equality, self.data.get(&key)) {
            if equality(current, &value) {
                return;
            }
        }

        let previous = self.data.insert(key.clone(), value);
        self.track(key, previous).replaced = true;
    }

    // == Remove ==
    /// Removes `key`, returning its value; absent keys are a no-op.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        let removed = self.data.remove(key)?;
        self.track(key.clone(), Some(removed.clone()));
        Some(removed)
    }

    // == Refresh ==
    /// Marks `key` for re-evaluation downstream; absent keys are a no-op.
    pub fn refresh(&mut self, key: &K) -> bool {
        let Some(current) = self.data.get(key).cloned() else {
            return false;
        };
        self.track(key.clone(), Some(current)).refreshed = true;
        true
    }

    /// Replaces the stored value in place and marks it refreshed.
    ///
    /// Used where a source reports a refresh that carries a newer value.
    pub(crate) fn refresh_value(&mut self, key: &K, value: V) -> bool {
        let Some(slot) = self.data.get_mut(key) else {
            return false;
        };
        let before = std::mem::replace(slot, value);
        self.track(key.clone(), Some(before)).refreshed = true;
        true
    }

    // == Clear ==
    /// Removes every key.
    pub fn clear(&mut self) {
        let keys: Vec<K> = self.data.keys().cloned().collect();
        for key in keys {
            self.remove(&key);
        }
    }

    // == Capture Changes ==
    /// Flushes the pending buffer into one batch, in first-touch order.
    pub fn capture_changes(&mut self) -> ChangeSet<K, V> {
        let mut changes = ChangeSet::with_capacity(self.order.len());

        for key in self.order.drain(..) {
            let Some(pending) = self.pending.remove(&key) else {
                continue;
            };

            match (pending.origin, self.data.get(&key)) {
                (None, Some(current)) => changes.push(Change::add(key, current.clone())),
                (None, None) => {}
                (Some(origin), None) => changes.push(Change::remove(key, origin)),
                (Some(origin), Some(current)) => {
                    let unchanged = !pending.replaced
                        || self
                            .equality
                            .as_ref()
                            .is_some_and(|equality| equality(&origin, current));

                    if !unchanged {
                        changes.push(Change::update(key, current.clone(), origin));
                    } else if pending.refreshed {
                        changes.push(Change::refresh(key, current.clone()));
                    }
                }
            }
        }

        changes
    }

    // == Lookup ==
    pub fn lookup(&self, key: &K) -> Option<&V> {
        self.data.get(key)
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.data.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.data.keys()
    }

    pub fn items(&self) -> impl Iterator<Item = &V> {
        self.data.values()
    }

    pub fn key_values(&self) -> impl Iterator<Item = (&K, &V)> {
        self.data.iter()
    }

    // == Length ==
    /// Returns the current number of entries in the cache.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Whether anything is waiting to be captured.
    pub fn has_pending(&self) -> bool {
        !self.order.is_empty()
    }

    /// Current contents as an Add-only batch, without touching the buffer.
    pub fn snapshot(&self) -> ChangeSet<K, V> {
        self.data
            .iter()
            .map(|(key, value)| Change::add(key.clone(), value.clone()))
            .collect()
    }

    fn track(&mut self, key: K, origin: Option<V>) -> &mut PendingChange<V> {
        let order = &mut self.order;
        self.pending.entry(key).or_insert_with_key(|key| {
            order.push(key.clone());
            PendingChange::new(origin)
        })
    }
}

impl<K: Key, V: Value> Default for ChangeAwareCache<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Key, V: Value + fmt::Debug> fmt::Debug for ChangeAwareCache<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeAwareCache")
            .field("data", &self.data)
            .field("pending", &self.order.len())
            .finish()
    }
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::ChangeReason;

    fn distinct() -> ChangeAwareCache<&'static str, i32> {
        ChangeAwareCache::with_equality(Arc::new(|a: &i32, b: &i32| a == b))
    }

    #[test]
    fn test_cache_new() {
        let cache: ChangeAwareCache<&str, i32> = ChangeAwareCache::new();
        assert!(cache.is_empty());
        assert!(!cache.has_pending());
    }

    #[test]
    fn test_add_then_capture() {
        let mut cache = ChangeAwareCache::new();
        cache.add_or_update("a", 1);
        cache.add_or_update("b", 2);

        let changes = cache.capture_changes();
        assert_eq!(changes.len(), 2);
        assert_eq!(changes.adds(), 2);
        assert!(!cache.has_pending());
        assert_eq!(cache.lookup(&"a"), Some(&1));
    }

    #[test]
    fn test_update_carries_previous() {
        let mut cache = ChangeAwareCache::new();
        cache.add_or_update("a", 1);
        cache.capture_changes();

        cache.add_or_update("a", 2);
        cache.add_or_update("a", 3);
        let changes: Vec<_> = cache.capture_changes().into_iter().collect();

        assert_eq!(changes, vec![Change::update("a", 3, 1)]);
    }

    #[test]
    fn test_add_then_remove_nets_to_nothing() {
        let mut cache = ChangeAwareCache::new();
        cache.add_or_update("a", 1);
        cache.remove(&"a");

        assert!(cache.capture_changes().is_empty());
    }

    #[test]
    fn test_remove_then_add_nets_to_update() {
        let mut cache = ChangeAwareCache::new();
        cache.add_or_update("a", 1);
        cache.capture_changes();

        cache.remove(&"a");
        cache.add_or_update("a", 5);
        let changes: Vec<_> = cache.capture_changes().into_iter().collect();

        assert_eq!(changes, vec![Change::update("a", 5, 1)]);
    }

    #[test]
    fn test_update_then_remove_reports_original() {
        let mut cache = ChangeAwareCache::new();
        cache.add_or_update("a", 1);
        cache.capture_changes();

        cache.add_or_update("a", 2);
        cache.remove(&"a");
        let changes: Vec<_> = cache.capture_changes().into_iter().collect();

        assert_eq!(changes, vec![Change::remove("a", 1)]);
    }

    #[test]
    fn test_absent_remove_and_refresh_are_noops() {
        let mut cache: ChangeAwareCache<&str, i32> = ChangeAwareCache::new();
        assert!(cache.remove(&"missing").is_none());
        assert!(!cache.refresh(&"missing"));
        assert!(!cache.has_pending());
    }

    #[test]
    fn test_equal_readd_is_noop() {
        let mut cache = distinct();
        cache.add_or_update("a", 1);
        cache.capture_changes();

        cache.add_or_update("a", 1);
        assert!(!cache.has_pending());
        assert!(cache.capture_changes().is_empty());
    }

    #[test]
    fn test_update_back_to_origin_nets_to_nothing() {
        let mut cache = distinct();
        cache.add_or_update("a", 1);
        cache.capture_changes();

        cache.add_or_update("a", 2);
        cache.add_or_update("a", 1);
        assert!(cache.capture_changes().is_empty());
    }

    #[test]
    fn test_refresh_existing() {
        let mut cache = ChangeAwareCache::new();
        cache.add_or_update("a", 1);
        cache.capture_changes();

        assert!(cache.refresh(&"a"));
        let changes: Vec<_> = cache.capture_changes().into_iter().collect();
        assert_eq!(changes, vec![Change::refresh("a", 1)]);
    }

    #[test]
    fn test_refresh_is_absorbed_by_add_and_update() {
        let mut cache = ChangeAwareCache::new();
        cache.add_or_update("a", 1);
        cache.refresh(&"a");
        let changes = cache.capture_changes();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes.adds(), 1);

        cache.add_or_update("a", 2);
        cache.refresh(&"a");
        let changes = cache.capture_changes();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes.updates(), 1);
    }

    #[test]
    fn test_refresh_value_replaces_silently() {
        let mut cache = ChangeAwareCache::new();
        cache.add_or_update("a", 1);
        cache.capture_changes();

        assert!(cache.refresh_value(&"a", 7));
        let changes: Vec<_> = cache.capture_changes().into_iter().collect();
        assert_eq!(changes, vec![Change::refresh("a", 7)]);
        assert_eq!(cache.lookup(&"a"), Some(&7));
    }

    #[test]
    fn test_clear() {
        let mut cache = ChangeAwareCache::new();
        cache.add_or_update("a", 1);
        cache.add_or_update("b", 2);
        cache.capture_changes();

        cache.clear();
        let changes = cache.capture_changes();
        assert!(cache.is_empty());
        assert_eq!(changes.removes(), 2);
    }

    #[test]
    fn test_first_touch_order() {
        let mut cache = ChangeAwareCache::new();
        cache.add_or_update("b", 1);
        cache.add_or_update("a", 1);
        cache.add_or_update("b", 2);

        let reasons: Vec<_> = cache
            .capture_changes()
            .iter()
            .map(|c| (*c.key(), c.reason()))
            .collect();
        assert_eq!(reasons, vec![("b", ChangeReason::Add), ("a", ChangeReason::Add)]);
    }

    #[test]
    fn test_snapshot_leaves_buffer_alone() {
        let mut cache = ChangeAwareCache::new();
        cache.add_or_update("a", 1);

        let snapshot = cache.snapshot();
        assert_eq!(snapshot.adds(), 1);
        assert!(cache.has_pending());
    }
}
