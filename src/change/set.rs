//! Change Set Module
//!
//! An ordered batch of changes produced by one logical edit.

use std::slice;
use std::vec;

use crate::change::{Change, ChangeReason, ChangeSummary};

// == Change Set ==
/// Ordered changes from one atomic edit.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeSet<K, V> {
    changes: Vec<Change<K, V>>,
}

impl<K, V> ChangeSet<K, V> {
    pub fn new() -> Self {
        Self {
            changes: Vec::new(),
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            changes: Vec::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, change: Change<K, V>) {
        self.changes.push(change);
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn iter(&self) -> slice::Iter<'_, Change<K, V>> {
        self.changes.iter()
    }

    // == Counters ==
    /// Number of changes with the given reason.
    pub fn count_of(&self, reason: ChangeReason) -> usize {
        self.changes.iter().filter(|c| c.reason() == reason).count()
    }

    pub fn adds(&self) -> usize {
        self.count_of(ChangeReason::Add)
    }

    pub fn updates(&self) -> usize {
        self.count_of(ChangeReason::Update)
    }

    pub fn removes(&self) -> usize {
        self.count_of(ChangeReason::Remove)
    }

    pub fn refreshes(&self) -> usize {
        self.count_of(ChangeReason::Refresh)
    }

    pub fn moves(&self) -> usize {
        self.count_of(ChangeReason::Moved)
    }

    /// Per-reason counts for this batch.
    pub fn summary(&self) -> ChangeSummary {
        let mut summary = ChangeSummary::new();
        for change in &self.changes {
            summary.record(change.reason());
        }
        summary
    }
}

impl<K, V> Default for ChangeSet<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> FromIterator<Change<K, V>> for ChangeSet<K, V> {
    fn from_iter<I: IntoIterator<Item = Change<K, V>>>(iter: I) -> Self {
        Self {
            changes: iter.into_iter().collect(),
        }
    }
}

impl<K, V> IntoIterator for ChangeSet<K, V> {
    type Item = Change<K, V>;
    type IntoIter = vec::IntoIter<Change<K, V>>;

    fn into_iter(self) -> Self::IntoIter {
        self.changes.into_iter()
    }
}

impl<'a, K, V> IntoIterator for &'a ChangeSet<K, V> {
    type Item = &'a Change<K, V>;
    type IntoIter = slice::Iter<'a, Change<K, V>>;

    fn into_iter(self) -> Self::IntoIter {
        self.changes.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_by_reason() {
        let set: ChangeSet<u32, &str> = vec![
            Change::add(1, "a"),
            Change::add(2, "b"),
            Change::update(1, "c", "a"),
            Change::remove(2, "b"),
            Change::refresh(1, "c"),
        ]
        .into_iter()
        .collect();

        assert_eq!(set.len(), 5);
        assert_eq!(set.adds(), 2);
        assert_eq!(set.updates(), 1);
        assert_eq!(set.removes(), 1);
        assert_eq!(set.refreshes(), 1);
        assert_eq!(set.moves(), 0);
    }

    #[test]
    fn test_order_is_preserved() {
        let mut set = ChangeSet::new();
        set.push(Change::add("z", 1));
        set.push(Change::add("a", 2));
        let keys: Vec<_> = set.iter().map(|c| *c.key()).collect();
        assert_eq!(keys, vec!["z", "a"]);
    }
}
