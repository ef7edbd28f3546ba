//! Expiry Queue Module
//!
//! Pending deadlines ordered by time, at most one per key.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};

use crate::change::Key;
use crate::operators::expire::deadline::is_due;

// == Expiry Queue ==
/// Time-ordered pending expirations.
///
/// Keys due at the same instant share a bucket and come out in the order
/// they were scheduled.
#[derive(Debug)]
pub(crate) struct ExpiryQueue<K> {
    by_key: HashMap<K, DateTime<Utc>>,
    by_due: BTreeMap<DateTime<Utc>, Vec<K>>,
}

impl<K: Key> ExpiryQueue<K> {
    pub(crate) fn new() -> Self {
        Self {
            by_key: HashMap::new(),
            by_due: BTreeMap::new(),
        }
    }

    // == Upsert ==
    /// Schedules `key` at `due`, replacing any earlier entry for it.
    pub(crate) fn upsert(&mut self, key: K, due: DateTime<Utc>) {
        if let Some(previous) = self.by_key.insert(key.clone(), due) {
            if previous == due {
                return;
            }
            self.unlink(&key, previous);
        }
        self.by_due.entry(due).or_default().push(key);
    }

    // == Remove ==
    pub(crate) fn remove(&mut self, key: &K) -> Option<DateTime<Utc>> {
        let due = self.by_key.remove(key)?;
        self.unlink(key, due);
        Some(due)
    }

    // == Take Due ==
    /// Removes and returns every key whose deadline is at or before `now`.
    pub(crate) fn take_due(&mut self, now: DateTime<Utc>) -> Vec<K> {
        let mut expired = Vec::new();
        while let Some(entry) = self.by_due.first_entry() {
            if !is_due(*entry.key(), now) {
                break;
            }
            for key in entry.remove() {
                self.by_key.remove(&key);
                expired.push(key);
            }
        }
        expired
    }

    /// Earliest pending deadline.
    pub(crate) fn next_due(&self) -> Option<DateTime<Utc>> {
        self.by_due.keys().next().copied()
    }

    #[cfg(test)]
    pub(crate) fn deadline(&self, key: &K) -> Option<DateTime<Utc>> {
        self.by_key.get(key).copied()
    }

    pub(crate) fn len(&self) -> usize {
        self.by_key.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    fn unlink(&mut self, key: &K, due: DateTime<Utc>) {
        if let Some(bucket) = self.by_due.get_mut(&due) {
            bucket.retain(|k| k != key);
            if bucket.is_empty() {
                self.by_due.remove(&due);
            }
        }
    }
}
