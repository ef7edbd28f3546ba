//! Change Record Module
//!
//! Describes one mutation to one keyed item.

use serde::Serialize;

// == Change Reason ==
/// Why a change was emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ChangeReason {
    /// The key is new
    Add,
    /// The key's value was replaced; the change carries the previous value
    Update,
    /// The key is gone; the change carries the removed value
    Remove,
    /// The value mutated in place; downstream should re-evaluate it
    Refresh,
    /// The item changed position (index-aware consumers only)
    Moved,
}

// == Change ==
/// One mutation record.
///
/// `previous` is present if and only if the reason is [`ChangeReason::Update`];
/// the constructors are the only way to build a change, which keeps that
/// invariant intact.
#[derive(Debug, Clone, PartialEq)]
pub struct Change<K, V> {
    reason: ChangeReason,
    key: K,
    current: V,
    previous: Option<V>,
    current_index: Option<usize>,
    previous_index: Option<usize>,
}

impl<K, V> Change<K, V> {
    /// Creates an Add change.
    pub fn add(key: K, current: V) -> Self {
        Self::keyed(ChangeReason::Add, key, current)
    }

    /// Creates an Update change carrying the replaced value.
    pub fn update(key: K, current: V, previous: V) -> Self {
        Self {
            reason: ChangeReason::Update,
            key,
            current,
            previous: Some(previous),
            current_index: None,
            previous_index: None,
        }
    }

    /// Creates a Remove change; `removed` is the value that left the collection.
    pub fn remove(key: K, removed: V) -> Self {
        Self::keyed(ChangeReason::Remove, key, removed)
    }

    /// Creates a Refresh change.
    pub fn refresh(key: K, current: V) -> Self {
        Self::keyed(ChangeReason::Refresh, key, current)
    }

    /// Creates a Moved change between two positions.
    pub fn moved(key: K, current: V, current_index: usize, previous_index: usize) -> Self {
        Self {
            reason: ChangeReason::Moved,
            key,
            current,
            previous: None,
            current_index: Some(current_index),
            previous_index: Some(previous_index),
        }
    }

    fn keyed(reason: ChangeReason, key: K, current: V) -> Self {
        Self {
            reason,
            key,
            current,
            previous: None,
            current_index: None,
            previous_index: None,
        }
    }

    pub fn reason(&self) -> ChangeReason {
        self.reason
    }

    pub fn key(&self) -> &K {
        &self.key
    }

    /// The current value; for a Remove, the value that was removed.
    pub fn current(&self) -> &V {
        &self.current
    }

    pub fn previous(&self) -> Option<&V> {
        self.previous.as_ref()
    }

    pub fn current_index(&self) -> Option<usize> {
        self.current_index
    }

    pub fn previous_index(&self) -> Option<usize> {
        self.previous_index
    }

    /// Splits the change into its key and current value.
    pub fn into_parts(self) -> (K, V) {
        (self.key, self.current)
    }
}
