//! Duplicate-Key Registry
//!
//! For every child key: which parents currently contribute it, in the order
//! they first did, and which one of them is visible downstream.

use std::cmp::Ordering;
use std::collections::HashMap;

use crate::change::Key;

struct Candidates<PK> {
    /// Contributing parents in first-seen order
    order: Vec<PK>,
    /// None until resolved, or after the visible parent withdrew
    visible: Option<PK>,
}

/// Outcome of ranking one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Resolution<PK> {
    pub(crate) winner: PK,
    /// The winner differs from the previously visible candidate
    pub(crate) changed: bool,
}

// == Duplicate Registry ==
pub(crate) struct DuplicateRegistry<CK, PK> {
    keys: HashMap<CK, Candidates<PK>>,
}

impl<CK: Key, PK: Key> DuplicateRegistry<CK, PK> {
    pub(crate) fn new() -> Self {
        Self {
            keys: HashMap::new(),
        }
    }

    // == Register ==
    /// Records `parent` as a contributor of `key`; repeated calls are no-ops.
    pub(crate) fn register(&mut self, key: &CK, parent: &PK) {
        let candidates = self.keys.entry(key.clone()).or_insert_with(|| Candidates {
            order: Vec::new(),
            visible: None,
        });
        if !candidates.order.contains(parent) {
            candidates.order.push(parent.clone());
        }
    }

    // == Withdraw ==
    /// Drops `parent` as a contributor of `key`.
    ///
    /// Returns false once nobody contributes the key any more.
    pub(crate) fn withdraw(&mut self, key: &CK, parent: &PK) -> bool {
        let Some(candidates) = self.keys.get_mut(key) else {
            return false;
        };
        candidates.order.retain(|p| p != parent);
        if candidates.visible.as_ref() == Some(parent) {
            candidates.visible = None;
        }
        if candidates.order.is_empty() {
            self.keys.remove(key);
            return false;
        }
        true
    }

    // == Resolve ==
    /// Ranks the candidates of `key` and makes the best one visible.
    ///
    /// The lowest candidate under `compare` wins. Ties keep the visible
    /// candidate, then fall back to first-seen order.
    pub(crate) fn resolve(
        &mut self,
        key: &CK,
        compare: impl Fn(&PK, &PK) -> Ordering,
    ) -> Option<Resolution<PK>> {
        let candidates = self.keys.get_mut(key)?;

        let mut best = candidates.order.first()?;
        for candidate in candidates.order.iter().skip(1) {
            if compare(candidate, best) == Ordering::Less {
                best = candidate;
            }
        }
        if let Some(visible) = &candidates.visible {
            if visible != best && compare(visible, best) == Ordering::Equal {
                best = visible;
            }
        }

        let winner = best.clone();
        let changed = candidates.visible.as_ref() != Some(&winner);
        candidates.visible = Some(winner.clone());
        Some(Resolution { winner, changed })
    }

    #[cfg(test)]
    pub(crate) fn visible(&self, key: &CK) -> Option<&PK> {
        self.keys.get(key)?.visible.as_ref()
    }

    #[cfg(test)]
    pub(crate) fn candidate_count(&self, key: &CK) -> usize {
        self.keys.get(key).map_or(0, |candidates| candidates.order.len())
    }
}
