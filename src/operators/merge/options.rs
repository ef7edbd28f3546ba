//! Merge Options Module

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use crate::cache::Equality;

/// Ranks two values; the lesser one wins.
pub type Comparer<T> = Arc<dyn Fn(&T, &T) -> Ordering + Send + Sync>;

// == Merge Options ==
/// How [`merge_many_change_sets`](super::merge_many_change_sets) resolves
/// child keys contributed by more than one parent.
///
/// With no ordering at all, the first parent to contribute a key keeps it
/// until its contribution disappears.
pub struct MergeOptions<P, C> {
    pub(crate) parent_ordering: Option<Comparer<P>>,
    pub(crate) child_ordering: Option<Comparer<C>>,
    pub(crate) value_equality: Option<Equality<C>>,
    pub(crate) resort_on_parent_refresh: bool,
}

impl<P, C> MergeOptions<P, C> {
    pub fn new() -> Self {
        Self {
            parent_ordering: None,
            child_ordering: None,
            value_equality: None,
            resort_on_parent_refresh: false,
        }
    }

    /// Ranks candidates by their parents first.
    pub fn parent_ordering<F>(mut self, compare: F) -> Self
    where
        F: Fn(&P, &P) -> Ordering + Send + Sync + 'static,
    {
        self.parent_ordering = Some(Arc::new(compare));
        self
    }

    /// Breaks parent ties by the child values themselves.
    pub fn child_ordering<F>(mut self, compare: F) -> Self
    where
        F: Fn(&C, &C) -> Ordering + Send + Sync + 'static,
    {
        self.child_ordering = Some(Arc::new(compare));
        self
    }

    /// Suppresses updates whose new visible value equals the old one.
    pub fn value_equality<F>(mut self, equal: F) -> Self
    where
        F: Fn(&C, &C) -> bool + Send + Sync + 'static,
    {
        self.value_equality = Some(Arc::new(equal));
        self
    }

    /// Re-ranks a parent's keys when the parent is refreshed.
    pub fn resort_on_parent_refresh(mut self, enabled: bool) -> Self {
        self.resort_on_parent_refresh = enabled;
        self
    }
}

impl<P, C> Default for MergeOptions<P, C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P, C> Clone for MergeOptions<P, C> {
    fn clone(&self) -> Self {
        Self {
            parent_ordering: self.parent_ordering.clone(),
            child_ordering: self.child_ordering.clone(),
            value_equality: self.value_equality.clone(),
            resort_on_parent_refresh: self.resort_on_parent_refresh,
        }
    }
}

impl<P, C> fmt::Debug for MergeOptions<P, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MergeOptions")
            .field("parent_ordering", &self.parent_ordering.is_some())
            .field("child_ordering", &self.child_ordering.is_some())
            .field("value_equality", &self.value_equality.is_some())
            .field("resort_on_parent_refresh", &self.resort_on_parent_refresh)
            .finish()
    }
}
