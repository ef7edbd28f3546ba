//! Change Module
//!
//! The data model every other component speaks: single-key change records
//! grouped into ordered, atomic change batches.

mod record;
mod set;
mod summary;

use std::fmt::Debug;
use std::hash::Hash;

pub use record::{Change, ChangeReason};
pub use set::ChangeSet;
pub use summary::ChangeSummary;

// == Bounds ==
/// Bounds required of cache keys.
pub trait Key: Clone + Eq + Hash + Debug + Send + Sync + 'static {}

impl<T> Key for T where T: Clone + Eq + Hash + Debug + Send + Sync + 'static {}

/// Bounds required of cached values.
pub trait Value: Clone + Send + Sync + 'static {}

impl<T> Value for T where T: Clone + Send + Sync + 'static {}
