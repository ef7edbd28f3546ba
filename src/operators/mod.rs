//! Operators Module
//!
//! Derived views over change streams.
//!
//! # Operators
//! - [`expire_after`]: per-item time-to-live
//! - [`merge_many_change_sets`]: dynamic fan-in with duplicate-key resolution

pub mod expire;
pub mod merge;

pub use expire::{expire_after, Expiry};
pub use merge::{merge_many_change_sets, Comparer, MergeOptions};
