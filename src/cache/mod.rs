//! Cache Module
//!
//! Keyed change-tracking storage and the live, observable cache built on it.

mod source;
mod store;
mod updater;


// Re-export public types
pub(crate) use source::SourceShared;
pub use source::SourceCache;
pub use store::{ChangeAwareCache, Equality};
pub use updater::{CacheUpdater, Intent, KeySelector};
