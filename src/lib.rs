//! Reactive Cache - observable keyed collections
//!
//! Maintains keyed collections that publish every edit as a minimal, atomic
//! change batch, and composes them with time-based expiry and dynamic
//! fan-in merging.

pub mod cache;
pub mod change;
pub mod config;
pub mod error;
pub mod operators;
pub mod scheduler;
pub mod stream;
pub mod testing;

pub use cache::{CacheUpdater, ChangeAwareCache, Intent, SourceCache};
pub use change::{Change, ChangeReason, ChangeSet, ChangeSummary};
pub use config::Config;
pub use error::{CacheError, Result, StreamError};
pub use operators::{expire_after, merge_many_change_sets, Expiry, MergeOptions};
pub use scheduler::{Scheduler, TokioScheduler, VirtualScheduler};
pub use stream::{ChangeStream, FnObserver, Observer, Subscription};
