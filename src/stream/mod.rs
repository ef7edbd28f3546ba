//! Stream Module
//!
//! Push-based change streams with explicit, RAII subscription handles.
//!
//! A [`ChangeStream`] is cold: every call to [`ChangeStream::subscribe`] runs
//! the stream's subscribe function for that observer. Delivery follows the
//! usual observer grammar: any number of `on_next` calls followed by at most
//! one terminal `on_error` or `on_completed`.

mod observer;
mod subscription;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::change::{Key, Value};
use crate::error::Result;
use crate::operators::expire::{self, Expiry};
use crate::operators::merge::{self, MergeOptions};
use crate::scheduler::Scheduler;

pub use observer::{FnObserver, Observer};
pub(crate) use observer::Sink;
pub use subscription::Subscription;

type SubscribeFn<K, V> = dyn Fn(Arc<dyn Observer<K, V>>) -> Subscription + Send + Sync;

// == Change Stream ==
/// A subscribable source of change batches.
pub struct ChangeStream<K, V> {
    subscribe_fn: Arc<SubscribeFn<K, V>>,
}

impl<K: Key, V: Value> ChangeStream<K, V> {
    /// Creates a stream from its subscribe function.
    ///
    /// The function is invoked once per subscriber and returns the handle
    /// that tears that subscription down.
    pub fn new<F>(subscribe_fn: F) -> Self
    where
        F: Fn(Arc<dyn Observer<K, V>>) -> Subscription + Send + Sync + 'static,
    {
        Self {
            subscribe_fn: Arc::new(subscribe_fn),
        }
    }

    /// A stream that completes immediately without emitting.
    pub fn empty() -> Self {
        Self::new(|observer| {
            observer.on_completed();
            Subscription::empty()
        })
    }

    // == Subscribe ==
    /// Subscribes an observer; the returned handle unsubscribes when dropped.
    pub fn subscribe<O>(&self, observer: O) -> Subscription
    where
        O: Observer<K, V> + 'static,
    {
        self.subscribe_arc(Arc::new(observer))
    }

    /// Subscribes an already shared observer.
    pub fn subscribe_arc(&self, observer: Arc<dyn Observer<K, V>>) -> Subscription {
        (self.subscribe_fn)(observer)
    }

    // == Operators ==
    /// See [`expire::expire_after`].
    pub fn expire_after<F>(
        &self,
        time_selector: F,
        polling_interval: Option<Duration>,
        scheduler: Arc<dyn Scheduler>,
    ) -> Result<ChangeStream<K, V>>
    where
        F: Fn(&V) -> anyhow::Result<Expiry> + Send + Sync + 'static,
    {
        expire::expire_after(self, time_selector, polling_interval, scheduler)
    }

    /// Treats this stream as the parents; see [`merge::merge_many_change_sets`].
    pub fn merge_many_change_sets<CK, C, F>(
        &self,
        child_factory: F,
        options: MergeOptions<V, C>,
    ) -> ChangeStream<CK, C>
    where
        CK: Key,
        C: Value,
        F: Fn(&V, &K) -> anyhow::Result<ChangeStream<CK, C>> + Send + Sync + 'static,
    {
        merge::merge_many_change_sets(self, child_factory, options)
    }
}

impl<K, V> Clone for ChangeStream<K, V> {
    fn clone(&self) -> Self {
        Self {
            subscribe_fn: Arc::clone(&self.subscribe_fn),
        }
    }
}

impl<K, V> fmt::Debug for ChangeStream<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeStream").finish_non_exhaustive()
    }
}
