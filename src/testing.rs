//! Testing Utilities
//!
//! An observer that records everything a change stream delivers.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::change::{ChangeReason, ChangeSet, ChangeSummary, Key, Value};
use crate::error::StreamError;
use crate::stream::{ChangeStream, Observer, Subscription};

struct Recorded<K, V> {
    messages: Vec<ChangeSet<K, V>>,
    data: HashMap<K, V>,
    error: Option<StreamError>,
    completed: bool,
}

struct Recorder<K, V> {
    inner: Arc<Mutex<Recorded<K, V>>>,
}

impl<K: Key, V: Value> Observer<K, V> for Recorder<K, V> {
    fn on_next(&self, changes: &ChangeSet<K, V>) {
        let mut recorded = self.inner.lock();
        for change in changes {
            match change.reason() {
                ChangeReason::Add | ChangeReason::Update | ChangeReason::Refresh => {
                    recorded
                        .data
                        .insert(change.key().clone(), change.current().clone());
                }
                ChangeReason::Remove => {
                    recorded.data.remove(change.key());
                }
                ChangeReason::Moved => {}
            }
        }
        recorded.messages.push(changes.clone());
    }

    fn on_error(&self, error: &StreamError) {
        self.inner.lock().error = Some(error.clone());
    }

    fn on_completed(&self) {
        self.inner.lock().completed = true;
    }
}

// == Change Set Aggregator ==
/// Subscribes to a stream and keeps every batch, the state those batches
/// build up, and the terminal event.
///
/// ```
/// use reactive_cache::testing::ChangeSetAggregator;
/// use reactive_cache::SourceCache;
///
/// let cache = SourceCache::new(|v: &(u32, &str)| v.0);
/// let results = ChangeSetAggregator::new(&cache.connect());
///
/// cache.add_or_update((1, "one")).unwrap();
///
/// assert_eq!(results.messages().len(), 1);
/// assert_eq!(results.data().get(&1), Some(&(1, "one")));
/// ```
pub struct ChangeSetAggregator<K, V> {
    inner: Arc<Mutex<Recorded<K, V>>>,
    subscription: Mutex<Option<Subscription>>,
}

impl<K: Key, V: Value> ChangeSetAggregator<K, V> {
    pub fn new(stream: &ChangeStream<K, V>) -> Self {
        let inner = Arc::new(Mutex::new(Recorded {
            messages: Vec::new(),
            data: HashMap::new(),
            error: None,
            completed: false,
        }));
        let subscription = stream.subscribe(Recorder {
            inner: Arc::clone(&inner),
        });
        Self {
            inner,
            subscription: Mutex::new(Some(subscription)),
        }
    }

    /// Every batch received, in order.
    pub fn messages(&self) -> Vec<ChangeSet<K, V>> {
        self.inner.lock().messages.clone()
    }

    /// Downstream state reconstructed from the batches.
    pub fn data(&self) -> HashMap<K, V> {
        self.inner.lock().data.clone()
    }

    /// Counts over every batch received.
    pub fn summary(&self) -> ChangeSummary {
        let recorded = self.inner.lock();
        let mut summary = ChangeSummary::new();
        for batch in &recorded.messages {
            summary.merge(&batch.summary());
        }
        summary
    }

    pub fn error(&self) -> Option<StreamError> {
        self.inner.lock().error.clone()
    }

    pub fn is_completed(&self) -> bool {
        self.inner.lock().completed
    }

    /// Stops recording; later batches are not delivered.
    pub fn unsubscribe(&self) {
        let subscription = self.subscription.lock().take();
        drop(subscription);
    }
}
