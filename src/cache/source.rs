//! Source Cache Module
//!
//! The live cache: a thread-safe tracking cache that broadcasts every edit
//! to its subscribers as one change batch.

use std::cell::RefCell;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::ReentrantMutex;
use tracing::{debug, trace};

use crate::cache::{CacheUpdater, ChangeAwareCache, Intent, KeySelector};
use crate::change::{ChangeSet, Key, Value};
use crate::error::{CacheError, Result, StreamError};
use crate::operators::expire::{self, Expiry};
use crate::scheduler::Scheduler;
use crate::stream::{ChangeStream, Observer, Sink, Subscription};

// == Terminal ==
#[derive(Debug, Clone)]
enum Terminal {
    Completed,
    Failed(StreamError),
}

/// Subscriber bookkeeping, kept apart from the cache so that subscribing
/// and unsubscribing never contend with an edit's cache borrows.
struct Hub<K, V> {
    subscribers: Vec<(u64, Arc<Sink<K, V>>)>,
    /// Subscribed while an edit was open; they get the post-edit snapshot
    joining: Vec<(u64, Arc<Sink<K, V>>)>,
    next_id: u64,
    terminal: Option<Terminal>,
    editing: bool,
}

impl<K, V> Hub<K, V> {
    fn sinks(&self) -> Vec<Arc<Sink<K, V>>> {
        self.subscribers.iter().map(|(_, sink)| Arc::clone(sink)).collect()
    }
}

/// Closes the hub's edit window even if the edit closure unwinds.
struct OpenEdit<'a, K, V>(&'a RefCell<Hub<K, V>>);

impl<K, V> Drop for OpenEdit<'_, K, V> {
    fn drop(&mut self) {
        if let Ok(mut hub) = self.0.try_borrow_mut() {
            hub.editing = false;
        }
    }
}

struct SourceState<K, V> {
    cache: RefCell<ChangeAwareCache<K, V>>,
    hub: RefCell<Hub<K, V>>,
}

// == Source Shared ==
/// State shared between a [`SourceCache`] and the streams it hands out.
///
/// All mutation and all delivery happen while holding `state`'s re-entrant
/// lock, so subscribers see batches one at a time and in edit order, and may
/// call back into the cache from their callbacks.
pub(crate) struct SourceShared<K, V> {
    state: ReentrantMutex<SourceState<K, V>>,
    key_selector: KeySelector<K, V>,
}

impl<K: Key, V: Value> SourceShared<K, V> {
    /// Runs `f` inside the cache's serialization region.
    pub(crate) fn serialized<R>(&self, f: impl FnOnce() -> R) -> R {
        let _guard = self.state.lock();
        f()
    }

    pub(crate) fn edit<R>(&self, f: impl FnOnce(&mut CacheUpdater<'_, K, V>) -> R) -> Result<R> {
        let state = self.state.lock();
        {
            let mut hub = state.hub.borrow_mut();
            if hub.terminal.is_some() {
                return Err(CacheError::Terminated);
            }
            if hub.editing {
                return Err(CacheError::ReentrantEdit);
            }
            hub.editing = true;
        }

        let open = OpenEdit(&state.hub);
        let result = f(&mut CacheUpdater::new(&state.cache, &self.key_selector));
        drop(open);

        let (changes, sinks, joiners) = {
            let mut hub = state.hub.borrow_mut();
            let changes = state.cache.borrow_mut().capture_changes();
            let sinks = hub.sinks();
            let joining = std::mem::take(&mut hub.joining);
            let joiners: Vec<Arc<Sink<K, V>>> =
                joining.iter().map(|(_, sink)| Arc::clone(sink)).collect();
            hub.subscribers.extend(joining);
            (changes, sinks, joiners)
        };

        if !joiners.is_empty() {
            let snapshot = state.cache.borrow().snapshot();
            debug!(joined = joiners.len(), "Delivering snapshot to subscribers added mid-edit");
            for sink in joiners {
                sink.next(&snapshot);
            }
        }

        if !changes.is_empty() {
            trace!(
                changes = changes.len(),
                subscribers = sinks.len(),
                "Broadcasting edit"
            );
            for sink in sinks {
                sink.next(&changes);
            }
        }

        Ok(result)
    }

    pub(crate) fn connect(self: &Arc<Self>) -> ChangeStream<K, V> {
        let shared = Arc::clone(self);
        ChangeStream::new(move |observer| shared.subscribe(observer))
    }

    fn subscribe(self: &Arc<Self>, observer: Arc<dyn Observer<K, V>>) -> Subscription {
        let sink = Arc::new(Sink::new(observer));
        let state = self.state.lock();

        let registered = {
            let mut hub = state.hub.borrow_mut();
            match hub.terminal.clone() {
                Some(terminal) => Err(terminal),
                None => {
                    let id = hub.next_id;
                    hub.next_id += 1;
                    if hub.editing {
                        hub.joining.push((id, Arc::clone(&sink)));
                        Ok((id, None))
                    } else {
                        hub.subscribers.push((id, Arc::clone(&sink)));
                        Ok((id, Some(state.cache.borrow().snapshot())))
                    }
                }
            }
        };

        match registered {
            Err(Terminal::Completed) => {
                sink.complete();
                Subscription::empty()
            }
            Err(Terminal::Failed(error)) => {
                sink.error(&error);
                Subscription::empty()
            }
            Ok((id, snapshot)) => {
                if let Some(snapshot) = snapshot {
                    sink.next(&snapshot);
                }
                drop(state);

                let weak: Weak<Self> = Arc::downgrade(self);
                Subscription::new(move || {
                    sink.close();
                    if let Some(shared) = weak.upgrade() {
                        shared.unsubscribe(id);
                    }
                })
            }
        }
    }

    fn unsubscribe(&self, id: u64) {
        let state = self.state.lock();
        let mut hub = state.hub.borrow_mut();
        hub.subscribers.retain(|(sub_id, _)| *sub_id != id);
        hub.joining.retain(|(sub_id, _)| *sub_id != id);
    }

    fn terminate(&self, terminal: Terminal) -> Result<()> {
        let state = self.state.lock();
        let sinks = {
            let mut hub = state.hub.borrow_mut();
            if hub.editing {
                return Err(CacheError::ReentrantEdit);
            }
            if hub.terminal.is_some() {
                return Ok(());
            }
            hub.terminal = Some(terminal.clone());
            hub.subscribers
                .drain(..)
                .map(|(_, sink)| sink)
                .collect::<Vec<_>>()
        };

        debug!(subscribers = sinks.len(), "Source cache terminated");
        for sink in sinks {
            match &terminal {
                Terminal::Completed => sink.complete(),
                Terminal::Failed(error) => sink.error(error),
            }
        }
        Ok(())
    }

    fn is_terminated(&self) -> bool {
        self.state.lock().hub.borrow().terminal.is_some()
    }

    /// Reads the cache, including the changes of an edit still in progress.
    fn read<R>(&self, f: impl FnOnce(&ChangeAwareCache<K, V>) -> R) -> R {
        let state = self.state.lock();
        let cache = state.cache.borrow();
        f(&cache)
    }
}

// == Source Cache ==
/// A thread-safe, observable keyed collection.
///
/// Dropping the cache completes every subscriber.
pub struct SourceCache<K: Key, V: Value> {
    shared: Arc<SourceShared<K, V>>,
}

impl<K: Key, V: Value> SourceCache<K, V> {
    // == Constructor ==
    /// Creates a cache keyed by `key_selector`; re-adding an equal value is a no-op.
    pub fn new<F>(key_selector: F) -> Self
    where
        F: Fn(&V) -> K + Send + Sync + 'static,
        V: PartialEq,
    {
        Self::with_equality(key_selector, |a: &V, b: &V| a == b)
    }

    /// Creates a cache with a custom notion of "same value".
    pub fn with_equality<F, E>(key_selector: F, equality: E) -> Self
    where
        F: Fn(&V) -> K + Send + Sync + 'static,
        E: Fn(&V, &V) -> bool + Send + Sync + 'static,
    {
        Self::from_parts(
            Arc::new(key_selector),
            ChangeAwareCache::with_equality(Arc::new(equality)),
        )
    }

    /// Creates a cache where every add of an existing key is reported as an update.
    pub fn without_equality<F>(key_selector: F) -> Self
    where
        F: Fn(&V) -> K + Send + Sync + 'static,
    {
        Self::from_parts(Arc::new(key_selector), ChangeAwareCache::new())
    }

    fn from_parts(key_selector: KeySelector<K, V>, cache: ChangeAwareCache<K, V>) -> Self {
        let state = SourceState {
            cache: RefCell::new(cache),
            hub: RefCell::new(Hub {
                subscribers: Vec::new(),
                joining: Vec::new(),
                next_id: 0,
                terminal: None,
                editing: false,
            }),
        };
        Self {
            shared: Arc::new(SourceShared {
                state: ReentrantMutex::new(state),
                key_selector,
            }),
        }
    }

    // == Edit ==
    /// Applies every mutation made by `f` as one atomic batch.
    ///
    /// The batch is delivered to all subscribers before this returns.
    pub fn edit<R>(&self, f: impl FnOnce(&mut CacheUpdater<'_, K, V>) -> R) -> Result<R> {
        self.shared.edit(f)
    }

    /// Applies a batch of intents atomically.
    pub fn edit_batch(&self, intents: impl IntoIterator<Item = Intent<K, V>>) -> Result<()> {
        self.edit(|updater| {
            for intent in intents {
                updater.apply(intent);
            }
        })
    }

    pub fn add_or_update(&self, value: V) -> Result<()> {
        self.edit(|updater| updater.add_or_update(value))
    }

    pub fn add_or_update_many(&self, values: impl IntoIterator<Item = V>) -> Result<()> {
        self.edit(|updater| updater.add_or_update_many(values))
    }

    pub fn remove_key(&self, key: &K) -> Result<Option<V>> {
        self.edit(|updater| updater.remove_key(key))
    }

    pub fn remove(&self, value: &V) -> Result<Option<V>> {
        self.edit(|updater| updater.remove(value))
    }

    pub fn refresh(&self, key: &K) -> Result<bool> {
        self.edit(|updater| updater.refresh(key))
    }

    pub fn clear(&self) -> Result<()> {
        self.edit(|updater| updater.clear())
    }

    // == Connect ==
    /// Streams the current contents as one Add batch, then every later edit.
    pub fn connect(&self) -> ChangeStream<K, V> {
        self.shared.connect()
    }

    // == Terminal Signals ==
    /// Completes every subscriber; later edits return [`CacheError::Terminated`].
    pub fn complete(&self) -> Result<()> {
        self.shared.terminate(Terminal::Completed)
    }

    /// Fails every subscriber with `error`.
    pub fn fail(&self, error: impl Into<anyhow::Error>) -> Result<()> {
        self.shared
            .terminate(Terminal::Failed(StreamError::source(error)))
    }

    pub fn is_terminated(&self) -> bool {
        self.shared.is_terminated()
    }

    // == Expire After ==
    /// Removes items from this cache once their expiry elapses.
    ///
    /// Expiry is active while the returned stream is subscribed; it emits one
    /// Remove batch per sweep that removed something.
    pub fn expire_after<F>(
        &self,
        time_selector: F,
        polling_interval: Option<Duration>,
        scheduler: Arc<dyn Scheduler>,
    ) -> Result<ChangeStream<K, V>>
    where
        F: Fn(&V) -> anyhow::Result<Expiry> + Send + Sync + 'static,
    {
        expire::expire_source(
            Arc::clone(&self.shared),
            Arc::new(time_selector),
            polling_interval,
            scheduler,
        )
    }

    // == Reads ==
    pub fn lookup(&self, key: &K) -> Option<V> {
        self.shared.read(|cache| cache.lookup(key).cloned())
    }

    pub fn items(&self) -> Vec<V> {
        self.shared.read(|cache| cache.items().cloned().collect())
    }

    pub fn keys(&self) -> Vec<K> {
        self.shared.read(|cache| cache.keys().cloned().collect())
    }

    pub fn key_values(&self) -> Vec<(K, V)> {
        self.shared.read(|cache| {
            cache
                .key_values()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        })
    }

    pub fn count(&self) -> usize {
        self.shared.read(|cache| cache.len())
    }

    /// Current contents as an Add batch.
    pub fn snapshot(&self) -> ChangeSet<K, V> {
        self.shared.read(|cache| cache.snapshot())
    }
}

impl<K: Key, V: Value> Drop for SourceCache<K, V> {
    fn drop(&mut self) {
        let _ = self.shared.terminate(Terminal::Completed);
    }
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::{Change, ChangeReason};
    use crate::testing::ChangeSetAggregator;

    #[derive(Debug, Clone, PartialEq)]
    struct Item {
        id: u32,
        name: &'static str,
    }

    fn item(id: u32, name: &'static str) -> Item {
        Item { id, name }
    }

    fn cache() -> SourceCache<u32, Item> {
        SourceCache::new(|i: &Item| i.id)
    }

    #[test]
    fn test_connect_replays_current_contents() {
        let cache = cache();
        cache.add_or_update_many([item(1, "a"), item(2, "b")]).unwrap();

        let results = ChangeSetAggregator::new(&cache.connect());

        assert_eq!(results.messages().len(), 1);
        assert_eq!(results.messages()[0].adds(), 2);
        assert_eq!(results.data().len(), 2);
    }

    #[test]
    fn test_empty_cache_sends_no_initial_batch() {
        let cache = cache();
        let results = ChangeSetAggregator::new(&cache.connect());
        assert!(results.messages().is_empty());
    }

    #[test]
    fn test_one_batch_per_edit() {
        let cache = cache();
        let results = ChangeSetAggregator::new(&cache.connect());

        cache
            .edit(|updater| {
                updater.add_or_update(item(1, "a"));
                updater.add_or_update(item(2, "b"));
                updater.add_or_update(item(1, "c"));
                updater.remove_key(&2);
            })
            .unwrap();

        assert_eq!(results.messages().len(), 1);
        let batch: Vec<_> = results.messages()[0].clone().into_iter().collect();
        assert_eq!(batch, vec![Change::add(1, item(1, "c"))]);
    }

    #[test]
    fn test_equal_readd_is_silent() {
        let cache = cache();
        cache.add_or_update(item(1, "a")).unwrap();
        let results = ChangeSetAggregator::new(&cache.connect());

        cache.add_or_update(item(1, "a")).unwrap();

        assert_eq!(results.messages().len(), 1);
    }

    #[test]
    fn test_refresh_emits_refresh() {
        let cache = cache();
        cache.add_or_update(item(1, "a")).unwrap();
        let results = ChangeSetAggregator::new(&cache.connect());

        assert!(cache.refresh(&1).unwrap());
        assert!(!cache.refresh(&9).unwrap());

        assert_eq!(results.messages().len(), 2);
        assert_eq!(
            results.messages()[1].iter().next().map(|c| c.reason()),
            Some(ChangeReason::Refresh)
        );
    }

    #[test]
    fn test_edit_after_complete_is_rejected() {
        let cache = cache();
        let results = ChangeSetAggregator::new(&cache.connect());

        cache.complete().unwrap();

        assert!(results.is_completed());
        assert_eq!(cache.add_or_update(item(1, "a")), Err(CacheError::Terminated));
    }

    #[test]
    fn test_late_subscriber_gets_terminal_signal() {
        let cache = cache();
        cache.add_or_update(item(1, "a")).unwrap();
        cache.fail(anyhow::anyhow!("broken")).unwrap();

        let results = ChangeSetAggregator::new(&cache.connect());

        assert!(results.messages().is_empty());
        assert!(results.error().is_some());
        assert!(!results.is_completed());
    }

    #[test]
    fn test_reentrant_edit_is_rejected() {
        let cache = cache();
        let inner = cache.edit(|_| cache.add_or_update(item(1, "a"))).unwrap();
        assert_eq!(inner, Err(CacheError::ReentrantEdit));
    }

    #[test]
    fn test_panicking_edit_does_not_wedge_the_cache() {
        let cache = cache();
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            cache.edit(|_| panic!("edit closure failed"))
        }));
        assert!(outcome.is_err());

        assert_eq!(cache.add_or_update(item(1, "a")), Ok(()));
        assert_eq!(cache.count(), 1);
    }

    #[test]
    fn test_drop_completes_subscribers() {
        let cache = cache();
        let results = ChangeSetAggregator::new(&cache.connect());
        drop(cache);
        assert!(results.is_completed());
    }

    #[test]
    fn test_unsubscribed_observer_receives_nothing() {
        let cache = cache();
        let results = ChangeSetAggregator::new(&cache.connect());

        results.unsubscribe();
        cache.add_or_update(item(1, "a")).unwrap();

        assert!(results.messages().is_empty());
    }

    #[test]
    fn test_edit_batch_intents() {
        let cache = cache();
        cache
            .edit_batch([
                Intent::AddOrUpdate(item(1, "a")),
                Intent::AddOrUpdate(item(2, "b")),
                Intent::RemoveKey(1),
            ])
            .unwrap();

        assert_eq!(cache.keys(), vec![2]);
        assert_eq!(cache.lookup(&2), Some(item(2, "b")));
    }
}
