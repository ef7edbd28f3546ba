//! Source Expiry
//!
//! Expiry applied to a [`SourceCache`](crate::cache::SourceCache): due items
//! are removed from the cache itself, so every subscriber of the cache sees
//! the removal, and the returned stream reports what each sweep removed.

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::cache::SourceShared;
use crate::change::{Change, ChangeReason, ChangeSet, Key, Value};
use crate::error::{Result, StreamError};
use crate::operators::expire::queue::ExpiryQueue;
use crate::operators::expire::timer::TimerSlot;
use crate::operators::expire::{validate_polling, TimeSelector, OPERATOR};
use crate::scheduler::Scheduler;
use crate::stream::{ChangeStream, Observer, Sink, Subscription};

pub(crate) fn expire_source<K: Key, V: Value>(
    cache: Arc<SourceShared<K, V>>,
    selector: TimeSelector<V>,
    polling_interval: Option<Duration>,
    scheduler: Arc<dyn Scheduler>,
) -> Result<ChangeStream<K, V>> {
    validate_polling(polling_interval)?;

    Ok(ChangeStream::new(move |observer| {
        SourceExpiry::start(
            &cache,
            Arc::clone(&selector),
            polling_interval,
            Arc::clone(&scheduler),
            observer,
        )
    }))
}

struct TrackerState<K> {
    queue: ExpiryQueue<K>,
    timer: TimerSlot,
    poller: Option<Subscription>,
    upstream: Option<Subscription>,
    terminated: bool,
}

impl<K: Key> TrackerState<K> {
    fn terminate(&mut self) -> Vec<Subscription> {
        self.terminated = true;
        self.queue = ExpiryQueue::new();
        [self.upstream.take(), self.poller.take(), self.timer.take()]
            .into_iter()
            .flatten()
            .collect()
    }
}

// == Source Expiry ==
/// Tracks deadlines for the items of one cache.
///
/// The tracker is fed by its own subscription to the cache, and every sweep
/// runs inside the cache's serialization region so it never interleaves
/// with an edit.
struct SourceExpiry<K, V> {
    cache: Weak<SourceShared<K, V>>,
    state: Mutex<TrackerState<K>>,
    sink: Sink<K, V>,
    selector: TimeSelector<V>,
    scheduler: Arc<dyn Scheduler>,
    polling_interval: Option<Duration>,
}

impl<K: Key, V: Value> SourceExpiry<K, V> {
    fn start(
        cache: &Arc<SourceShared<K, V>>,
        selector: TimeSelector<V>,
        polling_interval: Option<Duration>,
        scheduler: Arc<dyn Scheduler>,
        observer: Arc<dyn Observer<K, V>>,
    ) -> Subscription {
        let shared = Arc::new(Self {
            cache: Arc::downgrade(cache),
            state: Mutex::new(TrackerState {
                queue: ExpiryQueue::new(),
                timer: TimerSlot::new(),
                poller: None,
                upstream: None,
                terminated: false,
            }),
            sink: Sink::new(observer),
            selector,
            scheduler,
            polling_interval,
        });

        if let Some(interval) = polling_interval {
            let weak = Arc::downgrade(&shared);
            let poller = shared.scheduler.schedule_periodic(
                interval,
                Box::new(move || {
                    if let Some(shared) = weak.upgrade() {
                        shared.on_sweep(None);
                    }
                }),
            );
            shared.state.lock().poller = Some(poller);
        }

        let upstream = cache.connect().subscribe(Tracker {
            shared: Arc::clone(&shared),
        });
        let rejected = {
            let mut state = shared.state.lock();
            if state.terminated {
                Some(upstream)
            } else {
                state.upstream = Some(upstream);
                None
            }
        };
        drop(rejected);

        Subscription::new(move || shared.dispose())
    }

    fn dispose(&self) {
        self.sink.close();
        let teardown = match self.cache.upgrade() {
            Some(cache) => cache.serialized(|| self.state.lock().terminate()),
            None => self.state.lock().terminate(),
        };
        drop(teardown);
    }

    fn arm_timer(self: &Arc<Self>, state: &mut TrackerState<K>) {
        if self.polling_interval.is_some() {
            return;
        }
        let weak: Weak<Self> = Arc::downgrade(self);
        let next = state.queue.next_due();
        state.timer.arm(next, &*self.scheduler, move |generation| {
            Box::new(move || {
                if let Some(shared) = weak.upgrade() {
                    shared.on_sweep(Some(generation));
                }
            })
        });
    }

    // == Cache Events ==
    /// Runs under the cache's lock as part of an edit's broadcast.
    fn on_cache_changes(self: &Arc<Self>, changes: &ChangeSet<K, V>) {
        let now = self.scheduler.now();
        let failure = {
            let mut state = self.state.lock();
            if state.terminated {
                return;
            }

            let mut failure = None;
            for change in changes {
                let key = change.key();
                match change.reason() {
                    ChangeReason::Add | ChangeReason::Update => {
                        match (self.selector)(change.current()) {
                            Ok(expiry) => match expiry.deadline(now) {
                                Some(due) => {
                                    trace!(key = ?key, %due, "Scheduled expiry");
                                    state.queue.upsert(key.clone(), due);
                                }
                                None => {
                                    state.queue.remove(key);
                                }
                            },
                            Err(e) => {
                                failure = Some(StreamError::callback(OPERATOR, e));
                                break;
                            }
                        }
                    }
                    ChangeReason::Remove => {
                        state.queue.remove(key);
                    }
                    ChangeReason::Refresh | ChangeReason::Moved => {}
                }
            }

            match failure {
                Some(error) => Some((error, state.terminate())),
                None => {
                    self.arm_timer(&mut state);
                    None
                }
            }
        };

        if let Some((error, teardown)) = failure {
            warn!(error = %error, "Time selector failed, terminating expiry");
            self.sink.error(&error);
            drop(teardown);
        }
    }

    fn on_cache_terminated(&self, error: Option<&StreamError>) {
        let teardown = {
            let mut state = self.state.lock();
            if state.terminated {
                return;
            }
            state.terminate()
        };
        match error {
            Some(error) => self.sink.error(error),
            None => self.sink.complete(),
        }
        drop(teardown);
    }

    // == Sweep ==
    /// Removes due items from the cache; `generation` is set for timer firings.
    fn on_sweep(self: &Arc<Self>, generation: Option<u64>) {
        let Some(cache) = self.cache.upgrade() else {
            return;
        };

        cache.serialized(|| {
            let due = {
                let mut state = self.state.lock();
                if state.terminated {
                    return;
                }
                if let Some(generation) = generation {
                    if !state.timer.claim(generation) {
                        return;
                    }
                }
                state.queue.take_due(self.scheduler.now())
            };

            if !due.is_empty() {
                let removal = cache.edit(|updater| {
                    due.iter()
                        .filter_map(|key| {
                            let removed = updater.remove_key(key)?;
                            Some(Change::remove(key.clone(), removed))
                        })
                        .collect::<ChangeSet<K, V>>()
                });
                match removal {
                    Ok(removed) => {
                        debug!(removed = removed.len(), "Expired items removed from cache");
                        self.sink.next(&removed);
                    }
                    Err(error) => {
                        debug!(error = %error, "Cache rejected expiry removal");
                    }
                }
            }

            let mut state = self.state.lock();
            if !state.terminated {
                self.arm_timer(&mut state);
            }
        });
    }
}

struct Tracker<K, V> {
    shared: Arc<SourceExpiry<K, V>>,
}

impl<K: Key, V: Value> Observer<K, V> for Tracker<K, V> {
    fn on_next(&self, changes: &ChangeSet<K, V>) {
        self.shared.on_cache_changes(changes);
    }

    fn on_error(&self, error: &StreamError) {
        self.shared.on_cache_terminated(Some(error));
    }

    fn on_completed(&self) {
        self.shared.on_cache_terminated(None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::SourceCache;
    use crate::operators::expire::Expiry;
    use crate::scheduler::VirtualScheduler;
    use crate::testing::ChangeSetAggregator;

    fn ms(value: u64) -> Duration {
        Duration::from_millis(value)
    }

    fn cache() -> SourceCache<u32, (u32, u64)> {
        SourceCache::new(|v: &(u32, u64)| v.0)
    }

    fn ttl_of(value: &(u32, u64)) -> anyhow::Result<Expiry> {
        Ok(Expiry::After(ms(value.1)))
    }

    #[test]
    fn test_expired_items_leave_the_cache() {
        let scheduler = Arc::new(VirtualScheduler::new());
        let cache = cache();
        let everything = ChangeSetAggregator::new(&cache.connect());
        let expiry = cache.expire_after(ttl_of, None, scheduler.clone()).unwrap();
        let removals = ChangeSetAggregator::new(&expiry);

        cache.add_or_update_many([(1, 10), (2, 20)]).unwrap();
        scheduler.advance_by(ms(10));

        assert_eq!(cache.keys(), vec![2]);
        assert_eq!(removals.messages().len(), 1);
        assert_eq!(removals.messages()[0].removes(), 1);
        assert_eq!(everything.summary().removes, 1);
    }

    #[test]
    fn test_cache_completion_forwards_immediately() {
        let scheduler = Arc::new(VirtualScheduler::new());
        let cache = cache();
        let expiry = cache.expire_after(ttl_of, None, scheduler.clone()).unwrap();
        let removals = ChangeSetAggregator::new(&expiry);

        cache.add_or_update((1, 10)).unwrap();
        cache.complete().unwrap();

        assert!(removals.is_completed());
        assert_eq!(scheduler.pending(), 0);
    }

    #[test]
    fn test_manual_remove_cancels_expiry() {
        let scheduler = Arc::new(VirtualScheduler::new());
        let cache = cache();
        let expiry = cache.expire_after(ttl_of, None, scheduler.clone()).unwrap();
        let removals = ChangeSetAggregator::new(&expiry);

        cache.add_or_update((1, 10)).unwrap();
        cache.remove_key(&1).unwrap();
        scheduler.advance_by(ms(50));

        assert!(removals.messages().is_empty());
    }

    #[test]
    fn test_existing_items_are_tracked_on_subscribe() {
        let scheduler = Arc::new(VirtualScheduler::new());
        let cache = cache();
        cache.add_or_update((7, 5)).unwrap();

        let expiry = cache.expire_after(ttl_of, None, scheduler.clone()).unwrap();
        let _removals = ChangeSetAggregator::new(&expiry);
        scheduler.advance_by(ms(5));

        assert_eq!(cache.count(), 0);
    }
}
