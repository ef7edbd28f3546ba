//! Stream Expiry
//!
//! Expiry applied to an arbitrary change stream. The operator mirrors what
//! it has forwarded downstream and emits synthetic Remove batches when
//! deadlines pass; the upstream source is never touched.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::ReentrantMutex;
use tracing::{debug, info, trace, warn};

use crate::change::{Change, ChangeReason, ChangeSet, Key, Value};
use crate::error::{Result, StreamError};
use crate::operators::expire::queue::ExpiryQueue;
use crate::operators::expire::timer::TimerSlot;
use crate::operators::expire::{validate_polling, Expiry, TimeSelector, OPERATOR};
use crate::scheduler::Scheduler;
use crate::stream::{ChangeStream, Observer, Sink, Subscription};

// == Expire After ==
/// Wraps `source` so every item leaves the stream once its expiry elapses.
///
/// With a polling interval, expirations are checked on that cadence and
/// every item due at or before a tick is removed by it. Without one, a
/// single timer tracks the nearest deadline.
///
/// Upstream completion is held back until nothing is left to expire.
pub fn expire_after<K, V, F>(
    source: &ChangeStream<K, V>,
    time_selector: F,
    polling_interval: Option<Duration>,
    scheduler: Arc<dyn Scheduler>,
) -> Result<ChangeStream<K, V>>
where
    K: Key,
    V: Value,
    F: Fn(&V) -> anyhow::Result<Expiry> + Send + Sync + 'static,
{
    validate_polling(polling_interval)?;
    let selector: TimeSelector<V> = Arc::new(time_selector);
    let source = source.clone();

    Ok(ChangeStream::new(move |observer| {
        StreamExpiry::start(
            &source,
            Arc::clone(&selector),
            polling_interval,
            Arc::clone(&scheduler),
            observer,
        )
    }))
}

struct ExpiryState<K, V> {
    /// What downstream currently holds
    items: HashMap<K, V>,
    queue: ExpiryQueue<K>,
    timer: TimerSlot,
    poller: Option<Subscription>,
    upstream: Option<Subscription>,
    upstream_completed: bool,
    terminated: bool,
}

impl<K: Key, V: Value> ExpiryState<K, V> {
    fn new() -> Self {
        Self {
            items: HashMap::new(),
            queue: ExpiryQueue::new(),
            timer: TimerSlot::new(),
            poller: None,
            upstream: None,
            upstream_completed: false,
            terminated: false,
        }
    }

    // == Apply Upstream ==
    /// Reconciles an upstream batch with the mirror and reschedules deadlines.
    fn apply(
        &mut self,
        changes: &ChangeSet<K, V>,
        selector: &TimeSelector<V>,
        now: DateTime<Utc>,
    ) -> std::result::Result<ChangeSet<K, V>, StreamError> {
        let mut forwarded = ChangeSet::with_capacity(changes.len());

        for change in changes {
            let key = change.key();
            match change.reason() {
                ChangeReason::Add | ChangeReason::Update => {
                    let current = change.current();
                    let expiry =
                        selector(current).map_err(|e| StreamError::callback(OPERATOR, e))?;
                    match expiry.deadline(now) {
                        Some(due) => {
                            trace!(key = ?key, %due, "Scheduled expiry");
                            self.queue.upsert(key.clone(), due);
                        }
                        None => {
                            self.queue.remove(key);
                        }
                    }

                    // An update for a key that already expired re-enters as an add
                    let change = match self.items.insert(key.clone(), current.clone()) {
                        Some(previous) => Change::update(key.clone(), current.clone(), previous),
                        None => Change::add(key.clone(), current.clone()),
                    };
                    forwarded.push(change);
                }
                ChangeReason::Remove => {
                    self.queue.remove(key);
                    if let Some(removed) = self.items.remove(key) {
                        forwarded.push(Change::remove(key.clone(), removed));
                    }
                }
                ChangeReason::Refresh => {
                    if let Some(slot) = self.items.get_mut(key) {
                        *slot = change.current().clone();
                        forwarded.push(Change::refresh(key.clone(), slot.clone()));
                    }
                }
                ChangeReason::Moved => {
                    if self.items.contains_key(key) {
                        forwarded.push(change.clone());
                    }
                }
            }
        }

        Ok(forwarded)
    }

    // == Sweep ==
    /// Removes everything due at or before `now`.
    fn sweep(&mut self, now: DateTime<Utc>) -> ChangeSet<K, V> {
        self.queue
            .take_due(now)
            .into_iter()
            .filter_map(|key| {
                let removed = self.items.remove(&key)?;
                Some(Change::remove(key, removed))
            })
            .collect()
    }

    fn should_complete(&self) -> bool {
        self.upstream_completed && self.queue.is_empty()
    }

    /// Marks the operator terminated and hands back everything to cancel.
    fn terminate(&mut self) -> Vec<Subscription> {
        self.terminated = true;
        self.queue = ExpiryQueue::new();
        [self.upstream.take(), self.poller.take(), self.timer.take()]
            .into_iter()
            .flatten()
            .collect()
    }
}

/// What a locked step decided to do once the lock is released.
enum Signal {
    Continue,
    Complete(Vec<Subscription>),
    Fail(StreamError, Vec<Subscription>),
}

struct StreamExpiry<K, V> {
    state: ReentrantMutex<RefCell<ExpiryState<K, V>>>,
    sink: Sink<K, V>,
    selector: TimeSelector<V>,
    scheduler: Arc<dyn Scheduler>,
    polling_interval: Option<Duration>,
}

impl<K: Key, V: Value> StreamExpiry<K, V> {
    fn start(
        source: &ChangeStream<K, V>,
        selector: TimeSelector<V>,
        polling_interval: Option<Duration>,
        scheduler: Arc<dyn Scheduler>,
        observer: Arc<dyn Observer<K, V>>,
    ) -> Subscription {
        let shared = Arc::new(Self {
            state: ReentrantMutex::new(RefCell::new(ExpiryState::new())),
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
                        shared.on_poll();
                    }
                }),
            );
            shared.state.lock().borrow_mut().poller = Some(poller);
        }

        let upstream = source.subscribe(Upstream {
            shared: Arc::clone(&shared),
        });
        let rejected = {
            let guard = shared.state.lock();
            let mut state = guard.borrow_mut();
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
        let teardown = {
            let guard = self.state.lock();
            let mut state = guard.borrow_mut();
            state.terminate()
        };
        drop(teardown);
    }

    fn arm_timer(self: &Arc<Self>, state: &mut ExpiryState<K, V>) {
        if self.polling_interval.is_some() {
            return;
        }
        let weak: Weak<Self> = Arc::downgrade(self);
        let next = state.queue.next_due();
        state.timer.arm(next, &*self.scheduler, move |generation| {
            Box::new(move || {
                if let Some(shared) = weak.upgrade() {
                    shared.on_timer(generation);
                }
            })
        });
    }

    // == Upstream Events ==
    fn on_upstream_next(self: &Arc<Self>, changes: &ChangeSet<K, V>) {
        let guard = self.state.lock();
        let now = self.scheduler.now();
        let step = {
            let mut state = guard.borrow_mut();
            if state.terminated {
                return;
            }
            match state.apply(changes, &self.selector, now) {
                Ok(forwarded) => {
                    self.arm_timer(&mut state);
                    Ok(forwarded)
                }
                Err(error) => Err((error, state.terminate())),
            }
        };

        match step {
            Ok(forwarded) => self.sink.next(&forwarded),
            Err((error, teardown)) => {
                warn!(error = %error, "Time selector failed, terminating expiry");
                self.finish(guard, Signal::Fail(error, teardown));
            }
        }
    }

    fn on_upstream_error(&self, error: &StreamError) {
        let guard = self.state.lock();
        let teardown = {
            let mut state = guard.borrow_mut();
            if state.terminated {
                return;
            }
            state.terminate()
        };
        self.finish(guard, Signal::Fail(error.clone(), teardown));
    }

    fn on_upstream_completed(&self) {
        let guard = self.state.lock();
        let signal = {
            let mut state = guard.borrow_mut();
            if state.terminated {
                return;
            }
            state.upstream_completed = true;
            if state.should_complete() {
                Signal::Complete(state.terminate())
            } else {
                debug!(
                    pending = state.queue.len(),
                    "Upstream completed, waiting for pending expirations"
                );
                Signal::Continue
            }
        };
        self.finish(guard, signal);
    }

    // == Timer Events ==
    fn on_timer(self: &Arc<Self>, generation: u64) {
        let guard = self.state.lock();
        let (removed, signal) = {
            let mut state = guard.borrow_mut();
            if state.terminated || !state.timer.claim(generation) {
                return;
            }
            self.sweep(&mut state)
        };
        self.sink.next(&removed);
        self.finish(guard, signal);
    }

    fn on_poll(self: &Arc<Self>) {
        let guard = self.state.lock();
        let (removed, signal) = {
            let mut state = guard.borrow_mut();
            if state.terminated {
                return;
            }
            self.sweep(&mut state)
        };
        self.sink.next(&removed);
        self.finish(guard, signal);
    }

    fn sweep(self: &Arc<Self>, state: &mut ExpiryState<K, V>) -> (ChangeSet<K, V>, Signal) {
        let removed = state.sweep(self.scheduler.now());
        if !removed.is_empty() {
            debug!(removed = removed.len(), "Expired items");
        }
        self.arm_timer(state);

        let signal = if state.should_complete() {
            Signal::Complete(state.terminate())
        } else {
            Signal::Continue
        };
        (removed, signal)
    }

    /// Delivers a terminal event, then cancels resources after the lock is released.
    fn finish<G>(&self, guard: G, signal: Signal) {
        let teardown = match signal {
            Signal::Continue => return,
            Signal::Complete(teardown) => {
                info!("Expiry stream completed");
                self.sink.complete();
                teardown
            }
            Signal::Fail(error, teardown) => {
                self.sink.error(&error);
                teardown
            }
        };
        drop(guard);
        drop(teardown);
    }
}

struct Upstream<K, V> {
    shared: Arc<StreamExpiry<K, V>>,
}

impl<K: Key, V: Value> Observer<K, V> for Upstream<K, V> {
    fn on_next(&self, changes: &ChangeSet<K, V>) {
        self.shared.on_upstream_next(changes);
    }

    fn on_error(&self, error: &StreamError) {
        self.shared.on_upstream_error(error);
    }

    fn on_completed(&self) {
        self.shared.on_upstream_completed();
    }
}
