//! Merge Operator State Machine
//!
//! One instance per subscriber. Parent batches add, replace and withdraw
//! child subscriptions; child batches feed the duplicate-key registry; the
//! downstream view is a [`ChangeAwareCache`] whose captured changes are the
//! output batches.

use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};

use parking_lot::ReentrantMutex;
use tracing::{debug, info, trace, warn};

use crate::cache::ChangeAwareCache;
use crate::change::{ChangeReason, ChangeSet, Key, Value};
use crate::error::StreamError;
use crate::operators::merge::registry::DuplicateRegistry;
use crate::operators::merge::{MergeOptions, OPERATOR};
use crate::stream::{ChangeStream, Observer, Sink, Subscription};

/// Builds the child stream of one parent.
pub(crate) type ChildFactory<P, PK, CK, C> =
    Arc<dyn Fn(&P, &PK) -> anyhow::Result<ChangeStream<CK, C>> + Send + Sync>;

struct ParentEntry<P, CK, C> {
    value: P,
    /// What this parent's child stream currently holds
    items: HashMap<CK, C>,
    subscription: Option<Subscription>,
    completed: bool,
    /// Distinguishes this subscription from earlier ones of the same parent
    generation: u64,
}

/// A child stream to subscribe once the lock is released.
struct PendingChild<PK, P> {
    key: PK,
    value: P,
    generation: u64,
}

enum Terminal {
    Completed,
    Failed(StreamError),
}

/// Output of one locked step, delivered in this order.
struct Emission<CK, C> {
    changes: ChangeSet<CK, C>,
    terminal: Option<Terminal>,
    teardown: Vec<Subscription>,
}

impl<CK, C> Emission<CK, C> {
    fn batch(changes: ChangeSet<CK, C>) -> Self {
        Self {
            changes,
            terminal: None,
            teardown: Vec::new(),
        }
    }
}

// == Merge State ==
struct MergeState<PK, P, CK, C> {
    parents: HashMap<PK, ParentEntry<P, CK, C>>,
    registry: DuplicateRegistry<CK, PK>,
    /// Downstream view; capturing it yields the next output batch
    result: ChangeAwareCache<CK, C>,
    next_generation: u64,
    parent_subscription: Option<Subscription>,
    parent_completed: bool,
    terminated: bool,
    /// Thread running a parent batch; child snapshots it triggers join that batch
    deferred_flush: Option<ThreadId>,
}

/// Ranks two candidate parents for `key`.
fn rank<PK: Key, P, CK: Key, C>(
    parents: &HashMap<PK, ParentEntry<P, CK, C>>,
    options: &MergeOptions<P, C>,
    key: &CK,
    a: &PK,
    b: &PK,
) -> Ordering {
    let (Some(a), Some(b)) = (parents.get(a), parents.get(b)) else {
        return Ordering::Equal;
    };
    let by_parent = options
        .parent_ordering
        .as_ref()
        .map_or(Ordering::Equal, |compare| compare(&a.value, &b.value));

    by_parent.then_with(|| {
        match (&options.child_ordering, a.items.get(key), b.items.get(key)) {
            (Some(compare), Some(x), Some(y)) => compare(x, y),
            _ => Ordering::Equal,
        }
    })
}

impl<PK: Key, P: Value, CK: Key, C: Value> MergeState<PK, P, CK, C> {
    fn new(options: &MergeOptions<P, C>) -> Self {
        let result = match &options.value_equality {
            Some(equality) => ChangeAwareCache::with_equality(Arc::clone(equality)),
            None => ChangeAwareCache::new(),
        };
        Self {
            parents: HashMap::new(),
            registry: DuplicateRegistry::new(),
            result,
            next_generation: 0,
            parent_subscription: None,
            parent_completed: false,
            terminated: false,
            deferred_flush: None,
        }
    }

    fn is_current(&self, parent: &PK, generation: u64) -> bool {
        self.parents
            .get(parent)
            .is_some_and(|entry| entry.generation == generation)
    }

    // == Resolution ==
    /// Re-ranks `key` and publishes the winner when it changed, or when the
    /// winner is the parent whose contribution was just touched.
    fn reconcile(&mut self, options: &MergeOptions<P, C>, key: &CK, touched: Option<&PK>) {
        let Self {
            parents,
            registry,
            result,
            ..
        } = self;

        let Some(resolution) = registry.resolve(key, |a, b| rank(parents, options, key, a, b))
        else {
            result.remove(key);
            return;
        };

        if resolution.changed || touched == Some(&resolution.winner) {
            let value = parents
                .get(&resolution.winner)
                .and_then(|entry| entry.items.get(key));
            if let Some(value) = value {
                trace!(key = ?key, parent = ?resolution.winner, "Publishing candidate");
                result.add_or_update(key.clone(), value.clone());
            }
        }
    }

    // == Child Changes ==
    fn apply_child(&mut self, options: &MergeOptions<P, C>, parent: &PK, changes: &ChangeSet<CK, C>) {
        for change in changes {
            let key = change.key();
            match change.reason() {
                ChangeReason::Add | ChangeReason::Update => {
                    self.contribute(options, parent, key, change.current())
                }
                ChangeReason::Remove => self.withdraw(options, parent, key),
                ChangeReason::Refresh => self.refresh_child(options, parent, key, change.current()),
                ChangeReason::Moved => {}
            }
        }
    }

    fn contribute(&mut self, options: &MergeOptions<P, C>, parent: &PK, key: &CK, value: &C) {
        let Some(entry) = self.parents.get_mut(parent) else {
            return;
        };
        entry.items.insert(key.clone(), value.clone());
        self.registry.register(key, parent);
        self.reconcile(options, key, Some(parent));
    }

    fn withdraw(&mut self, options: &MergeOptions<P, C>, parent: &PK, key: &CK) {
        let removed = self
            .parents
            .get_mut(parent)
            .and_then(|entry| entry.items.remove(key));
        if removed.is_none() {
            return;
        }
        self.registry.withdraw(key, parent);
        self.reconcile(options, key, None);
    }

    fn refresh_child(&mut self, options: &MergeOptions<P, C>, parent: &PK, key: &CK, value: &C) {
        let Some(slot) = self
            .parents
            .get_mut(parent)
            .and_then(|entry| entry.items.get_mut(key))
        else {
            return;
        };
        *slot = value.clone();

        let Self {
            parents,
            registry,
            result,
            ..
        } = self;
        let Some(resolution) = registry.resolve(key, |a, b| rank(parents, options, key, a, b))
        else {
            return;
        };

        if resolution.changed {
            let promoted = parents
                .get(&resolution.winner)
                .and_then(|entry| entry.items.get(key));
            if let Some(promoted) = promoted {
                result.add_or_update(key.clone(), promoted.clone());
            }
        } else if resolution.winner == *parent {
            result.refresh_value(key, value.clone());
        }
    }

    // == Parent Changes ==
    /// Applies a parent batch, returning the child streams to subscribe.
    ///
    /// Subscriptions of replaced or removed parents go to `graveyard`.
    fn apply_parents(
        &mut self,
        options: &MergeOptions<P, C>,
        changes: &ChangeSet<PK, P>,
        graveyard: &mut Vec<Subscription>,
    ) -> Vec<PendingChild<PK, P>> {
        let mut pending: Vec<PendingChild<PK, P>> = Vec::new();

        for change in changes {
            let key = change.key();
            match change.reason() {
                ChangeReason::Add | ChangeReason::Update => {
                    pending.retain(|child| child.key != *key);
                    if let Some(subscription) = self.withdraw_parent(options, key) {
                        debug!(parent = ?key, "Re-subscribing updated parent");
                        graveyard.push(subscription);
                    }

                    let generation = self.next_generation;
                    self.next_generation += 1;
                    self.parents.insert(
                        key.clone(),
                        ParentEntry {
                            value: change.current().clone(),
                            items: HashMap::new(),
                            subscription: None,
                            completed: false,
                            generation,
                        },
                    );
                    pending.push(PendingChild {
                        key: key.clone(),
                        value: change.current().clone(),
                        generation,
                    });
                }
                ChangeReason::Remove => {
                    pending.retain(|child| child.key != *key);
                    graveyard.extend(self.withdraw_parent(options, key));
                }
                ChangeReason::Refresh => {
                    let Some(entry) = self.parents.get_mut(key) else {
                        continue;
                    };
                    entry.value = change.current().clone();
                    if options.resort_on_parent_refresh {
                        let child_keys: Vec<CK> = entry.items.keys().cloned().collect();
                        for child_key in &child_keys {
                            self.reconcile(options, child_key, None);
                        }
                    }
                }
                ChangeReason::Moved => {}
            }
        }

        pending
    }

    /// Forgets a parent and everything it contributed.
    fn withdraw_parent(&mut self, options: &MergeOptions<P, C>, parent: &PK) -> Option<Subscription> {
        let entry = self.parents.remove(parent)?;
        trace!(parent = ?parent, keys = entry.items.len(), "Withdrawing parent");
        for key in entry.items.keys() {
            self.registry.withdraw(key, parent);
            self.reconcile(options, key, None);
        }
        entry.subscription
    }

    // == Termination ==
    fn terminate(&mut self) -> Vec<Subscription> {
        self.terminated = true;
        let mut teardown: Vec<Subscription> = self.parent_subscription.take().into_iter().collect();
        teardown.extend(
            self.parents
                .values_mut()
                .filter_map(|entry| entry.subscription.take()),
        );
        teardown
    }

    /// Completes once the parent stream and every live child stream have.
    fn try_complete(&mut self) -> Option<Emission<CK, C>> {
        let done = self.parent_completed
            && self.deferred_flush.is_none()
            && self.parents.values().all(|entry| entry.completed);
        if !done {
            return None;
        }
        Some(Emission {
            changes: self.result.capture_changes(),
            terminal: Some(Terminal::Completed),
            teardown: self.terminate(),
        })
    }

    fn fail(&mut self, error: StreamError) -> Emission<CK, C> {
        Emission {
            changes: ChangeSet::new(),
            terminal: Some(Terminal::Failed(error)),
            teardown: self.terminate(),
        }
    }
}

// == Merge Shared ==
pub(crate) struct MergeShared<PK, P, CK, C> {
    state: ReentrantMutex<RefCell<MergeState<PK, P, CK, C>>>,
    sink: Sink<CK, C>,
    factory: ChildFactory<P, PK, CK, C>,
    options: MergeOptions<P, C>,
}

impl<PK: Key, P: Value, CK: Key, C: Value> MergeShared<PK, P, CK, C> {
    pub(crate) fn start(
        parents: &ChangeStream<PK, P>,
        factory: ChildFactory<P, PK, CK, C>,
        options: MergeOptions<P, C>,
        observer: Arc<dyn Observer<CK, C>>,
    ) -> Subscription {
        let shared = Arc::new(Self {
            state: ReentrantMutex::new(RefCell::new(MergeState::new(&options))),
            sink: Sink::new(observer),
            factory,
            options,
        });

        let upstream = parents.subscribe(ParentObserver {
            shared: Arc::downgrade(&shared),
        });
        let rejected = {
            let guard = shared.state.lock();
            let mut state = guard.borrow_mut();
            if state.terminated {
                Some(upstream)
            } else {
                state.parent_subscription = Some(upstream);
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
        debug!(subscriptions = teardown.len(), "Disposing merge");
        drop(teardown);
    }

    /// Emits `emission`, then cancels its subscriptions after the lock is released.
    fn deliver<G>(&self, guard: G, emission: Emission<CK, C>) {
        self.sink.next(&emission.changes);
        match emission.terminal {
            Some(Terminal::Completed) => {
                info!("Merge stream completed");
                self.sink.complete();
            }
            Some(Terminal::Failed(error)) => {
                warn!(error = %error, "Merge stream failed");
                self.sink.error(&error);
            }
            None => {}
        }
        drop(guard);
        drop(emission.teardown);
    }

    // == Parent Events ==
    fn on_parent_changes(self: &Arc<Self>, changes: &ChangeSet<PK, P>) {
        let mut graveyard = Vec::new();

        let pending = {
            let guard = self.state.lock();
            let mut state = guard.borrow_mut();
            if state.terminated {
                return;
            }
            let pending = state.apply_parents(&self.options, changes, &mut graveyard);
            if !pending.is_empty() {
                state.deferred_flush = Some(thread::current().id());
            }
            pending
        };

        // Subscribing takes each child's lock, which must not nest inside ours
        let mut subscribed = Vec::with_capacity(pending.len());
        let mut failure = None;
        for child in pending {
            debug!(parent = ?child.key, "Subscribing child stream");
            match (self.factory)(&child.value, &child.key) {
                Ok(stream) => {
                    let subscription = stream.subscribe(ChildObserver {
                        shared: Arc::downgrade(self),
                        parent: child.key.clone(),
                        generation: child.generation,
                    });
                    subscribed.push((child.key, child.generation, subscription));
                }
                Err(error) => {
                    failure = Some(StreamError::callback(OPERATOR, error));
                    break;
                }
            }
        }

        let guard = self.state.lock();
        let emission = {
            let mut state = guard.borrow_mut();
            state.deferred_flush = None;

            for (parent, generation, subscription) in subscribed {
                let current = !state.terminated && state.is_current(&parent, generation);
                match state.parents.get_mut(&parent) {
                    Some(entry) if current => entry.subscription = Some(subscription),
                    _ => graveyard.push(subscription),
                }
            }

            if state.terminated {
                None
            } else if let Some(error) = failure {
                Some(state.fail(error))
            } else {
                let completion = state.try_complete();
                Some(completion.unwrap_or_else(|| Emission::batch(state.result.capture_changes())))
            }
        };

        if let Some(emission) = emission {
            self.deliver(guard, emission);
        } else {
            drop(guard);
        }
        drop(graveyard);
    }

    fn on_parent_completed(&self) {
        let guard = self.state.lock();
        let emission = {
            let mut state = guard.borrow_mut();
            if state.terminated {
                return;
            }
            state.parent_completed = true;
            state.try_complete()
        };
        if let Some(emission) = emission {
            self.deliver(guard, emission);
        }
    }

    fn on_parent_error(&self, error: &StreamError) {
        let guard = self.state.lock();
        let emission = {
            let mut state = guard.borrow_mut();
            if state.terminated {
                return;
            }
            state.fail(error.clone())
        };
        self.deliver(guard, emission);
    }

    // == Child Events ==
    fn on_child_changes(&self, parent: &PK, generation: u64, changes: &ChangeSet<CK, C>) {
        let guard = self.state.lock();
        let flushed = {
            let mut state = guard.borrow_mut();
            if state.terminated || !state.is_current(parent, generation) {
                return;
            }
            state.apply_child(&self.options, parent, changes);
            if state.deferred_flush == Some(thread::current().id()) {
                return;
            }
            state.result.capture_changes()
        };
        self.sink.next(&flushed);
    }

    fn on_child_completed(&self, parent: &PK, generation: u64) {
        let guard = self.state.lock();
        let emission = {
            let mut state = guard.borrow_mut();
            if state.terminated || !state.is_current(parent, generation) {
                return;
            }
            if let Some(entry) = state.parents.get_mut(parent) {
                entry.completed = true;
            }
            state.try_complete()
        };
        if let Some(emission) = emission {
            self.deliver(guard, emission);
        }
    }

    fn on_child_error(&self, parent: &PK, generation: u64, error: &StreamError) {
        let guard = self.state.lock();
        let emission = {
            let mut state = guard.borrow_mut();
            if state.terminated || !state.is_current(parent, generation) {
                return;
            }
            state.fail(error.clone())
        };
        self.deliver(guard, emission);
    }
}

struct ParentObserver<PK, P, CK, C> {
    shared: Weak<MergeShared<PK, P, CK, C>>,
}

impl<PK: Key, P: Value, CK: Key, C: Value> Observer<PK, P> for ParentObserver<PK, P, CK, C> {
    fn on_next(&self, changes: &ChangeSet<PK, P>) {
        if let Some(shared) = self.shared.upgrade() {
            shared.on_parent_changes(changes);
        }
    }

    fn on_error(&self, error: &StreamError) {
        if let Some(shared) = self.shared.upgrade() {
            shared.on_parent_error(error);
        }
    }

    fn on_completed(&self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.on_parent_completed();
        }
    }
}

struct ChildObserver<PK, P, CK, C> {
    shared: Weak<MergeShared<PK, P, CK, C>>,
    parent: PK,
    generation: u64,
}

impl<PK: Key, P: Value, CK: Key, C: Value> Observer<CK, C> for ChildObserver<PK, P, CK, C> {
    fn on_next(&self, changes: &ChangeSet<CK, C>) {
        if let Some(shared) = self.shared.upgrade() {
            shared.on_child_changes(&self.parent, self.generation, changes);
        }
    }

    fn on_error(&self, error: &StreamError) {
        if let Some(shared) = self.shared.upgrade() {
            shared.on_child_error(&self.parent, self.generation, error);
        }
    }

    fn on_completed(&self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.on_child_completed(&self.parent, self.generation);
        }
    }
}
