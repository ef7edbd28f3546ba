//! Virtual Scheduler
//!
//! Logical clock that only moves when told to. Timers due within an advance
//! run in due order, with the clock set to each timer's due time first.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::trace;

use crate::scheduler::{add_saturating, Action, RecurringAction, Scheduler};
use crate::stream::Subscription;

enum TaskKind {
    Once(Action),
    Periodic {
        interval: Duration,
        action: RecurringAction,
    },
}

struct Task {
    cancelled: Arc<AtomicBool>,
    kind: TaskKind,
}

struct VirtualState {
    now: DateTime<Utc>,
    next_seq: u64,
    /// Ordered by due time, then by scheduling order
    queue: BTreeMap<(DateTime<Utc>, u64), Task>,
}

impl VirtualState {
    fn enqueue(&mut self, due: DateTime<Utc>, task: Task) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.queue.insert((due, seq), task);
    }

    fn pop_due(&mut self, target: DateTime<Utc>) -> Option<(DateTime<Utc>, Task)> {
        let (&(due, seq), _) = self.queue.iter().next()?;
        if due > target {
            return None;
        }
        self.queue.remove(&(due, seq)).map(|task| (due, task))
    }
}

// == Virtual Scheduler ==
/// Manually advanced scheduler for deterministic tests.
///
/// Cloning shares the same clock.
#[derive(Clone)]
pub struct VirtualScheduler {
    state: Arc<Mutex<VirtualState>>,
}

impl VirtualScheduler {
    /// Creates a clock at the Unix epoch.
    pub fn new() -> Self {
        Self::starting_at(DateTime::<Utc>::UNIX_EPOCH)
    }

    pub fn starting_at(start: DateTime<Utc>) -> Self {
        Self {
            state: Arc::new(Mutex::new(VirtualState {
                now: start,
                next_seq: 0,
                queue: BTreeMap::new(),
            })),
        }
    }

    // == Advance ==
    /// Moves the clock forward by `delta`, running every timer that comes due.
    pub fn advance_by(&self, delta: Duration) {
        let target = add_saturating(self.state.lock().now, delta);
        self.advance_to(target);
    }

    /// Moves the clock to `target`, running every timer due at or before it.
    ///
    /// Timers scheduled by running actions are picked up in the same advance
    /// when they fall inside the window. Moving backwards is a no-op.
    pub fn advance_to(&self, target: DateTime<Utc>) {
        loop {
            let next = {
                let mut state = self.state.lock();
                let next = state.pop_due(target);
                if let Some((due, _)) = &next {
                    if *due > state.now {
                        state.now = *due;
                    }
                }
                next
            };

            let Some((due, task)) = next else {
                break;
            };
            if task.cancelled.load(Ordering::Acquire) {
                continue;
            }

            trace!(%due, "Running virtual timer");
            match task.kind {
                TaskKind::Once(action) => action(),
                TaskKind::Periodic {
                    interval,
                    mut action,
                } => {
                    action();
                    if !task.cancelled.load(Ordering::Acquire) {
                        let next_due = add_saturating(due, interval);
                        self.state.lock().enqueue(
                            next_due,
                            Task {
                                cancelled: task.cancelled,
                                kind: TaskKind::Periodic { interval, action },
                            },
                        );
                    }
                }
            }
        }

        let mut state = self.state.lock();
        if target > state.now {
            state.now = target;
        }
    }

    /// Runs every timer that is due right now without moving the clock.
    pub fn run_due(&self) {
        let now = self.state.lock().now;
        self.advance_to(now);
    }

    /// Number of timers still waiting to run.
    pub fn pending(&self) -> usize {
        self.state
            .lock()
            .queue
            .values()
            .filter(|task| !task.cancelled.load(Ordering::Acquire))
            .count()
    }

    fn schedule(&self, delay: Duration, kind: TaskKind) -> Subscription {
        let cancelled = Arc::new(AtomicBool::new(false));
        {
            let mut state = self.state.lock();
            let due = add_saturating(state.now, delay);
            state.enqueue(
                due,
                Task {
                    cancelled: Arc::clone(&cancelled),
                    kind,
                },
            );
        }
        Subscription::new(move || cancelled.store(true, Ordering::Release))
    }
}

impl Default for VirtualScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for VirtualScheduler {
    fn now(&self) -> DateTime<Utc> {
        self.state.lock().now
    }

    fn schedule_once(&self, delay: Duration, action: Action) -> Subscription {
        self.schedule(delay, TaskKind::Once(action))
    }

    fn schedule_periodic(&self, interval: Duration, action: RecurringAction) -> Subscription {
        // A zero interval would never let the clock move past the tick
        let interval = interval.max(Duration::from_nanos(1));
        self.schedule(interval, TaskKind::Periodic { interval, action })
    }
}
