//! Timer Slot Module
//!
//! The single outstanding timer of the non-polling expiry mode.

use chrono::{DateTime, Utc};

use crate::scheduler::{delay_until, Action, Scheduler};
use crate::stream::Subscription;

struct ArmedTimer {
    due: DateTime<Utc>,
    generation: u64,
    handle: Subscription,
}

// == Timer Slot ==
/// Holds at most one timer, aimed at the nearest pending deadline.
///
/// Each timer carries a generation so a firing that was superseded by a
/// re-arm can recognise itself as stale.
#[derive(Default)]
pub(crate) struct TimerSlot {
    armed: Option<ArmedTimer>,
    generation: u64,
}

impl TimerSlot {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    // == Arm ==
    /// Ensures a timer fires no later than `next`; None disarms.
    ///
    /// An armed timer that already fires at or before `next` is kept.
    pub(crate) fn arm(
        &mut self,
        next: Option<DateTime<Utc>>,
        scheduler: &dyn Scheduler,
        on_fire: impl FnOnce(u64) -> Action,
    ) {
        let Some(next) = next else {
            self.armed = None;
            return;
        };
        if self.armed.as_ref().is_some_and(|timer| timer.due <= next) {
            return;
        }

        self.generation += 1;
        let generation = self.generation;
        let delay = delay_until(scheduler.now(), next);
        let handle = scheduler.schedule_once(delay, on_fire(generation));
        // Replacing the previous timer cancels it
        self.armed = Some(ArmedTimer {
            due: next,
            generation,
            handle,
        });
    }

    // == Claim ==
    /// Accepts a firing if it belongs to the armed timer, emptying the slot.
    pub(crate) fn claim(&mut self, generation: u64) -> bool {
        match &self.armed {
            Some(timer) if timer.generation == generation => {
                self.armed = None;
                true
            }
            _ => false,
        }
    }

    /// Removes the armed timer so it can be cancelled outside a lock.
    pub(crate) fn take(&mut self) -> Option<Subscription> {
        self.armed.take().map(|timer| timer.handle)
    }

    #[cfg(test)]
    pub(crate) fn armed_due(&self) -> Option<DateTime<Utc>> {
        self.armed.as_ref().map(|timer| timer.due)
    }
}
