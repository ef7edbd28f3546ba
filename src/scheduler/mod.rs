//! Scheduler Module
//!
//! The clock abstraction the operators are written against.
//!
//! # Implementations
//! - [`TokioScheduler`]: wall-clock time, timers run as tokio tasks
//! - [`VirtualScheduler`]: logical time advanced by hand, for deterministic tests

mod realtime;
mod virtual_time;

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::stream::Subscription;

pub use realtime::TokioScheduler;
pub use virtual_time::VirtualScheduler;

/// Work run once by a scheduler.
pub type Action = Box<dyn FnOnce() + Send + 'static>;

/// Work run on every tick of a periodic timer.
pub type RecurringAction = Box<dyn FnMut() + Send + 'static>;

// == Scheduler ==
/// Source of "now" and of deferred execution.
///
/// Implementations must never run an action synchronously from inside
/// `schedule_once` or `schedule_periodic`; operators call them while holding
/// their own locks. Dropping the returned handle cancels the timer.
pub trait Scheduler: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;

    /// Runs `action` once after `delay`.
    fn schedule_once(&self, delay: Duration, action: Action) -> Subscription;

    /// Runs `action` every `interval`, first after one full interval.
    fn schedule_periodic(&self, interval: Duration, action: RecurringAction) -> Subscription;
}

// == Time Conversion ==
/// Converts a std duration into a chrono one, saturating on overflow.
pub(crate) fn to_time_delta(duration: Duration) -> chrono::TimeDelta {
    chrono::TimeDelta::from_std(duration).unwrap_or(chrono::TimeDelta::MAX)
}

/// `start + duration`, saturating at the latest representable instant.
pub(crate) fn add_saturating(start: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    start
        .checked_add_signed(to_time_delta(duration))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Delay from `now` until `due`, zero when `due` has passed.
pub(crate) fn delay_until(now: DateTime<Utc>, due: DateTime<Utc>) -> Duration {
    (due - now).to_std().unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_until_past_is_zero() {
        let now = DateTime::<Utc>::UNIX_EPOCH + chrono::TimeDelta::seconds(10);
        let due = DateTime::<Utc>::UNIX_EPOCH;
        assert_eq!(delay_until(now, due), Duration::ZERO);
    }

    #[test]
    fn test_add_saturating_clamps() {
        let now = DateTime::<Utc>::UNIX_EPOCH;
        assert_eq!(add_saturating(now, Duration::MAX), DateTime::<Utc>::MAX_UTC);
    }

    #[test]
    fn test_delay_until_future() {
        let now = DateTime::<Utc>::UNIX_EPOCH;
        let due = add_saturating(now, Duration::from_millis(250));
        assert_eq!(delay_until(now, due), Duration::from_millis(250));
    }
}
