//! Tokio Scheduler
//!
//! Real-time scheduler whose timers are tasks spawned on a tokio runtime.
//! Cancelling a timer aborts its task.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::runtime::Handle;
use tracing::{debug, trace};

use crate::error::{CacheError, Result};
use crate::scheduler::{Action, RecurringAction, Scheduler};
use crate::stream::Subscription;

// == Tokio Scheduler ==
/// Wall-clock scheduler backed by a tokio runtime handle.
#[derive(Debug, Clone)]
pub struct TokioScheduler {
    handle: Handle,
}

impl TokioScheduler {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Uses the runtime of the calling context.
    ///
    /// Fails with [`CacheError::Runtime`] outside a tokio runtime.
    pub fn current() -> Result<Self> {
        Handle::try_current()
            .map(Self::new)
            .map_err(|e| CacheError::Runtime(e.to_string()))
    }
}

impl Scheduler for TokioScheduler {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn schedule_once(&self, delay: Duration, action: Action) -> Subscription {
        let task = self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            action();
        });
        Subscription::new(move || task.abort())
    }

    /// Spawns a task that runs `action` after every `interval` of sleep.
    ///
    /// The returned handle aborts the task when disposed.
    fn schedule_periodic(&self, interval: Duration, mut action: RecurringAction) -> Subscription {
        debug!(?interval, "Starting periodic timer");

        let task = self.handle.spawn(async move {
            loop {
                // Sleep for the configured interval
                tokio::time::sleep(interval).await;

                trace!("Periodic timer tick");
                action();
            }
        });
        Subscription::new(move || task.abort())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_once_fires_after_delay() {
        let scheduler = TokioScheduler::current().unwrap();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();

        let _timer = scheduler.schedule_once(
            Duration::from_millis(20),
            Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancelled_once_never_fires() {
        let scheduler = TokioScheduler::current().unwrap();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();

        let timer = scheduler.schedule_once(
            Duration::from_millis(50),
            Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        timer.unsubscribe();

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_periodic_can_be_aborted() {
        let scheduler = TokioScheduler::current().unwrap();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();

        let timer = scheduler.schedule_periodic(
            Duration::from_millis(20),
            Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        tokio::time::sleep(Duration::from_millis(110)).await;
        timer.unsubscribe();
        let seen = runs.load(Ordering::SeqCst);
        assert!(seen >= 2, "expected at least two ticks, saw {seen}");

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(runs.load(Ordering::SeqCst), seen);
    }

    #[test]
    fn test_current_outside_runtime_fails() {
        assert!(matches!(TokioScheduler::current(), Err(CacheError::Runtime(_))));
    }
}
