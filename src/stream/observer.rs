//! Observer Module
//!
//! The receiving side of a change stream.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::change::ChangeSet;
use crate::error::StreamError;

// == Observer ==
/// Receives change batches and the stream's terminal event.
pub trait Observer<K, V>: Send + Sync {
    fn on_next(&self, changes: &ChangeSet<K, V>);

    fn on_error(&self, error: &StreamError);

    fn on_completed(&self);
}

// == Fn Observer ==
/// Observer assembled from closures.
pub struct FnObserver<N, E, C> {
    on_next: N,
    on_error: E,
    on_completed: C,
}

impl<N, E, C> FnObserver<N, E, C> {
    pub fn new(on_next: N, on_error: E, on_completed: C) -> Self {
        Self {
            on_next,
            on_error,
            on_completed,
        }
    }
}

impl<K, V, N, E, C> Observer<K, V> for FnObserver<N, E, C>
where
    N: Fn(&ChangeSet<K, V>) + Send + Sync,
    E: Fn(&StreamError) + Send + Sync,
    C: Fn() + Send + Sync,
{
    fn on_next(&self, changes: &ChangeSet<K, V>) {
        (self.on_next)(changes)
    }

    fn on_error(&self, error: &StreamError) {
        (self.on_error)(error)
    }

    fn on_completed(&self) {
        (self.on_completed)()
    }
}

// == Sink ==
/// Guards an observer so it sees at most one terminal event and nothing
/// after it, nor anything after the subscription was closed.
pub(crate) struct Sink<K, V> {
    observer: Arc<dyn Observer<K, V>>,
    stopped: AtomicBool,
}

impl<K, V> Sink<K, V> {
    pub(crate) fn new(observer: Arc<dyn Observer<K, V>>) -> Self {
        Self {
            observer,
            stopped: AtomicBool::new(false),
        }
    }

    /// Forwards a non-empty batch.
    pub(crate) fn next(&self, changes: &ChangeSet<K, V>) {
        if changes.is_empty() || self.is_stopped() {
            return;
        }
        self.observer.on_next(changes);
    }

    pub(crate) fn error(&self, error: &StreamError) {
        if !self.stopped.swap(true, Ordering::AcqRel) {
            self.observer.on_error(error);
        }
    }

    pub(crate) fn complete(&self) {
        if !self.stopped.swap(true, Ordering::AcqRel) {
            self.observer.on_completed();
        }
    }

    /// Silences the sink without delivering a terminal event.
    pub(crate) fn close(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::Change;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl Observer<u32, u32> for Recorder {
        fn on_next(&self, changes: &ChangeSet<u32, u32>) {
            self.events.lock().push(format!("next:{}", changes.len()));
        }

        fn on_error(&self, error: &StreamError) {
            self.events.lock().push(format!("error:{error}"));
        }

        fn on_completed(&self) {
            self.events.lock().push("completed".to_string());
        }
    }

    fn batch() -> ChangeSet<u32, u32> {
        std::iter::once(Change::add(1, 1)).collect()
    }

    #[test]
    fn test_single_terminal_event() {
        let recorder = Arc::new(Recorder::default());
        let sink = Sink::new(recorder.clone() as Arc<dyn Observer<u32, u32>>);

        sink.next(&batch());
        sink.complete();
        sink.error(&StreamError::source(anyhow::anyhow!("late")));
        sink.next(&batch());

        assert_eq!(*recorder.events.lock(), vec!["next:1", "completed"]);
    }

    #[test]
    fn test_closed_sink_is_silent() {
        let recorder = Arc::new(Recorder::default());
        let sink = Sink::new(recorder.clone() as Arc<dyn Observer<u32, u32>>);

        sink.close();
        sink.next(&batch());
        sink.complete();

        assert!(recorder.events.lock().is_empty());
    }

    #[test]
    fn test_empty_batches_are_suppressed() {
        let recorder = Arc::new(Recorder::default());
        let sink = Sink::new(recorder.clone() as Arc<dyn Observer<u32, u32>>);

        sink.next(&ChangeSet::new());

        assert!(recorder.events.lock().is_empty());
    }
}
