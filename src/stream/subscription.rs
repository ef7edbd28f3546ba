//! Subscription Module
//!
//! Disposable handle returned by every subscribe and schedule call.

use std::fmt;

// == Subscription ==
/// Tears down a subscription or cancels a timer.
///
/// The teardown runs at most once: on [`Subscription::unsubscribe`] or when
/// the handle is dropped.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    teardown: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    /// Creates a handle that runs `teardown` when disposed.
    pub fn new<F>(teardown: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            teardown: Some(Box::new(teardown)),
        }
    }

    /// A handle with nothing to tear down.
    pub fn empty() -> Self {
        Self { teardown: None }
    }

    /// Disposes the subscription now.
    pub fn unsubscribe(mut self) {
        self.dispose();
    }

    /// Whether the teardown has not run yet.
    pub fn is_active(&self) -> bool {
        self.teardown.is_some()
    }

    fn dispose(&mut self) {
        if let Some(teardown) = self.teardown.take() {
            teardown();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.is_active())
            .finish()
    }
}
