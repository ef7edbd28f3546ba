//! Error types for the engine
//!
//! Provides unified error handling using thiserror. Synchronous caller
//! mistakes surface as [`CacheError`]; anything that terminates a change
//! stream travels to subscribers as a [`StreamError`].

use std::sync::Arc;

use thiserror::Error;

// == Cache Error Enum ==
/// Errors returned synchronously at the call site.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// The cache has completed or failed and accepts no more edits
    #[error("Cache has terminated and accepts no further edits")]
    Terminated,

    /// An edit was started from inside another edit of the same cache
    #[error("Cache is already being edited on this thread")]
    ReentrantEdit,

    /// An argument violates the operator's contract
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// No async runtime is available to drive real-time timers
    #[error("Runtime unavailable: {0}")]
    Runtime(String),
}

// == Stream Error Enum ==
/// Terminal error delivered to stream subscribers.
///
/// Cloneable so one failure can be broadcast to every subscriber.
#[derive(Error, Debug, Clone)]
pub enum StreamError {
    /// Failure injected into a source cache through `fail`
    #[error("Source failed: {0}")]
    Source(Arc<anyhow::Error>),

    /// A user-supplied callback returned an error
    #[error("{operator} callback failed: {error}")]
    Callback {
        /// Operator whose callback failed
        operator: &'static str,
        /// The callback's error
        error: Arc<anyhow::Error>,
    },
}

impl StreamError {
    /// Wraps an arbitrary error as a source failure.
    pub fn source(error: impl Into<anyhow::Error>) -> Self {
        StreamError::Source(Arc::new(error.into()))
    }

    /// Wraps a callback failure raised inside `operator`.
    pub fn callback(operator: &'static str, error: anyhow::Error) -> Self {
        StreamError::Callback {
            operator,
            error: Arc::new(error),
        }
    }
}

// == Result Type Alias ==
/// Convenience Result type for synchronous engine calls.
pub type Result<T> = std::result::Result<T, CacheError>;
