//! Expire After Operator
//!
//! Time-based removal of items, driven by a per-item time selector.
//!
//! # Modes
//! - Timer mode (no polling interval): one timer aimed at the nearest deadline
//! - Polling mode: a periodic sweep removes everything due at or before each tick
//!
//! Two flavours exist. [`expire_after`] works on any stream and only rewrites
//! what flows downstream. [`SourceCache::expire_after`](crate::cache::SourceCache::expire_after)
//! removes the items from the cache itself.

mod deadline;
mod queue;
mod source;
mod stream;
mod timer;

use std::sync::Arc;
use std::time::Duration;

use crate::error::{CacheError, Result};

pub use deadline::Expiry;
pub(crate) use source::expire_source;
pub use stream::expire_after;

/// Operator name reported in callback errors.
pub(crate) const OPERATOR: &str = "expire_after";

/// Per-item expiry callback.
pub(crate) type TimeSelector<V> = Arc<dyn Fn(&V) -> anyhow::Result<Expiry> + Send + Sync>;

pub(crate) fn validate_polling(polling_interval: Option<Duration>) -> Result<()> {
    match polling_interval {
        Some(interval) if interval.is_zero() => Err(CacheError::InvalidArgument(
            "polling interval must be greater than zero".to_string(),
        )),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_polling() {
        assert!(validate_polling(None).is_ok());
        assert!(validate_polling(Some(Duration::from_millis(1))).is_ok());
        assert!(matches!(
            validate_polling(Some(Duration::ZERO)),
            Err(CacheError::InvalidArgument(_))
        ));
    }
}
