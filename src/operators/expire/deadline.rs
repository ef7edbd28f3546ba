//! Expiry Deadline Module
//!
//! What a time selector returns, and the boundary rule for "expired".

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::scheduler::add_saturating;

// == Expiry ==
/// When an item should leave the collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiry {
    /// The item never expires
    Never,
    /// The item expires this long after its expiry was (re)computed
    After(Duration),
    /// The item expires at this instant
    At(DateTime<Utc>),
}

impl Expiry {
    // == Deadline ==
    /// Absolute deadline relative to `now`, None for [`Expiry::Never`].
    pub fn deadline(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Expiry::Never => None,
            Expiry::After(ttl) => Some(add_saturating(now, *ttl)),
            Expiry::At(at) => Some(*at),
        }
    }
}

impl From<Duration> for Expiry {
    fn from(ttl: Duration) -> Self {
        Expiry::After(ttl)
    }
}

impl From<Option<Duration>> for Expiry {
    fn from(ttl: Option<Duration>) -> Self {
        ttl.map_or(Expiry::Never, Expiry::After)
    }
}

impl From<DateTime<Utc>> for Expiry {
    fn from(at: DateTime<Utc>) -> Self {
        Expiry::At(at)
    }
}

// == Is Due ==
/// Checks if a deadline has passed.
///
/// Boundary condition: a deadline is due once the current time is greater
/// than or equal to it, so a timer that fires late still removes the item
/// and one that fires early leaves it for the next check.
pub(crate) fn is_due(deadline: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    now >= deadline
}
