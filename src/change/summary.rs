//! Change Summary Module
//!
//! Per-reason counters for one or more change batches.

use serde::Serialize;

use crate::change::ChangeReason;

// == Change Summary ==
/// Counts of each change reason.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ChangeSummary {
    /// Number of Add changes
    pub adds: usize,
    /// Number of Update changes
    pub updates: usize,
    /// Number of Remove changes
    pub removes: usize,
    /// Number of Refresh changes
    pub refreshes: usize,
    /// Number of Moved changes
    pub moves: usize,
}

impl ChangeSummary {
    // == Constructor ==
    /// Creates a summary with all counters at zero.
    pub fn new() -> Self {
        Self::default()
    }

    // == Record ==
    /// Increments the counter for `reason`.
    pub fn record(&mut self, reason: ChangeReason) {
        match reason {
            ChangeReason::Add => self.adds += 1,
            ChangeReason::Update => self.updates += 1,
            ChangeReason::Remove => self.removes += 1,
            ChangeReason::Refresh => self.refreshes += 1,
            ChangeReason::Moved => self.moves += 1,
        }
    }

    // == Merge ==
    /// Adds another summary's counters into this one.
    pub fn merge(&mut self, other: &ChangeSummary) {
        self.adds += other.adds;
        self.updates += other.updates;
        self.removes += other.removes;
        self.refreshes += other.refreshes;
        self.moves += other.moves;
    }

    // == Total ==
    /// Total number of changes counted.
    pub fn total(&self) -> usize {
        self.adds + self.updates + self.removes + self.refreshes + self.moves
    }

    // == Net Growth ==
    /// Net change in collection size implied by the counted changes.
    pub fn net_growth(&self) -> isize {
        self.adds as isize - self.removes as isize
    }
}
