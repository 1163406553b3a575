use std::sync::{PoisonError, RwLock};

use crate::{Error, Result};

/// Per-option vote counters.
///
/// Increments and reads take one lock over the whole vector, so a reader
/// always sees the tally after some whole number of commits.
pub struct TallyStore {
    counts: RwLock<Vec<u64>>,
}

impl TallyStore {
    /// Creates a zeroed tally for `option_count` options.
    pub fn new(option_count: usize) -> Self {
        Self {
            counts: RwLock::new(vec![0; option_count]),
        }
    }

    /// Rebuilds a tally for `option_count` options from persisted counts.
    ///
    /// `counts` may be shorter than the ballot; missing options start at zero.
    pub fn restore(option_count: usize, counts: &[u64]) -> Result<Self> {
        if counts.len() > option_count {
            return Err(Error::Storage(format!(
                "stored tally has {} options, ballot has {option_count}",
                counts.len()
            )));
        }
        let mut restored = counts.to_vec();
        restored.resize(option_count, 0);
        Ok(Self {
            counts: RwLock::new(restored),
        })
    }

    /// Returns a snapshot of every counter, in option order.
    pub fn read(&self) -> Vec<u64> {
        self.counts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Adds one vote to the 1-based `option`.
    ///
    /// Only reachable from the session commit step; callers have already
    /// range-checked `option`.
    pub(crate) fn increment(&self, option: u32) {
        let mut counts = self.counts.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(slot) = (option as usize)
            .checked_sub(1)
            .and_then(|index| counts.get_mut(index))
        {
            *slot += 1;
        }
    }

    /// Sum of all counters.
    pub fn total(&self) -> u64 {
        self.read().iter().sum()
    }
}
