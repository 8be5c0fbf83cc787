//! Debouncing of registry mutations and selection of flush batches.

use std::cmp::Reverse;
use std::time::Duration;

use tokio::time::Instant;

use crate::cache::ResolvedCache;
use crate::registry::DemandRegistry;
use crate::types::Demand;

/// The debounce timer in front of flush cycles.
///
/// Only holds the deadline; the owner task sleeps until it.
#[derive(Debug)]
pub struct FlushTimer {
    debounce: Duration,
    deadline: Option<Instant>,
}

impl FlushTimer {
    pub fn new(debounce: Duration) -> Self {
        Self {
            debounce,
            deadline: None,
        }
    }

    /// Schedules a flush one debounce window from `now`.
    ///
    /// An already scheduled flush is left alone. Returns whether a new flush was scheduled.
    pub fn arm(&mut self, now: Instant) -> bool {
        if self.deadline.is_some() {
            return false;
        }
        self.deadline = Some(now + self.debounce);
        true
    }

    pub fn disarm(&mut self) {
        self.deadline = None;
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }
}

/// Picks the demands for the next flush cycle.
///
/// Candidates are wanted, not in flight, and still absent from L1. Demands resolved behind our
/// back are dropped from the registry here. The result is ordered by descending priority, then
/// by insertion order, and capped to `max_batch_size`.
pub fn select_batch(
    registry: &mut DemandRegistry,
    cache: &ResolvedCache,
    max_batch_size: usize,
) -> Vec<Demand> {
    let (resolved, mut candidates): (Vec<_>, Vec<_>) = registry
        .pending()
        .cloned()
        .partition(|demand| cache.contains(&demand.key));

    for demand in resolved {
        tracing::trace!(key = %demand.key, "Dropping demand resolved before flush");
        registry.resolve(&demand.key);
    }

    candidates.sort_by_key(|demand| (Reverse(demand.priority), demand.seq));
    candidates.truncate(max_batch_size);
    candidates
}
