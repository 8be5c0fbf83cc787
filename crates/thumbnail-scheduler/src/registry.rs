//! The set of wanted, not yet resolved thumbnails.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use tokio::time::Instant;

use crate::types::{AssetId, Demand, DemandKey, DemandRequest, SchedulerStats};

/// What [`DemandRegistry::demand`] did with a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DemandOutcome {
    Created,
    Merged,
}

/// Bookkeeping of outstanding demands.
///
/// Holds three pieces of state:
/// - the wanted set, at most one [`Demand`] per [`DemandKey`],
/// - the in-flight set, keys with an issued and not yet completed backend call,
/// - the time of the last backend attempt per key.
///
/// A key only leaves the in-flight set through [`clear_in_flight`](Self::clear_in_flight),
/// [`resolve`](Self::resolve) or [`release_abandoned`](Self::release_abandoned).
/// [`cancel`](Self::cancel) keeps it, since the issued call must be allowed to complete. A
/// cancelled key whose completion never arrives is dropped by `release_abandoned` once its
/// attempt is older than the liveness timeout.
#[derive(Debug)]
pub struct DemandRegistry {
    wanted: HashMap<DemandKey, Demand>,
    in_flight: HashSet<DemandKey>,
    last_attempt: HashMap<DemandKey, Instant>,
    next_seq: u64,
    visible_floor: i32,
}

impl DemandRegistry {
    pub fn new(visible_floor: i32) -> Self {
        Self {
            wanted: HashMap::new(),
            in_flight: HashSet::new(),
            last_attempt: HashMap::new(),
            next_seq: 0,
            visible_floor,
        }
    }

    /// Creates a demand, or merges the request into the existing one.
    pub fn demand(&mut self, request: DemandRequest, now: Instant) -> DemandOutcome {
        if let Some(existing) = self.wanted.get_mut(&request.key) {
            existing.merge(request);
            return DemandOutcome::Merged;
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        let demand = Demand::from_request(request, now, seq);
        self.wanted.insert(demand.key.clone(), demand);
        DemandOutcome::Created
    }

    /// Removes the key from the wanted set. An issued backend call keeps it in flight.
    pub fn cancel(&mut self, key: &DemandKey) -> bool {
        if !self.in_flight.contains(key) {
            self.last_attempt.remove(key);
        }
        self.wanted.remove(key).is_some()
    }

    /// Cancels every size wanted for `asset_id`.
    pub fn cancel_asset(&mut self, asset_id: &AssetId) -> usize {
        let before = self.wanted.len();
        self.wanted.retain(|key, _| &key.asset_id != asset_id);
        let (wanted, in_flight) = (&self.wanted, &self.in_flight);
        self.last_attempt.retain(|key, _| wanted.contains_key(key) || in_flight.contains(key));
        before - self.wanted.len()
    }

    /// Marks an existing demand visible, raising its priority to the visible floor.
    pub fn mark_visible(&mut self, key: &DemandKey) -> bool {
        let visible_floor = self.visible_floor;
        match self.wanted.get_mut(key) {
            Some(demand) => {
                demand.visible = true;
                demand.priority = demand.priority.max(visible_floor);
                true
            }
            None => false,
        }
    }

    pub fn mark_hidden(&mut self, key: &DemandKey) -> bool {
        match self.wanted.get_mut(key) {
            Some(demand) => {
                demand.visible = false;
                true
            }
            None => false,
        }
    }

    /// Forgets everything about `key`. Returns whether it was wanted.
    pub fn resolve(&mut self, key: &DemandKey) -> bool {
        self.in_flight.remove(key);
        self.last_attempt.remove(key);
        self.wanted.remove(key).is_some()
    }

    pub fn mark_in_flight(&mut self, key: &DemandKey, now: Instant) {
        self.in_flight.insert(key.clone());
        self.last_attempt.insert(key.clone(), now);
    }

    /// Allows `key` to be retried. The last attempt time is kept.
    pub fn clear_in_flight(&mut self, key: &DemandKey) {
        self.in_flight.remove(key);
        if !self.wanted.contains_key(key) {
            self.last_attempt.remove(key);
        }
    }

    /// Like [`clear_in_flight`](Self::clear_in_flight), but only if `attempt` is still the latest
    /// attempt for `key`.
    ///
    /// A late answer to an attempt the watchdog already gave up on must not release the retry.
    pub fn release_attempt(&mut self, key: &DemandKey, attempt: Instant) -> bool {
        if self.last_attempt.get(key) != Some(&attempt) {
            return false;
        }
        self.clear_in_flight(key);
        true
    }

    /// Forgets in-flight keys that are no longer wanted and whose attempt is older than
    /// `timeout`. Returns how many were dropped.
    pub fn release_abandoned(&mut self, now: Instant, timeout: Duration) -> usize {
        let abandoned: Vec<_> = self
            .in_flight
            .iter()
            .filter(|key| !self.wanted.contains_key(*key))
            .filter(|key| match self.last_attempt.get(*key) {
                Some(attempt) => now.saturating_duration_since(*attempt) > timeout,
                None => true,
            })
            .cloned()
            .collect();

        for key in &abandoned {
            self.in_flight.remove(key);
            self.last_attempt.remove(key);
        }
        abandoned.len()
    }

    pub fn is_wanted(&self, key: &DemandKey) -> bool {
        self.wanted.contains_key(key)
    }

    pub fn is_in_flight(&self, key: &DemandKey) -> bool {
        self.in_flight.contains(key)
    }

    pub fn get(&self, key: &DemandKey) -> Option<&Demand> {
        self.wanted.get(key)
    }

    pub(crate) fn get_mut(&mut self, key: &DemandKey) -> Option<&mut Demand> {
        self.wanted.get_mut(key)
    }

    /// The time of the last backend attempt, or the creation time if there never was one.
    pub fn last_attempt(&self, key: &DemandKey) -> Option<Instant> {
        let demand = self.wanted.get(key)?;
        Some(
            self.last_attempt
                .get(key)
                .copied()
                .unwrap_or(demand.created_at),
        )
    }

    /// Wanted demands that are not currently in flight.
    pub fn pending(&self) -> impl Iterator<Item = &Demand> {
        self.wanted
            .values()
            .filter(|demand| !self.in_flight.contains(&demand.key))
    }

    pub fn has_pending(&self) -> bool {
        self.pending().next().is_some()
    }

    /// Keys of the wanted demands that are visible.
    pub fn visible_keys(&self) -> Vec<DemandKey> {
        self.wanted
            .values()
            .filter(|demand| demand.visible)
            .map(|demand| demand.key.clone())
            .collect()
    }

    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            wanted_count: self.wanted.len(),
            in_flight_count: self.in_flight.len(),
            visible_count: self.wanted.values().filter(|d| d.visible).count(),
        }
    }
}
