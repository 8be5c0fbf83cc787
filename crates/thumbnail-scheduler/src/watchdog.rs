//! Liveness sweep over visible demands.
//!
//! A backend call whose completion never arrives (a dropped push event, a stalled worker) would
//! otherwise leave its demand in flight forever. The sweep releases such demands so the next
//! flush retries them. Invisible demands are never touched. In-flight keys nobody wants anymore
//! are forgotten once their attempt is past the timeout.

use std::time::Duration;

use tokio::time::Instant;

use crate::cache::ResolvedCache;
use crate::registry::DemandRegistry;

/// What a single sweep changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Demands found in L1 and dropped from the registry.
    pub resolved: usize,
    /// In-flight demands released for retry.
    pub unstuck: usize,
    /// Stale demands pushed to the stale priority floor.
    pub reprioritized: usize,
    /// Cancelled in-flight keys whose completion never arrived.
    pub abandoned: usize,
}

impl SweepReport {
    pub fn needs_flush(&self) -> bool {
        self.unstuck > 0 || self.reprioritized > 0
    }
}

pub fn sweep(
    registry: &mut DemandRegistry,
    cache: &ResolvedCache,
    now: Instant,
    liveness_timeout: Duration,
    stale_floor: i32,
) -> SweepReport {
    let mut report = SweepReport {
        abandoned: registry.release_abandoned(now, liveness_timeout),
        ..SweepReport::default()
    };

    for key in registry.visible_keys() {
        if cache.contains(&key) {
            registry.resolve(&key);
            report.resolved += 1;
            continue;
        }

        let Some(last_attempt) = registry.last_attempt(&key) else {
            continue;
        };
        if now.saturating_duration_since(last_attempt) <= liveness_timeout {
            continue;
        }

        if registry.is_in_flight(&key) {
            tracing::debug!(%key, "Releasing stuck thumbnail demand");
            registry.clear_in_flight(&key);
            report.unstuck += 1;
        } else if let Some(demand) = registry.get_mut(&key) {
            if demand.priority < stale_floor {
                demand.priority = stale_floor;
                report.reprioritized += 1;
            }
        }
    }

    report
}
