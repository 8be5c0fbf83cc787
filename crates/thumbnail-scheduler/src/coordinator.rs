//! One backend round-trip of a flush cycle.

use std::collections::HashMap;

use crate::backend::{BackendError, ThumbnailBackend};
use crate::types::{Demand, DemandKey, ThumbnailHandle};

/// What came back from the backend for one flush batch.
#[derive(Debug)]
pub enum FlushResult {
    /// The existence check failed, nothing is known about the batch.
    CheckFailed(BackendError),
    /// The existence check succeeded.
    Checked {
        /// Keys that already exist on durable storage.
        hits: Vec<(DemandKey, ThumbnailHandle)>,
        /// Keys handed to the generation queue (or attempted to).
        misses: Vec<DemandKey>,
        /// Outcome of the generation submission. `Ok` if there was nothing to submit.
        submission: Result<(), BackendError>,
    },
}

/// Runs the existence check for `batch` and enqueues every miss for generation.
///
/// Registry bookkeeping is left to the caller, this only talks to the backend.
pub async fn execute(backend: &dyn ThumbnailBackend, batch: &[Demand]) -> FlushResult {
    let items = batch.iter().map(|demand| demand.key.clone()).collect();
    let results = match backend.check_existence(items).await {
        Ok(results) => results,
        Err(err) => return FlushResult::CheckFailed(err),
    };

    let mut found: HashMap<DemandKey, ThumbnailHandle> = results
        .into_iter()
        .filter(|result| result.hit)
        .filter_map(|result| {
            let location = result.location.as_deref()?;
            Some((result.key(), ThumbnailHandle::location(location)))
        })
        .collect();

    let mut hits = Vec::new();
    let mut tasks = Vec::new();
    for demand in batch {
        match found.remove(&demand.key) {
            Some(handle) => hits.push((demand.key.clone(), handle)),
            None => tasks.push(demand.generation_task()),
        }
    }

    let misses = tasks.iter().map(|task| task.key()).collect();
    let submission = if tasks.is_empty() {
        Ok(())
    } else {
        backend.submit_generation_batch(tasks).await
    };

    FlushResult::Checked {
        hits,
        misses,
        submission,
    }
}
