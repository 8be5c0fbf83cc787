//! The seam to the thumbnail pipeline: existence check, generation queue and push channel.

use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use thiserror::Error;

use crate::types::{DemandKey, ExistenceResult, GenerationTask, ReadyEvent};

/// A transient failure talking to the thumbnail backend.
///
/// None of these are fatal: the affected batch is released and retried by a later flush or the
/// liveness watchdog.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    /// The backend could not be reached at all.
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    /// The backend did not answer in time.
    #[error("backend call timed out after {0:?}")]
    Timeout(Duration),
    /// The backend answered, but refused the request.
    #[error("backend rejected request: {0}")]
    Rejected(String),
}

impl BackendError {
    /// A short tag for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Unavailable(_) => "unavailable",
            Self::Timeout(_) => "timeout",
            Self::Rejected(_) => "rejected",
        }
    }
}

/// The backend thumbnail pipeline the scheduler coalesces requests for.
pub trait ThumbnailBackend: Send + Sync + 'static {
    /// Reports which of the given thumbnails already exist on durable storage, and where.
    ///
    /// Keys missing from the answer are treated as misses.
    fn check_existence(
        &self,
        items: Vec<DemandKey>,
    ) -> BoxFuture<'_, Result<Vec<ExistenceResult>, BackendError>>;

    /// Enqueues a batch of thumbnails for generation.
    ///
    /// This is fire-and-forget: completion is reported through [`ready_events`](Self::ready_events).
    fn submit_generation_batch(
        &self,
        tasks: Vec<GenerationTask>,
    ) -> BoxFuture<'_, Result<(), BackendError>>;

    /// Subscribes to the push channel of "thumbnail ready" notifications.
    ///
    /// Delivery is at most once per event; events may be lost.
    fn ready_events(&self) -> BoxStream<'static, ReadyEvent>;
}
