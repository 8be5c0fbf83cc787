//! Helpers for testing the thumbnail scheduler.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - Run tests on a paused clock (`#[tokio::test(start_paused = true)]`). The scheduler only
//!    uses tokio's clock, so debounce windows and liveness timeouts elapse instantly and
//!    deterministically. Use [`settle`] to let the scheduler process everything that was sent to
//!    it so far.
//!
//!  - [`RecordingBackend`] records calls the way a hit counter would: reading them through
//!    [`existence_calls`](RecordingBackend::existence_calls) or
//!    [`generation_calls`](RecordingBackend::generation_calls) drains them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

use thumbnail_scheduler::{
    BackendError, DemandKey, DemandRequest, ExistenceResult, GenerationTask, ReadyEvent,
    ThumbnailBackend, ThumbnailHandle, ThumbnailSize,
};

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `thumbnail_scheduler` crate and
///    mutes all other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("thumbnail_scheduler=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Lets the scheduler catch up with everything sent to it.
///
/// On a paused clock this runs all ready tasks and then advances time by a millisecond.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

pub fn key(asset: &str) -> DemandKey {
    DemandKey::new(asset, ThumbnailSize::Small)
}

/// A request for the small thumbnail of `asset`.
pub fn request(asset: &str) -> DemandRequest {
    DemandRequest::new(asset, ThumbnailSize::Small, format!("/photos/{asset}.jpg"))
}

/// Requests for `count` distinct assets named `{prefix}-{i}`.
pub fn requests(prefix: &str, count: usize) -> Vec<DemandRequest> {
    (0..count)
        .map(|i| request(&format!("{prefix}-{i}")))
        .collect()
}

/// A "thumbnail ready" push event for the small thumbnail of `asset`.
pub fn ready(asset: &str) -> ReadyEvent {
    ReadyEvent {
        asset_id: asset.into(),
        size: ThumbnailSize::Small,
        location: format!("/cache/{asset}.webp"),
        is_placeholder: false,
        inline_data: None,
    }
}

/// A placeholder push event for the small thumbnail of `asset`.
pub fn placeholder(asset: &str) -> ReadyEvent {
    ReadyEvent {
        location: format!("/placeholders/{asset}.webp"),
        is_placeholder: true,
        ..ready(asset)
    }
}

/// Collects every handle delivered to a subscription callback.
#[derive(Clone, Debug, Default)]
pub struct Delivered(Arc<Mutex<Vec<ThumbnailHandle>>>);

impl Delivered {
    pub fn new() -> Self {
        Self::default()
    }

    /// A subscription callback that records into this.
    pub fn callback(&self) -> impl Fn(&ThumbnailHandle) + Send + Sync + 'static {
        let delivered = Arc::clone(&self.0);
        move |handle| delivered.lock().unwrap().push(handle.clone())
    }

    pub fn handles(&self) -> Vec<ThumbnailHandle> {
        self.0.lock().unwrap().clone()
    }
}

#[derive(Debug, Default)]
struct State {
    existing: HashMap<DemandKey, String>,
    existence_calls: Vec<Vec<DemandKey>>,
    generation_calls: Vec<Vec<GenerationTask>>,
    failing_checks: usize,
    failing_submissions: usize,
}

/// An in-memory backend that records every call.
///
/// Thumbnails registered with [`add_existing`](Self::add_existing) are reported as hits, everything
/// else as a miss. Nothing is ever generated on its own; tests push completions with
/// [`emit`](Self::emit).
#[derive(Debug)]
pub struct RecordingBackend {
    state: Mutex<State>,
    latency: Duration,
    ready_tx: broadcast::Sender<ReadyEvent>,
}

impl Default for RecordingBackend {
    fn default() -> Self {
        Self::with_latency(Duration::ZERO)
    }
}

impl RecordingBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// A backend whose existence checks take `latency` to answer.
    pub fn with_latency(latency: Duration) -> Self {
        let (ready_tx, _) = broadcast::channel(1024);
        Self {
            state: Mutex::default(),
            latency,
            ready_tx,
        }
    }

    /// Makes the existence check report `key` as stored at `location`.
    pub fn add_existing(&self, key: DemandKey, location: &str) {
        let mut state = self.state.lock().unwrap();
        state.existing.insert(key, location.to_owned());
    }

    /// Fails the next `count` existence checks.
    pub fn fail_next_checks(&self, count: usize) {
        self.state.lock().unwrap().failing_checks = count;
    }

    /// Fails the next `count` generation submissions.
    pub fn fail_next_submissions(&self, count: usize) {
        self.state.lock().unwrap().failing_submissions = count;
    }

    /// Takes the items of every existence check since the last call.
    pub fn existence_calls(&self) -> Vec<Vec<DemandKey>> {
        std::mem::take(&mut self.state.lock().unwrap().existence_calls)
    }

    /// Takes the tasks of every generation submission since the last call.
    pub fn generation_calls(&self) -> Vec<Vec<GenerationTask>> {
        std::mem::take(&mut self.state.lock().unwrap().generation_calls)
    }

    /// Pushes an event to every subscriber of the ready channel.
    pub fn emit(&self, event: ReadyEvent) {
        self.ready_tx.send(event).ok();
    }
}

impl ThumbnailBackend for RecordingBackend {
    fn check_existence(
        &self,
        items: Vec<DemandKey>,
    ) -> BoxFuture<'_, Result<Vec<ExistenceResult>, BackendError>> {
        Box::pin(async move {
            let fail = {
                let mut state = self.state.lock().unwrap();
                state.existence_calls.push(items.clone());
                let fail = state.failing_checks > 0;
                state.failing_checks = state.failing_checks.saturating_sub(1);
                fail
            };

            if !self.latency.is_zero() {
                tokio::time::sleep(self.latency).await;
            }
            if fail {
                return Err(BackendError::Unavailable("connection refused".into()));
            }

            let state = self.state.lock().unwrap();
            let results = items
                .into_iter()
                .map(|key| {
                    let location = state.existing.get(&key).cloned();
                    ExistenceResult {
                        asset_id: key.asset_id,
                        size: key.size,
                        hit: location.is_some(),
                        location,
                    }
                })
                .collect();
            Ok(results)
        })
    }

    fn submit_generation_batch(
        &self,
        tasks: Vec<GenerationTask>,
    ) -> BoxFuture<'_, Result<(), BackendError>> {
        Box::pin(async move {
            let mut state = self.state.lock().unwrap();
            state.generation_calls.push(tasks);
            if state.failing_submissions > 0 {
                state.failing_submissions -= 1;
                return Err(BackendError::Rejected("queue full".into()));
            }
            Ok(())
        })
    }

    fn ready_events(&self) -> BoxStream<'static, ReadyEvent> {
        let rx = self.ready_tx.subscribe();
        stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(event) => return Some((event, rx)),
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => return None,
                }
            }
        })
        .boxed()
    }
}
