//! The public scheduler handle and the task that owns all scheduling state.
//!
//! Every mutation goes through a single background task. Public operations only enqueue a
//! [`Message`] for it, so they never block on a backend round-trip and the registry never needs a
//! lock. Backend calls run in tasks of their own and report back to the owner over a second
//! channel; the owner then decides, with fresh state, what their results mean.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::StreamExt;
use futures::stream::BoxStream;
use tokio::runtime;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::Instrument;

use crate::backend::ThumbnailBackend;
use crate::batch::{self, FlushTimer};
use crate::cache::ResolvedCache;
use crate::config::SchedulerConfig;
use crate::coordinator::{self, FlushResult};
use crate::registry::{DemandOutcome, DemandRegistry};
use crate::sink::{self, ResolutionSink, ResolvedCallback, SubscriptionId};
use crate::types::{
    AssetId, Demand, DemandKey, DemandRequest, ReadyEvent, SchedulerStats, ThumbnailHandle,
    ThumbnailSize,
};
use crate::watchdog;

/// Requests from the public handle to the owner task.
enum Message {
    Demand(Vec<DemandRequest>),
    Cancel(DemandKey),
    CancelAsset(AssetId),
    MarkVisible(DemandKey),
    MarkHidden(DemandKey),
    ForceFlush,
    Set(DemandKey, ThumbnailHandle),
    Subscribe {
        key: DemandKey,
        id: SubscriptionId,
        callback: ResolvedCallback,
        /// The handle already invoked the callback from L1.
        delivered: bool,
    },
    Unsubscribe(DemandKey, SubscriptionId),
    Stats(oneshot::Sender<SchedulerStats>),
    Inspect(DemandKey, oneshot::Sender<Option<Demand>>),
}

/// The outcome of one spawned backend round-trip.
struct FlushCompletion {
    /// The time the batch was marked in flight.
    attempt: Instant,
    batch: Vec<DemandKey>,
    result: FlushResult,
}

/// The sending side of the owner task, and the task itself once started.
struct Channel {
    tx: mpsc::UnboundedSender<Message>,
    /// Buffers messages until [`ThumbnailScheduler::init`] starts the owner task.
    rx: Option<mpsc::UnboundedReceiver<Message>>,
    task: Option<JoinHandle<()>>,
}

impl Channel {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Some(rx),
            task: None,
        }
    }

    fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }
}

struct Inner {
    config: SchedulerConfig,
    backend: Arc<dyn ThumbnailBackend>,
    cache: ResolvedCache,
    runtime: runtime::Handle,
    channel: Mutex<Channel>,
    next_subscription: AtomicU64,
}

impl Inner {
    fn channel(&self) -> MutexGuard<'_, Channel> {
        self.channel.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn send(&self, message: Message) {
        if self.channel().tx.send(message).is_err() {
            tracing::trace!("Thumbnail scheduler is gone, dropping request");
        }
    }

    /// Sends a message that expects a reply, if the owner task is there to give one.
    fn query(&self, message: Message) -> bool {
        let channel = self.channel();
        channel.is_running() && channel.tx.send(message).is_ok()
    }
}

/// Coalesces thumbnail requests from the UI into batched backend calls.
///
/// The handle is cheap to clone. All clones talk to the same owner task, which is started by
/// [`init`](Self::init). Operations issued before that are buffered and applied once it runs.
#[derive(Clone)]
pub struct ThumbnailScheduler {
    inner: Arc<Inner>,
}

impl fmt::Debug for ThumbnailScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThumbnailScheduler")
            .field("config", &self.inner.config)
            .field("cache", &self.inner.cache)
            .field("running", &self.inner.channel().is_running())
            .finish()
    }
}

impl ThumbnailScheduler {
    /// Creates a scheduler with its own L1 cache, sized by the config.
    ///
    /// The owner task is spawned onto `runtime` by [`init`](Self::init).
    pub fn new(
        config: SchedulerConfig,
        backend: Arc<dyn ThumbnailBackend>,
        runtime: runtime::Handle,
    ) -> Self {
        let cache = ResolvedCache::new(config.l1_capacity);
        Self::with_cache(config, backend, cache, runtime)
    }

    /// Creates a scheduler that shares an existing L1 cache.
    pub fn with_cache(
        config: SchedulerConfig,
        backend: Arc<dyn ThumbnailBackend>,
        cache: ResolvedCache,
        runtime: runtime::Handle,
    ) -> Self {
        let inner = Inner {
            config,
            backend,
            cache,
            runtime,
            channel: Mutex::new(Channel::new()),
            next_subscription: AtomicU64::new(0),
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    /// The L1 cache of resolved thumbnails.
    pub fn cache(&self) -> &ResolvedCache {
        &self.inner.cache
    }

    /// Starts the owner task, the push subscription and the liveness watchdog.
    ///
    /// Calling this on a running scheduler does nothing.
    pub fn init(&self) {
        let mut channel = self.inner.channel();
        if channel.is_running() {
            return;
        }

        let messages = match channel.rx.take() {
            Some(messages) => messages,
            None => {
                // the previous task died on its own and took the receiver with it
                let (tx, rx) = mpsc::unbounded_channel();
                channel.tx = tx;
                rx
            }
        };

        let task = SchedulerTask::new(&self.inner, messages);
        let span = tracing::info_span!("thumbnail_scheduler");
        channel.task = Some(self.inner.runtime.spawn(task.run().instrument(span)));
        tracing::debug!("Thumbnail scheduler started");
    }

    /// Stops the owner task and drops every demand, subscription and cached thumbnail.
    ///
    /// Backend calls still in flight are not awaited, their results are discarded. Operations
    /// issued afterwards are buffered until the next [`init`](Self::init).
    pub fn shutdown(&self) {
        let mut channel = self.inner.channel();
        if let Some(task) = channel.task.take() {
            task.abort();
        }
        // Unconsumed messages of a scheduler that never ran are dropped along with the channel.
        *channel = Channel::new();
        self.inner.cache.clear();
        tracing::debug!("Thumbnail scheduler shut down");
    }

    /// Requests a thumbnail.
    ///
    /// Does nothing if it is already in L1. Otherwise it is registered, merged with an
    /// outstanding demand for the same key, and a flush is scheduled.
    pub fn demand(&self, request: DemandRequest) {
        if self.inner.cache.contains(&request.key) {
            return;
        }
        self.inner.send(Message::Demand(vec![request]));
    }

    /// Requests many thumbnails at once, scheduling at most one flush.
    pub fn demand_batch(&self, requests: impl IntoIterator<Item = DemandRequest>) {
        let requests: Vec<_> = requests
            .into_iter()
            .filter(|request| !self.inner.cache.contains(&request.key))
            .collect();
        if !requests.is_empty() {
            self.inner.send(Message::Demand(requests));
        }
    }

    /// Withdraws a demand. A backend call already issued for it still completes.
    pub fn cancel(&self, asset_id: impl Into<AssetId>, size: ThumbnailSize) {
        self.inner.send(Message::Cancel(DemandKey::new(asset_id, size)));
    }

    /// Withdraws the demands for every size of an asset.
    pub fn cancel_asset(&self, asset_id: impl Into<AssetId>) {
        self.inner.send(Message::CancelAsset(asset_id.into()));
    }

    /// Marks an outstanding demand as on screen, raising its priority to the visible floor.
    pub fn mark_visible(&self, asset_id: impl Into<AssetId>, size: ThumbnailSize) {
        self.inner.send(Message::MarkVisible(DemandKey::new(asset_id, size)));
    }

    /// Marks an outstanding demand as off screen. Its priority is kept.
    pub fn mark_hidden(&self, asset_id: impl Into<AssetId>, size: ThumbnailSize) {
        self.inner.send(Message::MarkHidden(DemandKey::new(asset_id, size)));
    }

    /// Runs a flush cycle right away instead of waiting for the debounce window.
    pub fn force_flush(&self) {
        self.inner.send(Message::ForceFlush);
    }

    /// Reacts to the application becoming visible or hidden.
    pub fn on_visibility_change(&self, visible: bool) {
        if visible {
            self.force_flush();
        }
    }

    /// Reacts to the application window regaining focus.
    pub fn on_window_focus(&self) {
        self.force_flush();
    }

    /// Supplies a thumbnail obtained elsewhere, resolving any demand for it.
    pub fn set(&self, asset_id: impl Into<AssetId>, size: ThumbnailSize, handle: ThumbnailHandle) {
        self.inner.send(Message::Set(DemandKey::new(asset_id, size), handle));
    }

    /// Registers a callback for the thumbnail of `asset_id` in `size`.
    ///
    /// If the thumbnail is already in L1 the callback runs before this returns. Afterwards it
    /// runs on the owner task for every resolution and placeholder, until the returned
    /// [`Subscription`] is dropped.
    pub fn subscribe<F>(
        &self,
        asset_id: impl Into<AssetId>,
        size: ThumbnailSize,
        callback: F,
    ) -> Subscription
    where
        F: Fn(&ThumbnailHandle) + Send + Sync + 'static,
    {
        let key = DemandKey::new(asset_id, size);
        let id = self.inner.next_subscription.fetch_add(1, Ordering::Relaxed);
        let callback: ResolvedCallback = Arc::new(callback);

        let delivered = match self.inner.cache.get(&key) {
            Some(handle) => {
                callback(&handle);
                true
            }
            None => false,
        };

        self.inner.send(Message::Subscribe {
            key: key.clone(),
            id,
            callback,
            delivered,
        });

        Subscription {
            key,
            id,
            inner: Arc::clone(&self.inner),
        }
    }

    /// Counts of outstanding demands. All zero while the scheduler is not running.
    pub async fn stats(&self) -> SchedulerStats {
        let (tx, rx) = oneshot::channel();
        if !self.inner.query(Message::Stats(tx)) {
            return SchedulerStats::default();
        }
        rx.await.unwrap_or_default()
    }

    /// The outstanding demand for a key, if there is one.
    pub async fn inspect(
        &self,
        asset_id: impl Into<AssetId>,
        size: ThumbnailSize,
    ) -> Option<Demand> {
        let (tx, rx) = oneshot::channel();
        let key = DemandKey::new(asset_id, size);
        if !self.inner.query(Message::Inspect(key, tx)) {
            return None;
        }
        rx.await.ok().flatten()
    }
}

/// A registered resolution callback.
///
/// The callback is removed when this is dropped.
#[must_use = "dropping a subscription removes its callback"]
pub struct Subscription {
    key: DemandKey,
    id: SubscriptionId,
    inner: Arc<Inner>,
}

impl Subscription {
    pub fn key(&self) -> &DemandKey {
        &self.key
    }

    /// Removes the callback. Same as dropping the subscription.
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.inner.send(Message::Unsubscribe(self.key.clone(), self.id));
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("key", &self.key)
            .field("id", &self.id)
            .finish()
    }
}

/// Everything the owner task mutates.
struct SchedulerState {
    config: SchedulerConfig,
    backend: Arc<dyn ThumbnailBackend>,
    cache: ResolvedCache,
    registry: DemandRegistry,
    sink: ResolutionSink,
    timer: FlushTimer,
    completions: mpsc::UnboundedSender<FlushCompletion>,
}

impl SchedulerState {
    fn handle(&mut self, message: Message) {
        match message {
            Message::Demand(requests) => self.demand(requests),
            Message::Cancel(key) => {
                if self.registry.cancel(&key) {
                    tracing::trace!(%key, "Thumbnail demand cancelled");
                }
            }
            Message::CancelAsset(asset_id) => {
                let cancelled = self.registry.cancel_asset(&asset_id);
                tracing::trace!(%asset_id, cancelled, "Thumbnail demands cancelled");
            }
            Message::MarkVisible(key) => {
                if self.registry.mark_visible(&key) {
                    self.schedule_flush();
                }
            }
            Message::MarkHidden(key) => {
                self.registry.mark_hidden(&key);
            }
            Message::ForceFlush => {
                self.timer.disarm();
                self.flush();
            }
            Message::Set(key, handle) => {
                self.sink.resolve(&mut self.registry, &self.cache, key, handle);
            }
            Message::Subscribe {
                key,
                id,
                callback,
                delivered,
            } => {
                // L1 may have been filled between the handle's lookup and now.
                if !delivered {
                    if let Some(handle) = self.cache.get(&key) {
                        sink::deliver(&callback, &key, &handle);
                    }
                }
                self.sink.subscribe(key, id, callback);
            }
            Message::Unsubscribe(key, id) => self.sink.unsubscribe(&key, id),
            Message::Stats(reply) => {
                reply.send(self.registry.stats()).ok();
            }
            Message::Inspect(key, reply) => {
                reply.send(self.registry.get(&key).cloned()).ok();
            }
        }
    }

    fn demand(&mut self, requests: Vec<DemandRequest>) {
        let now = Instant::now();
        let mut changed = false;

        for request in requests {
            if self.cache.contains(&request.key) {
                continue;
            }
            metric!(counter("thumbnails.demand") += 1);
            if self.registry.demand(request, now) == DemandOutcome::Merged {
                metric!(counter("thumbnails.demand.merged") += 1);
            }
            changed = true;
        }

        if changed {
            self.schedule_flush();
        }
    }

    fn schedule_flush(&mut self) {
        if self.timer.arm(Instant::now()) {
            tracing::trace!("Thumbnail flush scheduled");
        }
    }

    /// Runs one flush cycle: selects a batch, marks it in flight and hands it to the backend.
    fn flush(&mut self) {
        let max_batch_size = self.config.max_batch_size;
        let batch = batch::select_batch(&mut self.registry, &self.cache, max_batch_size);
        if batch.is_empty() {
            return;
        }

        let attempt = Instant::now();
        for demand in &batch {
            self.registry.mark_in_flight(&demand.key, attempt);
        }
        tracing::debug!(batch_size = batch.len(), "Flushing thumbnail demands");
        metric!(counter("thumbnails.flush") += 1);
        metric!(histogram("thumbnails.flush.batch_size") = batch.len() as u64);

        let backend = Arc::clone(&self.backend);
        let completions = self.completions.clone();
        let round_trip = async move {
            let result = coordinator::execute(&*backend, &batch).await;
            let batch = batch.into_iter().map(|demand| demand.key).collect();
            // The owner is gone after a shutdown, nobody cares about the result anymore.
            completions
                .send(FlushCompletion {
                    attempt,
                    batch,
                    result,
                })
                .ok();
        };
        tokio::spawn(round_trip.in_current_span());

        if self.registry.has_pending() {
            self.schedule_flush();
        }
    }

    fn on_flush_completed(&mut self, completion: FlushCompletion) {
        let FlushCompletion {
            attempt,
            batch,
            result,
        } = completion;

        match result {
            FlushResult::CheckFailed(error) => {
                tracing::warn!(
                    error = &error as &dyn std::error::Error,
                    batch_size = batch.len(),
                    "Thumbnail existence check failed"
                );
                metric!(counter("thumbnails.flush.error") += 1, "stage" => "existence", "kind" => error.kind());
                for key in &batch {
                    self.registry.release_attempt(key, attempt);
                }
            }
            FlushResult::Checked {
                hits,
                misses,
                submission,
            } => {
                metric!(counter("thumbnails.existence.hit") += hits.len() as i64);
                for (key, handle) in hits {
                    self.sink.resolve(&mut self.registry, &self.cache, key, handle);
                }

                match submission {
                    Ok(()) => {
                        metric!(counter("thumbnails.generation.submitted") += misses.len() as i64);
                        // Submitted keys wait for their push event, unless nobody wants them anymore.
                        for key in &misses {
                            if !self.registry.is_wanted(key) {
                                self.registry.release_attempt(key, attempt);
                            }
                        }
                    }
                    Err(error) => {
                        tracing::warn!(
                            error = &error as &dyn std::error::Error,
                            batch_size = misses.len(),
                            "Thumbnail generation submission failed"
                        );
                        metric!(counter("thumbnails.flush.error") += 1, "stage" => "generation", "kind" => error.kind());
                        for key in &misses {
                            self.registry.release_attempt(key, attempt);
                        }
                    }
                }
            }
        }

        let stats = self.registry.stats();
        metric!(gauge("thumbnails.wanted") = stats.wanted_count as u64);
        metric!(gauge("thumbnails.in_flight") = stats.in_flight_count as u64);

        if self.registry.has_pending() {
            self.schedule_flush();
        }
    }

    fn on_ready(&mut self, event: ReadyEvent) {
        self.sink.on_ready(&mut self.registry, &self.cache, event);
    }

    fn sweep(&mut self) {
        let report = watchdog::sweep(
            &mut self.registry,
            &self.cache,
            Instant::now(),
            self.config.liveness_timeout,
            self.config.stale_priority_floor,
        );

        if report.unstuck > 0 {
            tracing::info!(count = report.unstuck, "Retrying stuck thumbnail demands");
            metric!(counter("thumbnails.watchdog.unstuck") += report.unstuck as i64);
        }
        if report.abandoned > 0 {
            tracing::debug!(count = report.abandoned, "Forgot abandoned thumbnail requests");
            metric!(counter("thumbnails.watchdog.abandoned") += report.abandoned as i64);
        }
        if report.needs_flush() {
            self.schedule_flush();
        }
    }
}

/// What woke up the owner task.
enum Event {
    Message(Option<Message>),
    FlushCompleted(FlushCompletion),
    Ready(Option<ReadyEvent>),
    FlushDue,
    WatchdogTick,
}

struct SchedulerTask {
    state: SchedulerState,
    messages: mpsc::UnboundedReceiver<Message>,
    completions: mpsc::UnboundedReceiver<FlushCompletion>,
    ready_events: BoxStream<'static, ReadyEvent>,
    push_open: bool,
}

impl SchedulerTask {
    fn new(inner: &Inner, messages: mpsc::UnboundedReceiver<Message>) -> Self {
        let config = inner.config.clone();
        let (completions_tx, completions) = mpsc::unbounded_channel();

        let state = SchedulerState {
            registry: DemandRegistry::new(config.visible_priority_floor),
            timer: FlushTimer::new(config.debounce),
            sink: ResolutionSink::default(),
            backend: Arc::clone(&inner.backend),
            cache: inner.cache.clone(),
            completions: completions_tx,
            config,
        };

        Self {
            state,
            messages,
            completions,
            // subscribe right away so no event sent after `init` is missed
            ready_events: inner.backend.ready_events(),
            push_open: true,
        }
    }

    async fn run(mut self) {
        let period = self.state.config.watchdog_interval;
        let mut watchdog = time::interval_at(Instant::now() + period, period);
        watchdog.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let flush_at = self.state.timer.deadline();
            let event = tokio::select! {
                message = self.messages.recv() => Event::Message(message),
                Some(completion) = self.completions.recv() => Event::FlushCompleted(completion),
                event = self.ready_events.next(), if self.push_open => Event::Ready(event),
                _ = time::sleep_until(flush_at.unwrap_or_else(Instant::now)), if flush_at.is_some() => Event::FlushDue,
                _ = watchdog.tick() => Event::WatchdogTick,
            };

            match event {
                // every handle is gone
                Event::Message(None) => break,
                Event::Message(Some(message)) => self.state.handle(message),
                Event::FlushCompleted(completion) => self.state.on_flush_completed(completion),
                Event::Ready(Some(event)) => self.state.on_ready(event),
                Event::Ready(None) => {
                    tracing::warn!("Thumbnail push channel closed");
                    self.push_open = false;
                }
                Event::FlushDue => {
                    self.state.timer.disarm();
                    self.state.flush();
                }
                Event::WatchdogTick => self.state.sweep(),
            }
        }

        tracing::info!("Thumbnail scheduler terminated");
    }
}
