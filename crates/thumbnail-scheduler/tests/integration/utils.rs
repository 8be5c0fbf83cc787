use std::sync::Arc;
use std::time::Duration;

use thumbnail_scheduler::{DemandKey, SchedulerConfig, ThumbnailBackend, ThumbnailScheduler};
use thumbnail_test as test;

pub use test::{RecordingBackend, key, request, requests, settle};

/// Creates a running scheduler on top of a fresh [`RecordingBackend`].
///
/// The `update_config` closure can modify the default configuration before the scheduler is
/// started.
pub fn setup_scheduler(
    update_config: impl FnOnce(&mut SchedulerConfig),
) -> (ThumbnailScheduler, Arc<RecordingBackend>) {
    let (scheduler, backend) = scheduler_with(RecordingBackend::new(), update_config);
    scheduler.init();
    (scheduler, backend)
}

/// Creates a scheduler on top of `backend` without starting it.
pub fn scheduler_with(
    backend: RecordingBackend,
    update_config: impl FnOnce(&mut SchedulerConfig),
) -> (ThumbnailScheduler, Arc<RecordingBackend>) {
    test::setup();

    let mut config = SchedulerConfig::default();
    update_config(&mut config);

    let backend = Arc::new(backend);
    let dyn_backend: Arc<dyn ThumbnailBackend> = backend.clone();
    let handle = tokio::runtime::Handle::current();
    let scheduler = ThumbnailScheduler::new(config, dyn_backend, handle);

    (scheduler, backend)
}

/// Sleeps on the paused test clock.
pub async fn advance(millis: u64) {
    tokio::time::sleep(Duration::from_millis(millis)).await;
}

/// The asset ids of one recorded backend call, in call order.
pub fn assets<'a>(keys: impl IntoIterator<Item = &'a DemandKey>) -> Vec<String> {
    keys.into_iter().map(|key| key.asset_id.to_string()).collect()
}
