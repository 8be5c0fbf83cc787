use thumbnail_scheduler::{SchedulerStats, ThumbnailHandle, ThumbnailSize};
use thumbnail_test::{Delivered, ready};

use crate::{RecordingBackend, advance, key, request, scheduler_with, settle, setup_scheduler};

#[tokio::test(start_paused = true)]
async fn test_operations_before_init_are_buffered() {
    let (scheduler, backend) = scheduler_with(RecordingBackend::new(), |_| {});

    scheduler.demand(request("a"));
    scheduler.demand(request("b"));
    scheduler.cancel("b", ThumbnailSize::Small);
    advance(100).await;

    assert!(backend.existence_calls().is_empty());
    assert_eq!(scheduler.stats().await, SchedulerStats::default());
    assert!(scheduler.inspect("a", ThumbnailSize::Small).await.is_none());

    scheduler.init();
    advance(60).await;
    assert_eq!(backend.existence_calls(), vec![vec![key("a")]]);
}

#[tokio::test(start_paused = true)]
async fn test_init_is_idempotent() {
    let (scheduler, backend) = setup_scheduler(|_| {});
    scheduler.init();
    scheduler.clone().init();

    scheduler.demand(request("a"));
    advance(60).await;
    assert_eq!(backend.existence_calls().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_clears_state() {
    let (scheduler, backend) = setup_scheduler(|_| {});

    let delivered = Delivered::new();
    let _subscription = scheduler.subscribe("a", ThumbnailSize::Small, delivered.callback());
    scheduler.set(
        "cached",
        ThumbnailSize::Small,
        ThumbnailHandle::location("/cache/cached.webp"),
    );
    scheduler.demand(request("a").visible(true));
    advance(60).await;
    assert_eq!(scheduler.stats().await.in_flight_count, 1);

    scheduler.shutdown();
    assert_eq!(scheduler.stats().await, SchedulerStats::default());
    assert!(!scheduler.cache().contains(&key("cached")));

    backend.emit(ready("a"));
    settle().await;
    assert!(delivered.handles().is_empty());
    assert!(!scheduler.cache().contains(&key("a")));

    // nothing is watched or flushed while shut down
    scheduler.demand(request("b"));
    advance(5_000).await;
    assert_eq!(backend.existence_calls().len(), 1);

    // demands made in between survive into the next run, the old ones do not
    scheduler.init();
    advance(60).await;
    assert_eq!(backend.existence_calls(), vec![vec![key("b")]]);
    assert_eq!(
        scheduler.stats().await,
        SchedulerStats {
            wanted_count: 1,
            in_flight_count: 1,
            visible_count: 0,
        }
    );
}
