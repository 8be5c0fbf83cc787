use thumbnail_scheduler::{SchedulerStats, ThumbnailHandle, ThumbnailSize};
use thumbnail_test::{Delivered, placeholder, ready};

use crate::{advance, key, request, settle, setup_scheduler};

#[tokio::test(start_paused = true)]
async fn test_existing_thumbnail_is_not_generated() {
    let (scheduler, backend) = setup_scheduler(|_| {});
    backend.add_existing(key("a"), "/cache/a.webp");

    let delivered = Delivered::new();
    let _subscription = scheduler.subscribe("a", ThumbnailSize::Small, delivered.callback());
    scheduler.demand(request("a"));
    scheduler.demand(request("b"));
    advance(60).await;

    assert_eq!(backend.existence_calls(), vec![vec![key("a"), key("b")]]);
    let submitted: Vec<_> = backend
        .generation_calls()
        .into_iter()
        .flatten()
        .map(|task| task.key())
        .collect();
    assert_eq!(submitted, [key("b")]);

    assert_eq!(delivered.handles(), [ThumbnailHandle::location("/cache/a.webp")]);
    assert_eq!(
        scheduler.cache().get(&key("a")),
        Some(ThumbnailHandle::location("/cache/a.webp"))
    );
    assert_eq!(
        scheduler.stats().await,
        SchedulerStats {
            wanted_count: 1,
            in_flight_count: 1,
            visible_count: 0,
        }
    );

    // resolved thumbnails are served from L1 from now on
    scheduler.demand(request("a"));
    advance(100).await;
    assert!(backend.existence_calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_ready_event_resolves_demand() {
    let (scheduler, backend) = setup_scheduler(|_| {});

    let delivered = Delivered::new();
    let _subscription = scheduler.subscribe("a", ThumbnailSize::Small, delivered.callback());
    scheduler.demand(request("a").visible(true));
    advance(60).await;

    backend.emit(ready("a"));
    settle().await;

    assert_eq!(delivered.handles(), [ThumbnailHandle::location("/cache/a.webp")]);
    assert!(scheduler.cache().contains(&key("a")));
    assert_eq!(scheduler.stats().await, SchedulerStats::default());

    // nothing is left for the watchdog
    advance(5_000).await;
    assert_eq!(backend.existence_calls().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_placeholder_does_not_resolve() {
    let (scheduler, backend) = setup_scheduler(|_| {});

    let delivered = Delivered::new();
    let _subscription = scheduler.subscribe("a", ThumbnailSize::Small, delivered.callback());
    scheduler.demand(request("a").visible(true));
    advance(60).await;
    assert_eq!(backend.existence_calls().len(), 1);

    backend.emit(placeholder("a"));
    settle().await;

    assert_eq!(
        delivered.handles(),
        [ThumbnailHandle::location("/placeholders/a.webp")]
    );
    assert!(!scheduler.cache().contains(&key("a")));
    assert_eq!(scheduler.stats().await.wanted_count, 1);

    // the demand is still watched and retried
    advance(4_100).await;
    assert_eq!(backend.existence_calls(), vec![vec![key("a")]]);

    backend.emit(ready("a"));
    settle().await;
    assert_eq!(delivered.handles().len(), 2);
    assert_eq!(scheduler.stats().await, SchedulerStats::default());
}

#[tokio::test(start_paused = true)]
async fn test_set_resolves_demand() {
    let (scheduler, backend) = setup_scheduler(|_| {});

    scheduler.demand(request("a"));
    scheduler.set(
        "a",
        ThumbnailSize::Small,
        ThumbnailHandle::location("/local/a.webp"),
    );
    advance(100).await;

    assert!(backend.existence_calls().is_empty());
    assert_eq!(scheduler.stats().await, SchedulerStats::default());
    assert_eq!(
        scheduler.cache().get(&key("a")),
        Some(ThumbnailHandle::location("/local/a.webp"))
    );
}

#[tokio::test(start_paused = true)]
async fn test_subscribe_to_resolved_thumbnail() {
    let (scheduler, backend) = setup_scheduler(|_| {});

    // an event nobody asked for still lands in L1
    backend.emit(ready("a"));
    settle().await;

    let delivered = Delivered::new();
    let subscription = scheduler.subscribe("a", ThumbnailSize::Small, delivered.callback());
    assert_eq!(delivered.handles(), [ThumbnailHandle::location("/cache/a.webp")]);

    // delivered exactly once, even after the owner task saw the subscription
    settle().await;
    assert_eq!(delivered.handles().len(), 1);

    subscription.unsubscribe();
    settle().await;
    backend.emit(ready("a"));
    settle().await;
    assert_eq!(delivered.handles().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_dropped_subscription_is_not_notified() {
    let (scheduler, backend) = setup_scheduler(|_| {});

    let kept = Delivered::new();
    let dropped = Delivered::new();
    let _kept = scheduler.subscribe("a", ThumbnailSize::Small, kept.callback());
    drop(scheduler.subscribe("a", ThumbnailSize::Small, dropped.callback()));
    let _other_size = scheduler.subscribe("a", ThumbnailSize::Large, dropped.callback());
    settle().await;

    backend.emit(ready("a"));
    settle().await;

    assert_eq!(kept.handles().len(), 1);
    assert!(dropped.handles().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_panicking_subscriber_does_not_stop_scheduler() {
    let (scheduler, backend) = setup_scheduler(|_| {});

    let _broken = scheduler.subscribe("a", ThumbnailSize::Small, |_| panic!("broken subscriber"));
    let delivered = Delivered::new();
    let _subscription = scheduler.subscribe("a", ThumbnailSize::Small, delivered.callback());
    scheduler.demand(request("a").visible(true));
    advance(60).await;
    assert_eq!(backend.existence_calls().len(), 1);

    backend.emit(ready("a"));
    settle().await;
    assert_eq!(delivered.handles(), [ThumbnailHandle::location("/cache/a.webp")]);

    scheduler.demand(request("b").visible(true));
    advance(60).await;
    assert_eq!(backend.existence_calls(), vec![vec![key("b")]]);
    assert_eq!(
        scheduler.stats().await,
        SchedulerStats {
            wanted_count: 1,
            in_flight_count: 1,
            visible_count: 1,
        }
    );
}
