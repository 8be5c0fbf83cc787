use std::collections::HashSet;
use std::time::Duration;

use thumbnail_scheduler::{DemandRequest, SchedulerStats, ThumbnailSize};

use crate::{
    RecordingBackend, advance, assets, key, request, requests, scheduler_with, settle,
    setup_scheduler,
};

#[tokio::test(start_paused = true)]
async fn test_demands_are_debounced_and_capped() {
    let (scheduler, backend) = setup_scheduler(|_| {});

    scheduler.demand_batch(requests("photo", 120));

    // nothing is sent before the debounce window elapses
    advance(49).await;
    assert!(backend.existence_calls().is_empty());

    advance(2).await;
    let first = backend.existence_calls();
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].len(), 100);
    assert_eq!(first[0][0], key("photo-0"));
    assert_eq!(first[0][99], key("photo-99"));

    // the remainder goes out one debounce window later, on its own
    advance(50).await;
    let second = backend.existence_calls();
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].len(), 20);

    let checked: HashSet<_> = first[0].iter().chain(&second[0]).collect();
    assert_eq!(checked.len(), 120);

    let generated: Vec<_> = backend.generation_calls().into_iter().flatten().collect();
    assert_eq!(generated.len(), 120);

    insta::assert_debug_snapshot!(scheduler.stats().await, @r"
    SchedulerStats {
        wanted_count: 120,
        in_flight_count: 120,
        visible_count: 0,
    }
    ");
}

#[tokio::test(start_paused = true)]
async fn test_backlog_is_drained() {
    let (scheduler, backend) = setup_scheduler(|_| {});
    scheduler.demand_batch(requests("photo", 250));

    advance(200).await;

    let sizes: Vec<_> = backend
        .existence_calls()
        .iter()
        .map(|call| call.len())
        .collect();
    assert_eq!(sizes, [100, 100, 50]);

    // nothing is ever sent twice while it is in flight
    advance(500).await;
    assert!(backend.existence_calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_demands_are_merged() {
    let (scheduler, backend) = setup_scheduler(|_| {});

    scheduler.demand(request("a").priority(3));
    scheduler.demand(request("a").priority(10).dimensions(640, 480));
    scheduler.demand(request("a").visible(true));
    scheduler.demand(request("a").priority(1));
    settle().await;

    let demand = scheduler
        .inspect("a", ThumbnailSize::Small)
        .await
        .unwrap();
    assert_eq!(demand.priority, 10);
    assert!(demand.visible);
    assert_eq!((demand.width, demand.height), (Some(640), Some(480)));
    assert_eq!(
        scheduler.stats().await,
        SchedulerStats {
            wanted_count: 1,
            in_flight_count: 0,
            visible_count: 1,
        }
    );

    advance(60).await;
    assert_eq!(backend.existence_calls(), vec![vec![key("a")]]);

    let tasks = backend.generation_calls();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0][0].priority, 10);
    assert_eq!(tasks[0][0].width, Some(640));
}

#[tokio::test(start_paused = true)]
async fn test_batches_are_ordered_by_priority() {
    let (scheduler, backend) = setup_scheduler(|config| config.max_batch_size = 2);

    scheduler.demand(request("low").priority(1));
    scheduler.demand(request("offscreen").priority(20));
    scheduler.demand(request("onscreen").priority(5));
    scheduler.demand(request("tie").priority(20));
    scheduler.mark_visible("onscreen", ThumbnailSize::Small);

    advance(60).await;
    let calls = backend.existence_calls();
    assert_eq!(assets(&calls[0]), ["onscreen", "offscreen"]);

    advance(50).await;
    let calls = backend.existence_calls();
    assert_eq!(assets(&calls[0]), ["tie", "low"]);
}

#[tokio::test(start_paused = true)]
async fn test_demand_during_flush_goes_into_next_batch() {
    let backend = RecordingBackend::with_latency(Duration::from_millis(100));
    let (scheduler, backend) = scheduler_with(backend, |_| {});
    scheduler.init();

    scheduler.demand(request("a"));
    advance(60).await;

    // "a" is in flight, raising its priority must not send it again
    scheduler.demand(request("a").priority(10));
    scheduler.demand(request("b"));
    advance(70).await;

    let calls = backend.existence_calls();
    assert_eq!(calls, vec![vec![key("a")], vec![key("b")]]);

    advance(100).await;
    let submitted: Vec<_> = backend
        .generation_calls()
        .into_iter()
        .flatten()
        .map(|task| task.key())
        .collect();
    assert_eq!(submitted, [key("a"), key("b")]);
}

#[tokio::test(start_paused = true)]
async fn test_force_flush_skips_debounce() {
    let (scheduler, backend) = setup_scheduler(|_| {});

    scheduler.demand(request("a"));
    scheduler.force_flush();
    settle().await;
    assert_eq!(backend.existence_calls(), vec![vec![key("a")]]);

    scheduler.demand(request("b"));
    scheduler.on_window_focus();
    settle().await;
    assert_eq!(backend.existence_calls(), vec![vec![key("b")]]);

    scheduler.demand(request("c"));
    scheduler.on_visibility_change(false);
    settle().await;
    assert!(backend.existence_calls().is_empty());
    scheduler.on_visibility_change(true);
    settle().await;
    assert_eq!(backend.existence_calls(), vec![vec![key("c")]]);

    // the debounced flush that was still pending finds nothing to do
    advance(100).await;
    assert!(backend.existence_calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_demands_are_not_sent() {
    let (scheduler, backend) = setup_scheduler(|_| {});

    for size in ThumbnailSize::ALL {
        scheduler.demand(DemandRequest::new("a", size, "/photos/a.jpg"));
    }
    scheduler.demand(request("b"));
    scheduler.demand(request("c"));
    scheduler.cancel_asset("a");
    scheduler.cancel("b", ThumbnailSize::Small);

    advance(60).await;
    assert_eq!(backend.existence_calls(), vec![vec![key("c")]]);
}
