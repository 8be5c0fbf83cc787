use std::time::Duration;

use thumbnail_scheduler::{SchedulerStats, ThumbnailSize};

use crate::{RecordingBackend, advance, key, request, scheduler_with, setup_scheduler};

#[tokio::test(start_paused = true)]
async fn test_lost_completion_is_retried() {
    let (scheduler, backend) = setup_scheduler(|_| {});

    scheduler.demand(request("a").visible(true));
    advance(60).await;
    assert_eq!(backend.existence_calls().len(), 1);
    assert_eq!(backend.generation_calls().len(), 1);

    // no push event ever arrives
    advance(3840).await;
    assert!(backend.existence_calls().is_empty());

    advance(200).await;
    assert_eq!(backend.existence_calls(), vec![vec![key("a")]]);
    assert_eq!(backend.generation_calls().len(), 1);

    let stats = scheduler.stats().await;
    assert_eq!(stats.in_flight_count, 1);
    assert_eq!(stats.wanted_count, 1);
}

#[tokio::test(start_paused = true)]
async fn test_invisible_demands_are_not_retried() {
    let (scheduler, backend) = setup_scheduler(|_| {});

    scheduler.demand(request("a"));
    advance(60).await;
    assert_eq!(backend.existence_calls().len(), 1);

    advance(10_000).await;
    assert!(backend.existence_calls().is_empty());

    // becoming visible again puts it back under watch
    scheduler.mark_visible("a", ThumbnailSize::Small);
    advance(1_000).await;
    assert_eq!(backend.existence_calls(), vec![vec![key("a")]]);
}

#[tokio::test(start_paused = true)]
async fn test_failed_check_is_retried() {
    let (scheduler, backend) = setup_scheduler(|_| {});
    backend.fail_next_checks(1);

    scheduler.demand(request("a"));
    advance(60).await;
    assert_eq!(backend.existence_calls().len(), 1);
    assert!(backend.generation_calls().is_empty());
    assert_eq!(scheduler.stats().await.in_flight_count, 0);

    advance(50).await;
    assert_eq!(backend.existence_calls(), vec![vec![key("a")]]);
    assert_eq!(backend.generation_calls().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_failed_submission_is_retried() {
    let (scheduler, backend) = setup_scheduler(|_| {});
    backend.fail_next_submissions(1);

    scheduler.demand(request("a"));
    advance(60).await;
    assert_eq!(backend.generation_calls().len(), 1);
    assert_eq!(scheduler.stats().await.in_flight_count, 0);

    advance(50).await;
    assert_eq!(backend.generation_calls().len(), 1);
    assert_eq!(scheduler.stats().await.in_flight_count, 1);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_lets_in_flight_call_complete() {
    let backend = RecordingBackend::with_latency(Duration::from_millis(100));
    let (scheduler, backend) = scheduler_with(backend, |_| {});
    scheduler.init();

    scheduler.demand(request("a"));
    advance(60).await;
    scheduler.cancel("a", ThumbnailSize::Small);
    advance(1).await;

    let stats = scheduler.stats().await;
    assert_eq!(stats.wanted_count, 0);
    assert_eq!(stats.in_flight_count, 1);

    advance(100).await;
    assert_eq!(backend.generation_calls().len(), 1);
    assert_eq!(scheduler.stats().await, SchedulerStats::default());

    // a fresh demand for the same key starts over
    scheduler.demand(request("a"));
    advance(200).await;
    assert_eq!(backend.existence_calls().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_late_answer_does_not_release_retry() {
    // slower than the liveness timeout, so the watchdog retries before the first answer
    let backend = RecordingBackend::with_latency(Duration::from_millis(4_500));
    let (scheduler, backend) = scheduler_with(backend, |_| {});
    scheduler.init();
    backend.fail_next_checks(1);

    scheduler.demand(request("a").visible(true));
    advance(4_100).await;
    assert_eq!(backend.existence_calls().len(), 2);

    // the first attempt fails at 4550, the retry is still outstanding
    advance(500).await;
    assert_eq!(scheduler.stats().await.in_flight_count, 1);
    assert!(backend.existence_calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_request_with_lost_completion_is_forgotten() {
    let (scheduler, backend) = setup_scheduler(|_| {});

    scheduler.demand(request("a").visible(true));
    advance(60).await;
    assert_eq!(backend.existence_calls().len(), 1);
    assert_eq!(backend.generation_calls().len(), 1);

    // cancelled after submission, and the push event never arrives
    scheduler.cancel("a", ThumbnailSize::Small);
    advance(1).await;
    let stats = scheduler.stats().await;
    assert_eq!(stats.wanted_count, 0);
    assert_eq!(stats.in_flight_count, 1);

    advance(4_000).await;
    assert_eq!(scheduler.stats().await, SchedulerStats::default());
    assert!(backend.existence_calls().is_empty());

    // an offscreen demand for the same key is flushed again
    scheduler.demand(request("a"));
    advance(60).await;
    assert_eq!(backend.existence_calls(), vec![vec![key("a")]]);
}
