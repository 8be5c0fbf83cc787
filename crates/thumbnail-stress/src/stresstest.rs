use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use sentry::SentryFutureExt;
use sketches_ddsketch::DDSketch;
use thumbnail_scheduler::config::Config;
use thumbnail_scheduler::{ThumbnailBackend, ThumbnailScheduler};
use tokio::sync::Semaphore;

use crate::backend::SimulatedBackend;
use crate::workloads::{AssetIds, Outcome, WorkloadsConfig, process_workload};

pub async fn perform_stresstest(
    config: Config,
    workloads: WorkloadsConfig,
    duration: Duration,
) -> Result<()> {
    workloads
        .backend
        .validate()
        .context("invalid backend simulation")?;

    // start the scheduler
    let runtime = tokio::runtime::Handle::current();
    let backend: Arc<dyn ThumbnailBackend> = Arc::new(SimulatedBackend::new(workloads.backend));
    let scheduler = ThumbnailScheduler::new(config.scheduler, backend, runtime);
    scheduler.init();

    // run the workloads concurrently
    let mut tasks = Vec::with_capacity(workloads.workloads.len());
    for (i, workload) in workloads.workloads.into_iter().enumerate() {
        let start = Instant::now();
        let deadline = tokio::time::Instant::from_std(start + duration);
        let scheduler = scheduler.clone();
        let concurrency = workload.concurrency;
        let pattern = Arc::new(workload.pattern);
        let ids = Arc::new(AssetIds::new(i));

        let task = tokio::spawn(async move {
            let task_durations = Arc::new(Mutex::new(DDSketch::default()));
            let outcome = Arc::new(Mutex::new(Outcome::default()));
            let semaphore = Arc::new(Semaphore::new(concurrency));

            // See <https://docs.rs/tokio/latest/tokio/time/struct.Sleep.html#examples>
            let sleep = tokio::time::sleep_until(deadline);
            tokio::pin!(sleep);

            loop {
                if deadline.elapsed() > Duration::ZERO {
                    break;
                }
                tokio::select! {
                    permit = semaphore.clone().acquire_owned() => {
                        let scheduler = scheduler.clone();
                        let pattern = Arc::clone(&pattern);
                        let ids = Arc::clone(&ids);
                        let task_durations = Arc::clone(&task_durations);
                        let outcome = Arc::clone(&outcome);
                        let task_start = Instant::now();

                        let hub = sentry::Hub::new_from_top(sentry::Hub::current());
                        let ctx = sentry::TransactionContext::new("stresstest", "stresstest");
                        let transaction = hub.start_transaction(ctx);

                        let future = async move {
                            let result = process_workload(&scheduler, &pattern, &ids).await;

                            transaction.finish();

                            task_durations.lock().unwrap().add(task_start.elapsed().as_secs_f64());
                            let mut outcome = outcome.lock().unwrap();
                            outcome.resolved += result.resolved;
                            outcome.timed_out += result.timed_out;

                            drop(permit);
                        };
                        let future = future.bind_hub(hub);

                        tokio::spawn(future);
                    }
                    _ = &mut sleep => {
                        break;
                    }
                }
            }

            // by acquiring *all* the semaphores, we essentially wait for all outstanding tasks to finish
            let _permits = semaphore.acquire_many(concurrency as u32).await;

            let task_durations: DDSketch = {
                let mut task_durations = task_durations.lock().unwrap();
                std::mem::take(&mut task_durations)
            };
            let outcome = *outcome.lock().unwrap();

            (concurrency, pattern, task_durations, outcome)
        });
        tasks.push(task);
    }

    let finished_tasks = futures::future::join_all(tasks).await;

    for (i, task) in finished_tasks.into_iter().enumerate() {
        let (concurrency, pattern, task_durations, outcome) = task?;

        let ops = task_durations.count();
        let ops_ps = ops as f32 / duration.as_secs_f32();
        println!(
            "Workload {i} ({pattern:?}, concurrency: {concurrency}): {ops} operations, {ops_ps:.2} ops/s"
        );
        println!(
            "  resolved: {}; timed out: {}",
            outcome.resolved, outcome.timed_out
        );
        if ops == 0 {
            continue;
        }

        let quantile = |q| {
            let secs = task_durations.quantile(q).ok().flatten().unwrap_or_default();
            Duration::from_secs_f64(secs)
        };
        let avg = Duration::from_secs_f64(task_durations.sum().unwrap_or_default() / ops as f64);
        let (p50, p90, p99) = (quantile(0.5), quantile(0.9), quantile(0.99));
        println!("  avg: {avg:.2?}; p50: {p50:.2?}; p90: {p90:.2?}; p99: {p99:.2?}");
    }

    let stats = scheduler.stats().await;
    println!();
    println!(
        "Outstanding: {} wanted, {} in flight, {} cached",
        stats.wanted_count,
        stats.in_flight_count,
        scheduler.cache().entry_count()
    );

    scheduler.shutdown();
    Ok(())
}
