use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::Notify;

use thumbnail_scheduler::{DemandKey, DemandRequest, ThumbnailScheduler, ThumbnailSize};

use crate::backend::BackendConfig;

/// How long a single thumbnail may take before it counts as failed.
const RESOLVE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
pub struct WorkloadsConfig {
    #[serde(default)]
    pub backend: BackendConfig,
    pub workloads: Vec<Workload>,
}

#[derive(Debug, Deserialize)]
pub struct Workload {
    pub concurrency: usize,
    #[serde(flatten)]
    pub pattern: Pattern,
}

/// The way one simulated UI component requests thumbnails.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "pattern", rename_all = "lowercase")]
pub enum Pattern {
    /// A page of visible thumbnails scrolled into view, waiting until all of them resolved.
    Scroll { page: usize },
    /// A thumbnail that is requested and cancelled right away.
    Flicker,
    /// A thumbnail out of a small, recurring set of assets.
    Revisit { assets: u64 },
}

/// What one operation of a workload achieved.
#[derive(Debug, Default, Clone, Copy)]
pub struct Outcome {
    pub resolved: usize,
    pub timed_out: usize,
}

impl Outcome {
    fn merge(mut self, other: Outcome) -> Self {
        self.resolved += other.resolved;
        self.timed_out += other.timed_out;
        self
    }
}

/// Hands out asset ids unique to a workload.
#[derive(Debug)]
pub struct AssetIds {
    workload: usize,
    next: AtomicU64,
}

impl AssetIds {
    pub fn new(workload: usize) -> Self {
        Self {
            workload,
            next: AtomicU64::new(0),
        }
    }

    fn fresh(&self) -> String {
        let id = self.next.fetch_add(1, Ordering::Relaxed);
        self.name(id)
    }

    fn name(&self, id: u64) -> String {
        format!("w{}-{id:08x}", self.workload)
    }
}

fn request(asset_id: &str) -> DemandRequest {
    DemandRequest::new(asset_id, ThumbnailSize::Small, format!("/library/{asset_id}.heic"))
}

pub async fn process_workload(
    scheduler: &ThumbnailScheduler,
    pattern: &Pattern,
    ids: &AssetIds,
) -> Outcome {
    match pattern {
        Pattern::Scroll { page } => {
            let requests: Vec<_> = (0..*page)
                .map(|_| request(&ids.fresh()).visible(true))
                .collect();
            let waits: Vec<_> = requests
                .iter()
                .map(|request| wait_resolved(scheduler, request.key.clone()))
                .collect();
            scheduler.demand_batch(requests);

            futures::future::join_all(waits)
                .await
                .into_iter()
                .fold(Outcome::default(), Outcome::merge)
        }
        Pattern::Flicker => {
            let asset_id = ids.fresh();
            scheduler.demand(request(&asset_id));
            tokio::task::yield_now().await;
            scheduler.cancel(asset_id.as_str(), ThumbnailSize::Small);
            Outcome::default()
        }
        Pattern::Revisit { assets } => {
            let asset_id = ids.name(rand::random::<u64>() % (*assets).max(1));
            let request = request(&asset_id).visible(true);
            let wait = wait_resolved(scheduler, request.key.clone());
            scheduler.demand(request);
            wait.await
        }
    }
}

/// Waits until `key` has an authoritative thumbnail. Placeholders do not count.
async fn wait_resolved(scheduler: &ThumbnailScheduler, key: DemandKey) -> Outcome {
    let notify = Arc::new(Notify::new());
    let _subscription = {
        let notify = Arc::clone(&notify);
        scheduler.subscribe(key.asset_id.clone(), key.size, move |_| {
            notify.notify_one()
        })
    };

    let resolved = async {
        while !scheduler.cache().contains(&key) {
            notify.notified().await;
        }
    };

    match tokio::time::timeout(RESOLVE_TIMEOUT, resolved).await {
        Ok(()) => Outcome {
            resolved: 1,
            timed_out: 0,
        },
        Err(_) => {
            tracing::debug!(%key, "Thumbnail did not resolve in time");
            Outcome {
                resolved: 0,
                timed_out: 1,
            }
        }
    }
}
