use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::{self, BoxStream, StreamExt};
use rand::Rng;
use serde::Deserialize;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use thumbnail_scheduler::{
    BackendError, DemandKey, ExistenceResult, GenerationTask, ReadyEvent, ThumbnailBackend,
};

/// Behavior of the simulated thumbnail pipeline.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// How long an existence check takes.
    #[serde(with = "humantime_serde")]
    pub check_latency: Duration,
    /// How long generating a single thumbnail takes.
    #[serde(with = "humantime_serde")]
    pub generation_time: Duration,
    /// Share of unknown thumbnails that are found on storage anyway.
    pub hit_ratio: f64,
    /// Share of generations that push a placeholder first.
    pub placeholder_ratio: f64,
    /// Share of generations whose ready event is lost.
    pub drop_ratio: f64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            check_latency: Duration::from_millis(10),
            generation_time: Duration::from_millis(200),
            hit_ratio: 0.0,
            placeholder_ratio: 0.0,
            drop_ratio: 0.0,
        }
    }
}

impl BackendConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        for (name, ratio) in [
            ("hit_ratio", self.hit_ratio),
            ("placeholder_ratio", self.placeholder_ratio),
            ("drop_ratio", self.drop_ratio),
        ] {
            if !(0.0..=1.0).contains(&ratio) {
                anyhow::bail!("backend.{name} must be between 0 and 1, got {ratio}");
            }
        }
        Ok(())
    }
}

/// Decisions for one generation, drawn up front.
struct Outcome {
    placeholder: bool,
    dropped: bool,
}

struct Inner {
    config: BackendConfig,
    stored: Mutex<HashSet<DemandKey>>,
    ready_tx: broadcast::Sender<ReadyEvent>,
}

/// A thumbnail pipeline living in memory, with configurable latency and failure rates.
#[derive(Clone)]
pub struct SimulatedBackend {
    inner: Arc<Inner>,
}

impl SimulatedBackend {
    pub fn new(config: BackendConfig) -> Self {
        let (ready_tx, _) = broadcast::channel(4096);
        let inner = Inner {
            config,
            stored: Mutex::default(),
            ready_tx,
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    fn location(key: &DemandKey) -> String {
        format!("/thumbnails/{}/{}.webp", key.size, key.asset_id)
    }

    fn ready_event(key: &DemandKey, is_placeholder: bool) -> ReadyEvent {
        ReadyEvent {
            asset_id: key.asset_id.clone(),
            size: key.size,
            location: Self::location(key),
            is_placeholder,
            inline_data: None,
        }
    }

    fn generate(&self, key: DemandKey) {
        let outcome = {
            let mut rng = rand::thread_rng();
            Outcome {
                placeholder: rng.gen_bool(self.inner.config.placeholder_ratio),
                dropped: rng.gen_bool(self.inner.config.drop_ratio),
            }
        };

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            if outcome.placeholder {
                inner.ready_tx.send(Self::ready_event(&key, true)).ok();
            }
            tokio::time::sleep(inner.config.generation_time).await;

            inner.stored.lock().unwrap().insert(key.clone());
            if outcome.dropped {
                tracing::trace!(%key, "Dropping ready event");
                return;
            }
            inner.ready_tx.send(Self::ready_event(&key, false)).ok();
        });
    }
}

impl ThumbnailBackend for SimulatedBackend {
    fn check_existence(
        &self,
        items: Vec<DemandKey>,
    ) -> BoxFuture<'_, Result<Vec<ExistenceResult>, BackendError>> {
        Box::pin(async move {
            tokio::time::sleep(self.inner.config.check_latency).await;

            let stored = self.inner.stored.lock().unwrap();
            let mut rng = rand::thread_rng();
            let results = items
                .into_iter()
                .map(|key| {
                    let hit =
                        stored.contains(&key) || rng.gen_bool(self.inner.config.hit_ratio);
                    ExistenceResult {
                        location: hit.then(|| Self::location(&key)),
                        asset_id: key.asset_id,
                        size: key.size,
                        hit,
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
            for task in tasks {
                self.generate(task.key());
            }
            Ok(())
        })
    }

    fn ready_events(&self) -> BoxStream<'static, ReadyEvent> {
        let rx = self.inner.ready_tx.subscribe();
        stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(event) => return Some((event, rx)),
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Ready events lagged behind");
                    }
                    Err(RecvError::Closed) => return None,
                }
            }
        })
        .boxed()
    }
}
