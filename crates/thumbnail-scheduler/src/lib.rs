//! Demand scheduling for thumbnails.
//!
//! Requests for thumbnails arrive from many independent UI components. The
//! [`ThumbnailScheduler`] collects them, drops duplicates and already resolved ones, and turns the
//! rest into a few prioritized batch calls against a [`ThumbnailBackend`]. Results from the
//! backend, whether found on storage or pushed later after generation, end up in the in-memory
//! [`ResolvedCache`] and are handed to subscribers.

#[macro_use]
pub mod metrics;

pub mod backend;
pub mod batch;
pub mod cache;
pub mod config;
pub mod coordinator;
pub mod logging;
pub mod registry;
pub mod scheduler;
pub mod sink;
pub mod types;
pub mod watchdog;

pub use backend::{BackendError, ThumbnailBackend};
pub use cache::ResolvedCache;
pub use config::SchedulerConfig;
pub use scheduler::{Subscription, ThumbnailScheduler};
pub use types::{
    AssetId, Demand, DemandKey, DemandRequest, ExistenceResult, GenerationTask, ReadyEvent,
    SchedulerStats, ThumbnailHandle, ThumbnailSize,
};
