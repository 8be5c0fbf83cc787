//! Resolution of demands and delivery to subscribers.

use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use crate::cache::ResolvedCache;
use crate::registry::DemandRegistry;
use crate::types::{DemandKey, ReadyEvent, ThumbnailHandle};

/// Callback invoked with the handle of a resolved (or placeholder) thumbnail.
pub type ResolvedCallback = Arc<dyn Fn(&ThumbnailHandle) + Send + Sync>;

/// Identifies one registered callback.
pub type SubscriptionId = u64;

/// Funnels every way a thumbnail becomes available through one resolve-then-notify sequence.
///
/// Authoritative results are written to L1 and resolve the demand. Placeholders are only shown
/// to subscribers; the demand stays outstanding so a proper result can replace them later.
#[derive(Default)]
pub struct ResolutionSink {
    subscribers: HashMap<DemandKey, Vec<(SubscriptionId, ResolvedCallback)>>,
}

impl fmt::Debug for ResolutionSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let subscriptions: usize = self.subscribers.values().map(Vec::len).sum();
        f.debug_struct("ResolutionSink")
            .field("keys", &self.subscribers.len())
            .field("subscriptions", &subscriptions)
            .finish()
    }
}

impl ResolutionSink {
    pub fn subscribe(&mut self, key: DemandKey, id: SubscriptionId, callback: ResolvedCallback) {
        self.subscribers.entry(key).or_default().push((id, callback));
    }

    pub fn unsubscribe(&mut self, key: &DemandKey, id: SubscriptionId) {
        if let Some(callbacks) = self.subscribers.get_mut(key) {
            callbacks.retain(|(existing, _)| *existing != id);
            if callbacks.is_empty() {
                self.subscribers.remove(key);
            }
        }
    }

    /// Stores an authoritative result, resolves the demand and notifies subscribers.
    pub fn resolve(
        &self,
        registry: &mut DemandRegistry,
        cache: &ResolvedCache,
        key: DemandKey,
        handle: ThumbnailHandle,
    ) {
        cache.insert(key.clone(), handle.clone());
        if registry.resolve(&key) {
            metric!(counter("thumbnails.resolved") += 1);
        }
        self.notify(&key, &handle);
    }

    /// Handles one push notification from the backend.
    pub fn on_ready(
        &self,
        registry: &mut DemandRegistry,
        cache: &ResolvedCache,
        event: ReadyEvent,
    ) {
        let key = event.key();
        let handle = event.handle();
        if event.is_placeholder {
            tracing::trace!(%key, "Delivering placeholder thumbnail");
            metric!(counter("thumbnails.placeholder") += 1);
            self.notify(&key, &handle);
        } else {
            tracing::trace!(%key, "Thumbnail ready");
            self.resolve(registry, cache, key, handle);
        }
    }

    pub fn notify(&self, key: &DemandKey, handle: &ThumbnailHandle) {
        if let Some(callbacks) = self.subscribers.get(key) {
            for (_, callback) in callbacks {
                deliver(callback, key, handle);
            }
        }
    }
}

/// Runs one callback on the owner task. A panicking callback is logged and skipped.
pub(crate) fn deliver(callback: &ResolvedCallback, key: &DemandKey, handle: &ThumbnailHandle) {
    if panic::catch_unwind(AssertUnwindSafe(|| callback(handle))).is_err() {
        tracing::error!(%key, "Thumbnail subscriber panicked");
        metric!(counter("thumbnails.subscriber.panic") += 1);
    }
}
