use std::fmt;

use crate::types::{DemandKey, ThumbnailHandle};

type InMemoryCache = moka::sync::Cache<DemandKey, ThumbnailHandle>;

/// The in-process cache of resolved thumbnails (L1).
///
/// Cloning is cheap and clones share the same storage. Writes are idempotent, the last value wins.
#[derive(Clone)]
pub struct ResolvedCache {
    cache: InMemoryCache,
}

impl fmt::Debug for ResolvedCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedCache")
            .field("in-memory items", &self.cache.entry_count())
            .finish()
    }
}

impl ResolvedCache {
    pub fn new(capacity: u64) -> Self {
        let cache = InMemoryCache::builder()
            .max_capacity(capacity)
            .name("thumbnails")
            .build();
        Self { cache }
    }

    pub fn get(&self, key: &DemandKey) -> Option<ThumbnailHandle> {
        self.cache.get(key)
    }

    pub fn contains(&self, key: &DemandKey) -> bool {
        self.cache.contains_key(key)
    }

    pub fn insert(&self, key: DemandKey, handle: ThumbnailHandle) {
        self.cache.insert(key, handle);
    }

    pub fn invalidate(&self, key: &DemandKey) {
        self.cache.invalidate(key);
    }

    pub fn clear(&self) {
        self.cache.invalidate_all();
    }

    /// The approximate number of cached thumbnails.
    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }
}
