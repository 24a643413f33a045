use std::num::NonZeroUsize;
use std::sync::Mutex;

use lru::LruCache;
use tracing::debug;

use crate::provider::GeocodeHit;

const DEFAULT_CAPACITY: usize = 10_000;

/// Memoizes geocode lookups by normalized query.
///
/// Negative results (`None`) are cached too, for the lifetime of the cache —
/// a batch builds one resolver, so exhausted queries are not re-asked within
/// the batch, and nothing negative survives a restart.
pub struct QueryCache {
    entries: Mutex<LruCache<String, Option<GeocodeHit>>>,
}

impl QueryCache {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("non-zero capacity");
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Lowercase, collapse runs of whitespace, strip trailing punctuation.
    pub fn normalize(query: &str) -> String {
        let lowered = query.to_lowercase();
        let collapsed = lowered.split_whitespace().collect::<Vec<_>>().join(" ");
        collapsed
            .trim_end_matches(['.', ',', ';', ':', '!', '?'])
            .to_string()
    }

    /// Outer `None` = never looked up; `Some(None)` = cached miss.
    pub fn get(&self, query: &str) -> Option<Option<GeocodeHit>> {
        let key = Self::normalize(query);
        let mut entries = self.entries.lock().expect("cache lock poisoned");
        let hit = entries.get(&key).cloned();
        if hit.is_some() {
            debug!(query = %key, "geocode cache hit");
        }
        hit
    }

    pub fn put(&self, query: &str, result: Option<GeocodeHit>) {
        let key = Self::normalize(query);
        let mut entries = self.entries.lock().expect("cache lock poisoned");
        entries.put(key, result);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("cache lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for QueryCache {
    fn default() -> Self {
        Self::new()
    }
}
