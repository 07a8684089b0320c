//! Process-wide TTL cache for `External` resolutions.
//!
//! Cache keys are `${var}` templates interpolated from session values, so
//! entries are session-scoped by construction. The cache is shared across
//! sessions; a plain mutex suffices because lookups never await.
//!
//! All operations take an explicit `Instant` through the `*_at` variants, and
//! the default path reads the tokio clock, so TTL expiry is testable with a
//! paused runtime instead of sleeping.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

use serde_json::Value;

#[derive(Debug, Clone)]
struct CacheEntry {
    value: Value,
    stored_at: Instant,
    ttl: Duration,
}

/// Shared TTL cache. Cheap to clone; clones share the same entries.
#[derive(Default)]
pub struct ResolutionCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl ResolutionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a live entry as of `now`. Expired entries are removed.
    pub fn get_at(&self, key: &str, now: Instant) -> Option<Value> {
        let mut entries = self.entries.lock().unwrap();
        match entries.get(key) {
            Some(entry) if now.duration_since(entry.stored_at) < entry.ttl => {
                Some(entry.value.clone())
            }
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.get_at(key, Instant::now())
    }

    pub fn insert_at(&self, key: impl Into<String>, value: Value, ttl: Duration, now: Instant) {
        self.entries.lock().unwrap().insert(
            key.into(),
            CacheEntry {
                value,
                stored_at: now,
                ttl,
            },
        );
    }

    pub fn insert(&self, key: impl Into<String>, value: Value, ttl: Duration) {
        self.insert_at(key, value, ttl, Instant::now());
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }
}
