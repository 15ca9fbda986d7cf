//! In-process cache layer (non-durable, process lifetime only).

use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tokio::time::Instant;

const DEFAULT_MAX_ENTRIES: usize = 10_000;

#[derive(Debug, Clone)]
struct LocalEntry {
    value: Value,
    /// Length of the serialized payload the value was decoded from.
    size: usize,
    inserted_at: Instant,
    expires_at: Option<Instant>,
}

impl LocalEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// A live local entry.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalHit {
    pub value: Value,
    pub ttl_remaining: Option<Duration>,
    pub size: usize,
}

/// Bounded in-process map of decoded values.
///
/// On overflow, expired entries are purged first; if still full the oldest
/// insertion is evicted.
#[derive(Debug)]
pub struct LocalCache {
    entries: DashMap<String, LocalEntry>,
    max_entries: usize,
}

impl Default for LocalCache {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ENTRIES)
    }
}

impl LocalCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            max_entries: max_entries.max(1),
        }
    }

    pub fn get(&self, key: &str) -> Option<LocalHit> {
        let now = Instant::now();
        let entry = self.entries.get(key).map(|e| e.value().clone())?;

        if entry.is_expired(now) {
            self.entries.remove_if(key, |_, e| e.is_expired(now));
            return None;
        }

        Some(LocalHit {
            ttl_remaining: entry
                .expires_at
                .map(|at| at.saturating_duration_since(now)),
            value: entry.value,
            size: entry.size,
        })
    }

    pub fn insert(
        &self,
        key: impl Into<String>,
        value: Value,
        size: usize,
        ttl: Option<Duration>,
    ) {
        if ttl.is_some_and(|ttl| ttl.is_zero()) {
            return;
        }

        let key = key.into();
        if self.entries.len() >= self.max_entries && !self.entries.contains_key(&key) {
            self.make_room();
        }

        let now = Instant::now();
        self.entries.insert(
            key,
            LocalEntry {
                value,
                size,
                inserted_at: now,
                expires_at: ttl.map(|ttl| now + ttl),
            },
        );
    }

    pub fn remove(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    pub fn remove_prefix(&self, prefix: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|k, _| !k.starts_with(prefix));
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    fn make_room(&self) {
        let now = Instant::now();
        self.entries.retain(|_, e| !e.is_expired(now));
        if self.entries.len() < self.max_entries {
            return;
        }

        let oldest = self
            .entries
            .iter()
            .min_by_key(|e| e.inserted_at)
            .map(|e| e.key().clone());
        if let Some(key) = oldest {
            self.entries.remove(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test(start_paused = true)]
    async fn test_local_cache_ttl() {
        let cache = LocalCache::new(10);
        cache.insert("k", json!({"v": 1}), 7, Some(Duration::from_secs(5)));

        let hit = cache.get("k").unwrap();
        assert_eq!(hit.value, json!({"v": 1}));
        assert_eq!(hit.ttl_remaining, Some(Duration::from_secs(5)));
        assert_eq!(hit.size, 7);

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(cache.get("k").is_none());
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_cache_evicts_oldest_when_full() {
        let cache = LocalCache::new(2);
        cache.insert("a", json!(1), 1, None);
        tokio::time::advance(Duration::from_millis(1)).await;
        cache.insert("b", json!(2), 1, None);
        tokio::time::advance(Duration::from_millis(1)).await;
        cache.insert("c", json!(3), 1, None);

        assert_eq!(cache.len(), 2);
        assert!(cache.get("a").is_none());
        assert!(cache.get("b").is_some());
        assert!(cache.get("c").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_cache_prefers_evicting_expired() {
        let cache = LocalCache::new(2);
        cache.insert("old", json!(1), 1, None);
        cache.insert("short", json!(2), 1, Some(Duration::from_secs(1)));
        tokio::time::advance(Duration::from_secs(2)).await;

        cache.insert("new", json!(3), 1, None);
        assert!(cache.get("old").is_some());
        assert!(cache.get("new").is_some());
    }

    #[tokio::test]
    async fn test_remove_prefix() {
        let cache = LocalCache::default();
        cache.insert("t1:document:a", json!(1), 1, None);
        cache.insert("t1:embedding:a", json!(2), 1, None);
        cache.insert("t2:document:a", json!(3), 1, None);

        assert_eq!(cache.remove_prefix("t1:"), 2);
        assert_eq!(cache.len(), 1);
        assert!(cache.remove("t2:document:a"));
    }

    #[tokio::test]
    async fn test_zero_ttl_not_stored() {
        let cache = LocalCache::default();
        cache.insert("k", json!(1), 1, Some(Duration::ZERO));
        assert!(cache.is_empty());
    }
}
