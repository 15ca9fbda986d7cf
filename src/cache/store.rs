//! Shared (cross-process) cache layer.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::time::Instant;

use super::CacheResult;

/// Payload read back from the shared layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredValue {
    pub payload: String,
    /// Remaining lifetime; `None` for entries without expiry.
    pub ttl_remaining: Option<Duration>,
}

/// Durable key/value layer shared by every service instance.
#[async_trait]
pub trait SharedStore: Send + Sync {
    fn name(&self) -> &str;

    async fn get(&self, key: &str) -> CacheResult<Option<StoredValue>>;

    async fn set(&self, key: &str, payload: &str, ttl: Option<Duration>) -> CacheResult<()>;

    /// Delete keys, returning how many existed.
    async fn delete(&self, keys: &[String]) -> CacheResult<u64>;

    /// Keys starting with `prefix`. Used for hierarchical and tenant-wide lookups.
    async fn keys_with_prefix(&self, prefix: &str) -> CacheResult<Vec<String>>;
}

/// Low-level list and lock primitives operating on the shared layer only.
///
/// These never touch the in-process cache and are meant for queues and
/// exclusive locks, not cached values.
#[async_trait]
pub trait SharedListOps: Send + Sync {
    /// Append to the tail, returning the new length.
    async fn rpush(&self, key: &str, value: &str) -> CacheResult<u64>;

    async fn lpop(&self, key: &str) -> CacheResult<Option<String>>;

    /// Inclusive range with Redis index semantics (negative counts from the end).
    async fn lrange(&self, key: &str, start: i64, stop: i64) -> CacheResult<Vec<String>>;

    /// Set only if absent. Returns `true` when this call created the key.
    async fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>) -> CacheResult<bool>;
}

#[derive(Debug, Clone)]
struct MemoryEntry {
    payload: String,
    expires_at: Option<Instant>,
}

impl MemoryEntry {
    fn new(payload: &str, ttl: Option<Duration>) -> Self {
        Self {
            payload: payload.to_string(),
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// In-memory shared layer (for testing and single-instance deployments).
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<String, MemoryEntry>,
    lists: DashMap<String, VecDeque<String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live (unexpired) entries.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.iter().filter(|e| !e.is_expired(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop expired entries.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, e| !e.is_expired(now));
        before - self.entries.len()
    }

    pub fn clear(&self) {
        self.entries.clear();
        self.lists.clear();
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn get(&self, key: &str) -> CacheResult<Option<StoredValue>> {
        let now = Instant::now();
        let Some(entry) = self.entries.get(key).map(|e| e.value().clone()) else {
            return Ok(None);
        };

        if entry.is_expired(now) {
            self.entries.remove_if(key, |_, e| e.is_expired(now));
            return Ok(None);
        }

        Ok(Some(StoredValue {
            payload: entry.payload,
            ttl_remaining: entry.expires_at.map(|at| at.saturating_duration_since(now)),
        }))
    }

    async fn set(&self, key: &str, payload: &str, ttl: Option<Duration>) -> CacheResult<()> {
        self.entries
            .insert(key.to_string(), MemoryEntry::new(payload, ttl));
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> CacheResult<u64> {
        let now = Instant::now();
        let mut deleted = 0;
        for key in keys {
            if let Some((_, entry)) = self.entries.remove(key)
                && !entry.is_expired(now)
            {
                deleted += 1;
            }
            if self.lists.remove(key).is_some() {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    async fn keys_with_prefix(&self, prefix: &str) -> CacheResult<Vec<String>> {
        let now = Instant::now();
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.key().starts_with(prefix) && !e.is_expired(now))
            .map(|e| e.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}

#[async_trait]
impl SharedListOps for MemoryStore {
    async fn rpush(&self, key: &str, value: &str) -> CacheResult<u64> {
        let mut list = self.lists.entry(key.to_string()).or_default();
        list.push_back(value.to_string());
        Ok(list.len() as u64)
    }

    async fn lpop(&self, key: &str) -> CacheResult<Option<String>> {
        let popped = self
            .lists
            .get_mut(key)
            .and_then(|mut list| list.pop_front());
        self.lists.remove_if(key, |_, list| list.is_empty());
        Ok(popped)
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> CacheResult<Vec<String>> {
        let Some(list) = self.lists.get(key) else {
            return Ok(Vec::new());
        };

        let len = list.len() as i64;
        let start = if start < 0 { (len + start).max(0) } else { start };
        let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };

        if start > stop || start >= len {
            return Ok(Vec::new());
        }

        Ok(list
            .iter()
            .skip(start as usize)
            .take((stop - start + 1) as usize)
            .cloned()
            .collect())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>) -> CacheResult<bool> {
        let now = Instant::now();
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired(now) {
                    occupied.insert(MemoryEntry::new(value, ttl));
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(MemoryEntry::new(value, ttl));
                Ok(true)
            }
        }
    }
}
