//! Two-level cache manager.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

use super::aside::CacheAside;
use super::key::{CacheKey, DataType, validate_tenant};
use super::local::LocalCache;
use super::store::SharedStore;
use super::ttl::{Ttl, TtlPolicy};
use super::{CacheError, CacheResult};
use crate::config::CacheSettings;
use crate::observability::{CacheLayer, MetricsRegistry};
use crate::redact;

const DELETE_BATCH: usize = 500;

/// Tenant-scoped cache over an optional in-process layer and a shared store.
///
/// Build once at startup and share it as `Arc<CacheManager>`.
pub struct CacheManager {
    local: Option<LocalCache>,
    shared: Arc<dyn SharedStore>,
    ttl_policy: TtlPolicy,
    callback_timeout: Option<Duration>,
    metrics: Arc<MetricsRegistry>,
}

pub struct CacheManagerBuilder {
    shared: Arc<dyn SharedStore>,
    local_max_entries: Option<usize>,
    ttl_policy: TtlPolicy,
    callback_timeout: Option<Duration>,
    metrics: Option<Arc<MetricsRegistry>>,
}

impl CacheManagerBuilder {
    /// Enable the in-process layer with the given capacity.
    pub fn local_layer(mut self, max_entries: usize) -> Self {
        self.local_max_entries = Some(max_entries);
        self
    }

    pub fn without_local_layer(mut self) -> Self {
        self.local_max_entries = None;
        self
    }

    pub fn ttl_policy(mut self, policy: TtlPolicy) -> Self {
        self.ttl_policy = policy;
        self
    }

    /// Default timeout applied to cache-aside callbacks.
    pub fn callback_timeout(mut self, timeout: Duration) -> Self {
        self.callback_timeout = Some(timeout);
        self
    }

    pub fn metrics(mut self, metrics: Arc<MetricsRegistry>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Apply loaded settings on top of the current builder state.
    pub fn settings(mut self, settings: &CacheSettings) -> Self {
        self.local_max_entries = settings.local_enabled.then_some(settings.local_max_entries);
        self.ttl_policy = settings.ttl_policy();
        self.callback_timeout = settings.callback_timeout;
        self
    }

    pub fn build(self) -> CacheManager {
        CacheManager {
            local: self.local_max_entries.map(LocalCache::new),
            shared: self.shared,
            ttl_policy: self.ttl_policy,
            callback_timeout: self.callback_timeout,
            metrics: self.metrics.unwrap_or_default(),
        }
    }
}

impl CacheManager {
    pub fn builder(shared: Arc<dyn SharedStore>) -> CacheManagerBuilder {
        CacheManagerBuilder {
            shared,
            local_max_entries: None,
            ttl_policy: TtlPolicy::default(),
            callback_timeout: None,
            metrics: None,
        }
    }

    pub fn from_settings(shared: Arc<dyn SharedStore>, settings: &CacheSettings) -> Self {
        Self::builder(shared).settings(settings).build()
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    pub fn ttl_policy(&self) -> &TtlPolicy {
        &self.ttl_policy
    }

    /// The shared layer, for [`SharedListOps`](super::SharedListOps)-style
    /// access that must bypass the in-process cache.
    pub fn shared_store(&self) -> &Arc<dyn SharedStore> {
        &self.shared
    }

    pub fn has_local_layer(&self) -> bool {
        self.local.is_some()
    }

    pub(crate) fn callback_timeout(&self) -> Option<Duration> {
        self.callback_timeout
    }

    /// Look a key up, in-process layer first.
    ///
    /// Shared-store failures and undecodable payloads are reported as misses.
    pub async fn get(&self, key: &CacheKey) -> Option<Value> {
        let start = Instant::now();
        let rendered = key.render();

        if let Some(local) = &self.local
            && let Some(hit) = local.get(&rendered)
        {
            self.metrics
                .record_cache_get(Some(CacheLayer::Local), start.elapsed(), hit.size);
            debug!(key = %rendered, layer = "local", "Cache hit");
            return Some(hit.value);
        }

        let stored = match self.shared.get(&rendered).await {
            Ok(stored) => stored,
            Err(e) => {
                warn!(
                    key = %rendered,
                    store = self.shared.name(),
                    error = %e,
                    "Shared cache read failed, treating as miss"
                );
                self.metrics.record_cache_error();
                self.metrics.record_cache_get(None, start.elapsed(), 0);
                return None;
            }
        };

        let Some(stored) = stored else {
            self.metrics.record_cache_get(None, start.elapsed(), 0);
            debug!(key = %rendered, "Cache miss");
            return None;
        };

        match serde_json::from_str::<Value>(&stored.payload) {
            Ok(value) => {
                if let Some(local) = &self.local {
                    local.insert(
                        rendered.clone(),
                        value.clone(),
                        stored.payload.len(),
                        stored.ttl_remaining,
                    );
                }
                self.metrics.record_cache_get(
                    Some(CacheLayer::Shared),
                    start.elapsed(),
                    stored.payload.len(),
                );
                debug!(key = %rendered, layer = "shared", "Cache hit");
                Some(value)
            }
            Err(e) => {
                warn!(
                    key = %rendered,
                    error = %e,
                    payload = %redact::preview(&stored.payload, 120),
                    "Discarding undecodable cache payload"
                );
                self.metrics.record_cache_error();
                self.metrics.record_cache_get(None, start.elapsed(), 0);
                None
            }
        }
    }

    /// Store a value. `ttl = None` applies the data type's default tier.
    ///
    /// The shared layer is written first; on failure the in-process copy is
    /// dropped so the two layers cannot disagree.
    pub async fn set(&self, key: &CacheKey, value: &Value, ttl: Option<Ttl>) -> CacheResult<()> {
        let start = Instant::now();
        let rendered = key.render();
        let ttl = self.ttl_policy.resolve(key.data_type(), ttl);

        if ttl.is_some_and(|ttl| ttl.is_zero()) {
            debug!(key = %rendered, "Zero TTL, removing instead of storing");
            self.delete(key).await?;
            return Ok(());
        }

        let payload = serde_json::to_string(value)?;

        if let Err(e) = self.shared.set(&rendered, &payload, ttl).await {
            if let Some(local) = &self.local {
                local.remove(&rendered);
            }
            self.metrics.record_cache_error();
            warn!(key = %rendered, store = self.shared.name(), error = %e, "Shared cache write failed");
            return Err(e);
        }

        if let Some(local) = &self.local {
            local.insert(rendered, value.clone(), payload.len(), ttl);
        }
        self.metrics.record_cache_set(start.elapsed(), payload.len());
        Ok(())
    }

    /// Typed read. A payload that does not decode as `T` is a miss.
    pub async fn get_json<T: DeserializeOwned>(&self, key: &CacheKey) -> Option<T> {
        let value = self.get(key).await?;
        match serde_json::from_value(value) {
            Ok(typed) => Some(typed),
            Err(e) => {
                debug!(key = %key, error = %e, "Cached value has unexpected shape");
                None
            }
        }
    }

    /// Typed write. Serialization failures surface as
    /// [`CacheError::Serialization`].
    pub async fn set_json<T: Serialize + ?Sized>(
        &self,
        key: &CacheKey,
        value: &T,
        ttl: Option<Ttl>,
    ) -> CacheResult<()> {
        let value = serde_json::to_value(value).map_err(|e| {
            warn!(
                key = %key,
                error = %redact::redact(&e.to_string()),
                "Failed to serialize cache value"
            );
            CacheError::Serialization(e)
        })?;
        self.set(key, &value, ttl).await
    }

    /// Remove a key from both layers. Returns whether the shared layer held it.
    pub async fn delete(&self, key: &CacheKey) -> CacheResult<bool> {
        let rendered = key.render();
        if let Some(local) = &self.local {
            local.remove(&rendered);
        }

        let deleted = self.shared.delete(&[rendered]).await.inspect_err(|_| {
            self.metrics.record_cache_error();
        })?;
        self.metrics.record_cache_delete(deleted);
        Ok(deleted > 0)
    }

    /// Remove a key and everything derived from it.
    ///
    /// Documents also drop their embedding and vector-store entries.
    pub async fn invalidate(&self, key: &CacheKey) -> CacheResult<u64> {
        let related: Vec<(DataType, String)> = dependents(key.data_type())
            .iter()
            .map(|dt| (*dt, key.resource_id().to_string()))
            .collect();
        self.invalidate_related(key, &related).await
    }

    /// Remove `key` plus the given `(data_type, resource_id)` siblings
    /// (same tenant and scope) in a single shared-store call.
    pub async fn invalidate_related(
        &self,
        key: &CacheKey,
        related: &[(DataType, String)],
    ) -> CacheResult<u64> {
        let mut keys = vec![key.render()];
        for (data_type, resource_id) in related {
            keys.push(key.sibling(*data_type, resource_id.clone())?.render());
        }

        if let Some(local) = &self.local {
            for k in &keys {
                local.remove(k);
            }
        }

        let deleted = self.shared.delete(&keys).await.inspect_err(|_| {
            self.metrics.record_cache_error();
        })?;
        self.metrics.record_cache_delete(deleted);
        debug!(key = %key, related = related.len(), deleted, "Invalidated cache entries");
        Ok(deleted)
    }

    /// Drop every entry of a tenant, optionally limited to one data type.
    pub async fn invalidate_tenant(
        &self,
        tenant_id: &str,
        data_type: Option<DataType>,
    ) -> CacheResult<u64> {
        validate_tenant(tenant_id)?;
        let prefix = match data_type {
            Some(dt) => CacheKey::data_type_prefix(tenant_id, dt),
            None => CacheKey::tenant_prefix(tenant_id),
        };

        if let Some(local) = &self.local {
            local.remove_prefix(&prefix);
        }

        let keys = self.shared.keys_with_prefix(&prefix).await?;
        let mut deleted = 0;
        for chunk in keys.chunks(DELETE_BATCH) {
            deleted += self.shared.delete(chunk).await?;
        }
        self.metrics.record_cache_delete(deleted);
        debug!(tenant_id, prefix = %prefix, deleted, "Invalidated tenant cache");
        Ok(deleted)
    }

    /// Try `key`, then progressively less specific scopes down to the
    /// tenant-level key. Returns the key that hit.
    pub async fn get_with_fallback(&self, key: &CacheKey) -> Option<(CacheKey, Value)> {
        for candidate in key.fallbacks() {
            if let Some(value) = self.get(&candidate).await {
                return Some((candidate, value));
            }
        }
        None
    }

    /// Shared-layer keys starting with `prefix`.
    pub async fn keys_with_prefix(&self, prefix: &str) -> CacheResult<Vec<String>> {
        self.shared.keys_with_prefix(prefix).await
    }

    /// Start a cache-aside resolution for `key`.
    pub fn cache_aside<T>(&self, key: CacheKey) -> CacheAside<'_, T> {
        CacheAside::new(self, key)
    }
}

impl std::fmt::Debug for CacheManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheManager")
            .field("local", &self.local.as_ref().map(|l| l.len()))
            .field("shared", &self.shared.name())
            .field("ttl_policy", &self.ttl_policy)
            .finish()
    }
}

fn dependents(data_type: DataType) -> &'static [DataType] {
    match data_type {
        DataType::Document => &[DataType::Embedding, DataType::VectorStore],
        DataType::Collection => &[DataType::VectorStore],
        DataType::Conversation => &[DataType::QueryResult],
        _ => &[],
    }
}
