//! Cache-aside resolution: cache, then source, then generator.

use std::future::Future;
use std::marker::PhantomData;
use std::time::{Duration, Instant};

use futures::FutureExt;
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{Instrument, debug, warn};

use super::key::{CacheKey, CacheScope};
use super::manager::CacheManager;
use super::ttl::Ttl;
use crate::observability::resolve_span;
use crate::{Error, Result};

/// Where a resolved value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolveSource {
    Cache,
    Source,
    Generated,
    Miss,
}

impl ResolveSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cache => "cache",
            Self::Source => "source",
            Self::Generated => "generated",
            Self::Miss => "miss",
        }
    }
}

impl std::fmt::Display for ResolveSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResolveMetrics {
    pub source: ResolveSource,
    pub latency_ms: f64,
    pub cache_hit: bool,
}

/// Value plus how it was obtained.
#[derive(Debug, Clone)]
pub struct Resolved<T> {
    pub value: Option<T>,
    pub metrics: ResolveMetrics,
}

impl<T> Resolved<T> {
    pub fn into_parts(self) -> (Option<T>, ResolveMetrics) {
        (self.value, self.metrics)
    }

    pub fn source(&self) -> ResolveSource {
        self.metrics.source
    }
}

/// Arguments handed to fetch and generate callbacks.
#[derive(Debug, Clone)]
pub struct ResolveContext {
    pub resource_id: String,
    pub tenant_id: String,
    pub scope: CacheScope,
}

impl ResolveContext {
    fn from_key(key: &CacheKey) -> Self {
        Self {
            resource_id: key.resource_id().to_string(),
            tenant_id: key.tenant_id().to_string(),
            scope: key.scope().clone(),
        }
    }
}

/// Failure reported by a fetch-from-source callback.
///
/// Recoverable failures fall through to the generator; fatal ones abort the
/// resolution.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct SourceError {
    pub message: String,
    pub recoverable: bool,
}

impl SourceError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            recoverable: true,
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            recoverable: false,
        }
    }
}

type FetchFn<'a, T> = Box<
    dyn FnOnce(ResolveContext) -> BoxFuture<'a, std::result::Result<Option<T>, SourceError>>
        + Send
        + 'a,
>;
type GenerateFn<'a, T> =
    Box<dyn FnOnce(ResolveContext) -> BoxFuture<'a, Result<Option<T>>> + Send + 'a>;

/// Builder for one cache-aside resolution. Created by
/// [`CacheManager::cache_aside`].
#[must_use = "call resolve() to run the lookup"]
pub struct CacheAside<'a, T> {
    cache: &'a CacheManager,
    key: CacheKey,
    fetch: Option<FetchFn<'a, T>>,
    generate: Option<GenerateFn<'a, T>>,
    ttl: Option<Ttl>,
    cache_negative: bool,
    timeout: Option<Duration>,
    _marker: PhantomData<fn() -> T>,
}

impl<'a, T> CacheAside<'a, T> {
    pub(crate) fn new(cache: &'a CacheManager, key: CacheKey) -> Self {
        Self {
            timeout: cache.callback_timeout(),
            cache,
            key,
            fetch: None,
            generate: None,
            ttl: None,
            cache_negative: false,
            _marker: PhantomData,
        }
    }

    pub fn fetch_from_source<F, Fut>(mut self, fetch: F) -> Self
    where
        F: FnOnce(ResolveContext) -> Fut + Send + 'a,
        Fut: Future<Output = std::result::Result<Option<T>, SourceError>> + Send + 'a,
    {
        self.fetch = Some(Box::new(move |ctx| fetch(ctx).boxed()));
        self
    }

    pub fn generate<G, Fut>(mut self, generate: G) -> Self
    where
        G: FnOnce(ResolveContext) -> Fut + Send + 'a,
        Fut: Future<Output = Result<Option<T>>> + Send + 'a,
    {
        self.generate = Some(Box::new(move |ctx| generate(ctx).boxed()));
        self
    }

    /// Expiry for a stored result. Defaults to the data type's tier.
    pub fn ttl(mut self, ttl: impl Into<Ttl>) -> Self {
        self.ttl = Some(ttl.into());
        self
    }

    /// Store a `null` marker when nothing was found, so repeated misses are
    /// served from cache.
    pub fn cache_negative(mut self, enabled: bool) -> Self {
        self.cache_negative = enabled;
        self
    }

    /// Per-callback timeout. A timed-out fetch falls through to the
    /// generator; a timed-out generator fails with [`Error::Timeout`].
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl<'a, T> CacheAside<'a, T>
where
    T: Serialize + DeserializeOwned + Send + 'a,
{
    pub async fn resolve(self) -> Result<Resolved<T>> {
        let span = resolve_span(&self.key);
        let cache = self.cache;
        let start = Instant::now();

        let in_flight = cache.metrics().resolves_in_flight.track();
        let outcome = self.run().instrument(span.clone()).await;
        drop(in_flight);

        let (value, source) = outcome?;
        let elapsed = start.elapsed();
        let latency_ms = elapsed.as_secs_f64() * 1000.0;
        span.record("source", source.as_str());
        span.record("latency_ms", latency_ms);
        cache.metrics().record_resolve(source, elapsed);

        Ok(Resolved {
            value,
            metrics: ResolveMetrics {
                source,
                latency_ms,
                cache_hit: source == ResolveSource::Cache,
            },
        })
    }

    async fn run(self) -> Result<(Option<T>, ResolveSource)> {
        let Self {
            cache,
            key,
            fetch,
            generate,
            ttl,
            cache_negative,
            timeout,
            ..
        } = self;

        if let Some(cached) = cache.get(&key).await {
            if cached.is_null() {
                return Ok((None, ResolveSource::Cache));
            }
            match serde_json::from_value::<T>(cached) {
                Ok(value) => return Ok((Some(value), ResolveSource::Cache)),
                Err(e) => {
                    warn!(key = %key, error = %e, "Cached value does not match requested type, refetching");
                }
            }
        }

        if let Some(fetch) = fetch {
            let ctx = ResolveContext::from_key(&key);
            match with_timeout(timeout, fetch(ctx)).await {
                Some(Ok(Some(value))) => {
                    store(cache, &key, &value, ttl).await;
                    return Ok((Some(value), ResolveSource::Source));
                }
                Some(Ok(None)) => debug!(key = %key, "Source returned nothing"),
                Some(Err(e)) if e.recoverable => {
                    warn!(key = %key, error = %e, "Source fetch failed, falling through");
                }
                Some(Err(e)) => {
                    return Err(Error::Source { message: e.message });
                }
                None => {
                    warn!(key = %key, timeout_ms = timeout_ms(timeout), "Source fetch timed out, falling through");
                }
            }
        }

        if let Some(generate) = generate {
            let ctx = ResolveContext::from_key(&key);
            let generated = match with_timeout(timeout, generate(ctx)).await {
                Some(result) => result?,
                None => {
                    let limit = timeout.unwrap_or_default();
                    warn!(key = %key, timeout_ms = limit.as_millis() as u64, "Generator timed out");
                    return Err(Error::Timeout(limit));
                }
            };
            if let Some(value) = generated {
                store(cache, &key, &value, ttl).await;
                return Ok((Some(value), ResolveSource::Generated));
            }
        }

        if cache_negative && let Err(e) = cache.set(&key, &Value::Null, ttl).await {
            warn!(key = %key, error = %e, "Failed to cache negative result");
        }
        Ok((None, ResolveSource::Miss))
    }
}

async fn with_timeout<F: Future>(timeout: Option<Duration>, fut: F) -> Option<F::Output> {
    match timeout {
        Some(limit) => tokio::time::timeout(limit, fut).await.ok(),
        None => Some(fut.await),
    }
}

fn timeout_ms(timeout: Option<Duration>) -> u64 {
    timeout.map(|t| t.as_millis() as u64).unwrap_or_default()
}

async fn store<T: Serialize>(cache: &CacheManager, key: &CacheKey, value: &T, ttl: Option<Ttl>) {
    if let Err(e) = cache.set_json(key, value, ttl).await {
        warn!(key = %key, error = %e, "Failed to cache resolved value");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{DataType, MemoryStore, SharedStore};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn cache() -> CacheManager {
        CacheManager::builder(Arc::new(MemoryStore::new()))
            .local_layer(100)
            .build()
    }

    fn key() -> CacheKey {
        CacheKey::new(DataType::Document, "doc-1", "t1").unwrap()
    }

    #[tokio::test]
    async fn test_round_trip_source_then_cache() {
        let cache = cache();
        let fetches = AtomicUsize::new(0);

        let first = cache
            .cache_aside::<String>(key())
            .fetch_from_source(|ctx| {
                fetches.fetch_add(1, Ordering::SeqCst);
                async move { Ok(Some(format!("{}/{}", ctx.tenant_id, ctx.resource_id))) }
            })
            .resolve()
            .await
            .unwrap();
        assert_eq!(first.value.as_deref(), Some("t1/doc-1"));
        assert_eq!(first.metrics.source, ResolveSource::Source);
        assert!(!first.metrics.cache_hit);

        let second = cache
            .cache_aside::<String>(key())
            .fetch_from_source(|_| {
                fetches.fetch_add(1, Ordering::SeqCst);
                async { Ok(Some("other".to_string())) }
            })
            .resolve()
            .await
            .unwrap();
        assert_eq!(second.value.as_deref(), Some("t1/doc-1"));
        assert_eq!(second.metrics.source, ResolveSource::Cache);
        assert!(second.metrics.cache_hit);
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fallthrough_generates_once() {
        let cache = cache();
        let generated = AtomicUsize::new(0);

        for expected in [ResolveSource::Generated, ResolveSource::Cache] {
            let resolved = cache
                .cache_aside::<Vec<f32>>(key())
                .fetch_from_source(|_| async { Ok(None) })
                .generate(|_| {
                    generated.fetch_add(1, Ordering::SeqCst);
                    async { Ok(Some(vec![0.5, 0.25])) }
                })
                .resolve()
                .await
                .unwrap();
            assert_eq!(resolved.source(), expected);
            assert_eq!(resolved.value, Some(vec![0.5, 0.25]));
        }
        assert_eq!(generated.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_recoverable_fetch_error_falls_through() {
        let cache = cache();
        let resolved = cache
            .cache_aside::<String>(key())
            .fetch_from_source(|_| async { Err(SourceError::transient("db down")) })
            .generate(|_| async { Ok(Some("fresh".to_string())) })
            .resolve()
            .await
            .unwrap();
        assert_eq!(resolved.source(), ResolveSource::Generated);
    }

    #[tokio::test]
    async fn test_fatal_fetch_error_propagates() {
        let cache = cache();
        let err = cache
            .cache_aside::<String>(key())
            .fetch_from_source(|_| async { Err(SourceError::fatal("permission denied")) })
            .generate(|_| async { Ok(Some("unused".to_string())) })
            .resolve()
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Source { .. }));
    }

    #[tokio::test]
    async fn test_generate_error_propagates() {
        let cache = cache();
        let err = cache
            .cache_aside::<String>(key())
            .generate(|_| async {
                Err(Error::Generate {
                    message: "model unavailable".into(),
                })
            })
            .resolve()
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Generate { .. }));
        assert_eq!(cache.metrics().resolves_in_flight.get(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_resolve_releases_in_flight() {
        let cache = cache();
        let resolve = cache
            .cache_aside::<String>(key())
            .generate(|_| async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(Some("late".to_string()))
            })
            .resolve();

        let outcome = tokio::time::timeout(Duration::from_millis(10), resolve).await;
        assert!(outcome.is_err());
        assert_eq!(cache.metrics().resolves_in_flight.get(), 0);
        assert!(cache.get(&key()).await.is_none());
    }

    #[tokio::test]
    async fn test_miss_not_cached_by_default() {
        let cache = cache();
        let resolved = cache
            .cache_aside::<String>(key())
            .resolve()
            .await
            .unwrap();
        assert_eq!(resolved.source(), ResolveSource::Miss);
        assert!(resolved.value.is_none());
        assert!(cache.get(&key()).await.is_none());
    }

    #[tokio::test]
    async fn test_negative_caching_opt_in() {
        let cache = cache();
        let resolved = cache
            .cache_aside::<String>(key())
            .fetch_from_source(|_| async { Ok(None) })
            .cache_negative(true)
            .resolve()
            .await
            .unwrap();
        assert_eq!(resolved.source(), ResolveSource::Miss);

        let again = cache
            .cache_aside::<String>(key())
            .fetch_from_source(|_| async { Ok(Some("late".to_string())) })
            .resolve()
            .await
            .unwrap();
        assert_eq!(again.source(), ResolveSource::Cache);
        assert!(again.value.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_timeout_falls_through_generate_timeout_errors() {
        let cache = cache();
        let resolved = cache
            .cache_aside::<String>(key())
            .timeout(Duration::from_millis(50))
            .fetch_from_source(|_| async {
                tokio::time::sleep(Duration::from_secs(1)).await;
                Ok(Some("slow".to_string()))
            })
            .generate(|_| async { Ok(Some("fast".to_string())) })
            .resolve()
            .await
            .unwrap();
        assert_eq!(resolved.value.as_deref(), Some("fast"));

        let other = CacheKey::new(DataType::Document, "doc-2", "t1").unwrap();
        let err = cache
            .cache_aside::<String>(other)
            .timeout(Duration::from_millis(50))
            .generate(|_| async {
                tokio::time::sleep(Duration::from_secs(1)).await;
                Ok(Some("slow".to_string()))
            })
            .resolve()
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
    }

    #[tokio::test]
    async fn test_store_failure_still_returns_value() {
        use crate::cache::{CacheError, CacheResult, StoredValue};
        use async_trait::async_trait;

        struct ReadOnlyStore;

        #[async_trait]
        impl SharedStore for ReadOnlyStore {
            fn name(&self) -> &str {
                "read-only"
            }
            async fn get(&self, _key: &str) -> CacheResult<Option<StoredValue>> {
                Ok(None)
            }
            async fn set(&self, _key: &str, _payload: &str, _ttl: Option<Duration>) -> CacheResult<()> {
                Err(CacheError::store("READONLY"))
            }
            async fn delete(&self, _keys: &[String]) -> CacheResult<u64> {
                Ok(0)
            }
            async fn keys_with_prefix(&self, _prefix: &str) -> CacheResult<Vec<String>> {
                Ok(Vec::new())
            }
        }

        let cache = CacheManager::builder(Arc::new(ReadOnlyStore)).build();
        let resolved = cache
            .cache_aside::<String>(key())
            .fetch_from_source(|_| async { Ok(Some("value".to_string())) })
            .resolve()
            .await
            .unwrap();
        assert_eq!(resolved.value.as_deref(), Some("value"));
        assert_eq!(resolved.source(), ResolveSource::Source);
    }

    #[tokio::test]
    async fn test_metrics_recorded() {
        let cache = cache();
        cache
            .cache_aside::<u32>(key())
            .generate(|_| async { Ok(Some(7)) })
            .resolve()
            .await
            .unwrap();
        cache.cache_aside::<u32>(key()).resolve().await.unwrap();

        let summary = cache.metrics().summary();
        assert_eq!(summary.resolve_generated, 1);
        assert_eq!(summary.resolve_from_cache, 1);
    }
}
