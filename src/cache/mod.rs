//! Tenant-scoped, multi-level cache with cache-aside orchestration.
//!
//! [`CacheManager`] layers an optional in-process cache over a shared store
//! ([`MemoryStore`], or `RedisStore` with the `redis-backend` feature).
//! Reads are fail-soft: a shared-store outage turns into a miss. Writes
//! surface failures to the caller.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use cachemeter::cache::{CacheKey, CacheManager, DataType, MemoryStore};
//!
//! # async fn example() -> cachemeter::Result<()> {
//! let cache = CacheManager::builder(Arc::new(MemoryStore::new()))
//!     .local_layer(10_000)
//!     .build();
//!
//! let key = CacheKey::new(DataType::Document, "doc-42", "tenant-a")?;
//! let (doc, metrics) = cache
//!     .cache_aside::<String>(key)
//!     .fetch_from_source(|_ctx| async { Ok(Some("body".to_string())) })
//!     .resolve()
//!     .await?
//!     .into_parts();
//! # let _ = (doc, metrics);
//! # Ok(())
//! # }
//! ```

pub mod aside;
pub mod key;
mod local;
mod manager;
#[cfg(feature = "redis-backend")]
pub mod redis;
pub mod store;
pub mod ttl;

pub use aside::{CacheAside, ResolveContext, ResolveMetrics, ResolveSource, Resolved, SourceError};
pub use key::{CacheKey, CacheScope, DataType, SYSTEM_TENANT};
pub(crate) use key::validate_prefix;
pub use local::{LocalCache, LocalHit};
pub use manager::{CacheManager, CacheManagerBuilder};
#[cfg(feature = "redis-backend")]
pub use redis::{RedisConfig, RedisStore};
pub use store::{MemoryStore, SharedListOps, SharedStore, StoredValue};
pub use ttl::{TTL_EXTENDED, TTL_SHORT, TTL_STANDARD, Ttl, TtlPolicy, TtlTier};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Invalid cache key: {message}")]
    InvalidKey { message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Cache store error: {message}")]
    Store { message: String },
}

impl CacheError {
    pub(crate) fn invalid_key(message: impl Into<String>) -> Self {
        Self::InvalidKey {
            message: message.into(),
        }
    }

    pub(crate) fn store(message: impl Into<String>) -> Self {
        Self::Store {
            message: message.into(),
        }
    }
}

pub type CacheResult<T> = std::result::Result<T, CacheError>;

/// Retry `operation` with exponential backoff while `is_retryable` holds.
#[cfg(feature = "redis-backend")]
pub(crate) async fn with_retry<F, Fut, T>(
    max_retries: u32,
    initial_backoff: std::time::Duration,
    max_backoff: std::time::Duration,
    is_retryable: impl Fn(&CacheError) -> bool,
    operation: F,
) -> CacheResult<T>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = CacheResult<T>>,
{
    let mut attempt = 0;
    let mut backoff = initial_backoff;

    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if attempt < max_retries && is_retryable(&e) => {
                attempt += 1;
                tracing::warn!(
                    attempt = attempt,
                    error = %e,
                    "Retrying shared cache operation after transient failure"
                );
                // 10% jitter in both directions
                let jitter_factor = 1.0 + (rand::random::<f64>() * 0.2 - 0.1);
                tokio::time::sleep(backoff.mul_f64(jitter_factor)).await;
                backoff = (backoff * 2).min(max_backoff);
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(feature = "redis-backend")]
pub(crate) trait StorageResultExt<T> {
    fn storage_err(self) -> CacheResult<T>;
    fn storage_err_ctx(self, context: &str) -> CacheResult<T>;
}

#[cfg(feature = "redis-backend")]
impl<T, E: std::fmt::Display> StorageResultExt<T> for std::result::Result<T, E> {
    fn storage_err(self) -> CacheResult<T> {
        self.map_err(|e| CacheError::store(e.to_string()))
    }

    fn storage_err_ctx(self, context: &str) -> CacheResult<T> {
        self.map_err(|e| CacheError::store(format!("{}: {}", context, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_error_display() {
        let err = CacheError::invalid_key("tenant_id must not be empty");
        assert!(err.to_string().contains("tenant_id"));

        let err = CacheError::store("connection refused");
        assert!(err.to_string().contains("connection refused"));
    }
}
