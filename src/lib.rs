//! # cachemeter
//!
//! Multi-tenant cache-aside and idempotent token usage metering for RAG
//! services.
//!
//! Two cooperating halves share one storage stack:
//!
//! - [`cache`]: tenant-namespaced keys, a local plus shared two-layer cache
//!   and a cache-aside orchestrator that falls through cache, source and
//!   generator.
//! - [`metering`]: exactly-once token accounting into per-tenant summary,
//!   daily and monthly rollups, with cross-tenant attribution for shared
//!   agents.
//!
//! ## Cache-aside
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
//! let resolved = cache
//!     .cache_aside::<String>(key)
//!     .generate(|_ctx| async { Ok(Some("summary".to_string())) })
//!     .resolve()
//!     .await?;
//! println!("{:?} via {}", resolved.value, resolved.metrics.source);
//! # Ok(())
//! # }
//! ```
//!
//! ## Metering
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use cachemeter::metering::{MemoryUsageStore, Operation, TokenType, UsageEvent, UsageTracker};
//!
//! # async fn example() {
//! let tracker = UsageTracker::new(Arc::new(MemoryUsageStore::new()));
//! let recorded = tracker
//!     .track_usage(
//!         UsageEvent::new("tenant-a", 150)
//!             .token_type(TokenType::Embedding)
//!             .operation(Operation::VectorSearch)
//!             .idempotency_key("tenant-a:emb:coll1:op1"),
//!     )
//!     .await;
//! assert!(recorded);
//! # }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod cache;
pub mod config;
pub mod metering;
pub mod observability;
pub mod redact;

pub use cache::{
    CacheAside, CacheError, CacheKey, CacheManager, CacheScope, DataType, MemoryStore,
    ResolveSource, Resolved, SharedStore, Ttl, TtlTier,
};
pub use config::{ConfigBuilder, ConfigError, Settings};
pub use metering::{
    AttributionResolver, IdempotencyKey, MemoryUsageStore, MeteringError, Operation, TokenType,
    UsageEvent, UsageStore, UsageTracker,
};
pub use observability::{MetricsRegistry, MetricsSummary, ObservabilityConfig};

use std::time::Duration;

/// Error type for cachemeter operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Cache key construction or shared store failure.
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    /// Usage metering failure.
    #[error("Metering error: {0}")]
    Metering(#[from] MeteringError),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("JSON parsing failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A cache-aside callback exceeded its limit.
    #[error("Operation timed out after {:.1}s", .0.as_secs_f64())]
    Timeout(Duration),

    /// The authoritative source failed with a non-recoverable error.
    #[error("Source fetch failed: {message}")]
    Source { message: String },

    /// The generator failed.
    #[error("Generation failed: {message}")]
    Generate { message: String },
}

/// Error category for unified error handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Configuration, key validation or input errors
    Configuration,
    /// Store or timeout errors that may succeed on retry
    Transient,
    /// Failures raised by caller-supplied callbacks
    Callback,
    /// Internal errors (IO, JSON, unexpected states)
    Internal,
}

impl Error {
    pub fn generate(message: impl Into<String>) -> Self {
        Error::Generate {
            message: message.into(),
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Config(_)
            | Error::Cache(CacheError::InvalidKey { .. })
            | Error::Metering(MeteringError::Validation { .. }) => ErrorCategory::Configuration,

            Error::Cache(CacheError::Store { .. })
            | Error::Metering(MeteringError::Storage { .. })
            | Error::Timeout(_) => ErrorCategory::Transient,

            Error::Source { .. } | Error::Generate { .. } => ErrorCategory::Callback,

            Error::Cache(CacheError::Serialization(_))
            | Error::Metering(MeteringError::Serialization(_))
            | Error::Json(_)
            | Error::Io(_) => ErrorCategory::Internal,
        }
    }

    pub fn is_configuration_error(&self) -> bool {
        self.category() == ErrorCategory::Configuration
    }

    pub fn is_retryable(&self) -> bool {
        self.category() == ErrorCategory::Transient
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::Serialization(e) => Error::Json(e),
            ConfigError::Io(e) => Error::Io(e),
            other => Error::Config(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
