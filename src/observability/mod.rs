//! Observability: structured tracing and in-process metrics.
//!
//! Cache and metering operations log through `tracing` and count into a
//! shared [`MetricsRegistry`]. Enable the `subscriber` feature for a ready
//! made `tracing-subscriber` setup:
//!
//! ```rust,ignore
//! use cachemeter::observability::{TracingConfig, init_tracing};
//!
//! init_tracing(&TracingConfig::new())?;
//! ```

mod metrics;
mod spans;

pub use metrics::{
    CacheLayer, Counter, Gauge, GaugeGuard, Histogram, MetricsConfig, MetricsRegistry, MetricsSummary,
};
pub use spans::{
    DEFAULT_SERVICE_NAME, TracingConfig, TracingLevel, resolve_span, service_span, usage_span,
};

use std::sync::Arc;

/// Observability configuration combining tracing and metrics.
#[derive(Clone, Debug, Default)]
pub struct ObservabilityConfig {
    pub tracing: TracingConfig,
    pub metrics: MetricsConfig,
}

impl ObservabilityConfig {
    pub fn new() -> Self {
        Self {
            tracing: TracingConfig::new(),
            metrics: MetricsConfig::new(),
        }
    }

    pub fn tracing(mut self, config: TracingConfig) -> Self {
        self.tracing = config;
        self
    }

    pub fn metrics(mut self, config: MetricsConfig) -> Self {
        self.metrics = config;
        self
    }

    pub fn service_name(mut self, name: impl Into<String>) -> Self {
        self.tracing.service_name = Some(name.into());
        self
    }

    pub fn build_registry(&self) -> Arc<MetricsRegistry> {
        Arc::new(MetricsRegistry::new(&self.metrics))
    }
}

/// Install a global `fmt` subscriber filtered by `RUST_LOG`, falling back to
/// the configured level.
#[cfg(feature = "subscriber")]
pub fn init_tracing(config: &TracingConfig) -> crate::Result<()> {
    use tracing_subscriber::EnvFilter;

    if !config.enabled {
        return Ok(());
    }

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_filter()));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .try_init()
        .map_err(|e| crate::Error::Config(format!("Failed to init subscriber: {}", e)))?;

    tracing::info!(service = config.service_name(), "Tracing initialized");
    Ok(())
}
