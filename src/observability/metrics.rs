//! Metrics collection for the cache and metering paths.
//!
//! All recording is lock-free and infallible, so it can sit on hot paths
//! without ever failing the operation it observes.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use tracing::trace;

use crate::cache::ResolveSource;
use crate::metering::TokenType;

const METRICS_TARGET: &str = "cachemeter::metrics";

/// Metrics configuration.
#[derive(Clone, Debug, Default)]
pub struct MetricsConfig {
    pub enabled: bool,
    /// Emit a trace event per recorded operation in addition to counting it.
    pub emit_events: bool,
}

impl MetricsConfig {
    pub fn new() -> Self {
        Self {
            enabled: true,
            emit_events: true,
        }
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            emit_events: false,
        }
    }
}

/// Thread-safe atomic counter.
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Thread-safe atomic gauge.
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicI64,
}

impl Gauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, value: i64) {
        self.value.store(value, Ordering::Relaxed);
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        self.value.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }

    /// Increment now and decrement when the guard drops, even if the owning
    /// future is cancelled.
    pub fn track(&self) -> GaugeGuard<'_> {
        self.inc();
        GaugeGuard { gauge: self }
    }
}

#[must_use = "the gauge is decremented when the guard drops"]
pub struct GaugeGuard<'a> {
    gauge: &'a Gauge,
}

impl Drop for GaugeGuard<'_> {
    fn drop(&mut self) {
        self.gauge.dec();
    }
}

/// Simple histogram using fixed buckets.
#[derive(Debug)]
pub struct Histogram {
    buckets: Vec<AtomicU64>,
    bucket_bounds: Vec<f64>,
    sum: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    pub fn new(bucket_bounds: Vec<f64>) -> Self {
        let buckets = (0..=bucket_bounds.len())
            .map(|_| AtomicU64::new(0))
            .collect();
        Self {
            buckets,
            bucket_bounds,
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    /// Buckets tuned for cache round trips (sub-millisecond to one second).
    pub fn cache_latency() -> Self {
        Self::new(vec![
            0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 1000.0,
        ])
    }

    pub fn observe(&self, value: f64) {
        let bucket_idx = self
            .bucket_bounds
            .iter()
            .position(|&bound| value <= bound)
            .unwrap_or(self.bucket_bounds.len());

        self.buckets[bucket_idx].fetch_add(1, Ordering::Relaxed);
        self.sum
            .fetch_add((value * 1000.0) as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Observations that fell into the bucket at `idx` (last index is overflow).
    pub fn bucket_count(&self, idx: usize) -> u64 {
        self.buckets
            .get(idx)
            .map(|b| b.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Returns the sum in the original unit (ms).
    ///
    /// The internal sum is stored scaled by 1000x to preserve sub-integer
    /// precision.
    pub fn sum_ms(&self) -> f64 {
        self.sum.load(Ordering::Relaxed) as f64 / 1000.0
    }
}

/// Which layer answered a cache read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheLayer {
    Local,
    Shared,
}

impl CacheLayer {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Shared => "shared",
        }
    }
}

/// Process-wide registry shared by the cache manager and the usage tracker.
#[derive(Debug)]
pub struct MetricsRegistry {
    config: MetricsConfig,
    pub cache_hits: Counter,
    pub cache_local_hits: Counter,
    pub cache_misses: Counter,
    pub cache_sets: Counter,
    pub cache_deletes: Counter,
    pub cache_errors: Counter,
    pub cache_bytes_read: Counter,
    pub cache_bytes_written: Counter,
    pub cache_latency_ms: Histogram,
    pub resolves_in_flight: Gauge,
    pub resolve_from_cache: Counter,
    pub resolve_from_source: Counter,
    pub resolve_generated: Counter,
    pub resolve_miss: Counter,
    pub usage_tracked: Counter,
    pub usage_duplicates: Counter,
    pub usage_skipped: Counter,
    pub usage_failures: Counter,
    pub tokens_llm: Counter,
    pub tokens_embedding: Counter,
    pub tokens_fine_tuning: Counter,
    pub idempotency_purged: Counter,
}

impl MetricsRegistry {
    pub fn new(config: &MetricsConfig) -> Self {
        Self {
            config: config.clone(),
            cache_hits: Counter::new(),
            cache_local_hits: Counter::new(),
            cache_misses: Counter::new(),
            cache_sets: Counter::new(),
            cache_deletes: Counter::new(),
            cache_errors: Counter::new(),
            cache_bytes_read: Counter::new(),
            cache_bytes_written: Counter::new(),
            cache_latency_ms: Histogram::cache_latency(),
            resolves_in_flight: Gauge::new(),
            resolve_from_cache: Counter::new(),
            resolve_from_source: Counter::new(),
            resolve_generated: Counter::new(),
            resolve_miss: Counter::new(),
            usage_tracked: Counter::new(),
            usage_duplicates: Counter::new(),
            usage_skipped: Counter::new(),
            usage_failures: Counter::new(),
            tokens_llm: Counter::new(),
            tokens_embedding: Counter::new(),
            tokens_fine_tuning: Counter::new(),
            idempotency_purged: Counter::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn record_cache_get(&self, layer: Option<CacheLayer>, latency: Duration, bytes: usize) {
        if !self.config.enabled {
            return;
        }

        let latency_ms = latency.as_secs_f64() * 1000.0;
        self.cache_latency_ms.observe(latency_ms);
        match layer {
            Some(layer) => {
                self.cache_hits.inc();
                if layer == CacheLayer::Local {
                    self.cache_local_hits.inc();
                }
                self.cache_bytes_read.add(bytes as u64);
            }
            None => self.cache_misses.inc(),
        }

        if self.config.emit_events {
            trace!(
                target: METRICS_TARGET,
                op = "get",
                hit = layer.is_some(),
                layer = layer.map(|l| l.as_str()).unwrap_or("none"),
                latency_ms,
                bytes,
            );
        }
    }

    pub fn record_cache_set(&self, latency: Duration, bytes: usize) {
        if !self.config.enabled {
            return;
        }

        let latency_ms = latency.as_secs_f64() * 1000.0;
        self.cache_sets.inc();
        self.cache_bytes_written.add(bytes as u64);
        self.cache_latency_ms.observe(latency_ms);

        if self.config.emit_events {
            trace!(target: METRICS_TARGET, op = "set", latency_ms, bytes);
        }
    }

    pub fn record_cache_delete(&self, keys: u64) {
        if self.config.enabled {
            self.cache_deletes.add(keys);
        }
    }

    pub fn record_cache_error(&self) {
        if self.config.enabled {
            self.cache_errors.inc();
        }
    }

    pub fn record_resolve(&self, source: ResolveSource, latency: Duration) {
        if !self.config.enabled {
            return;
        }

        match source {
            ResolveSource::Cache => self.resolve_from_cache.inc(),
            ResolveSource::Source => self.resolve_from_source.inc(),
            ResolveSource::Generated => self.resolve_generated.inc(),
            ResolveSource::Miss => self.resolve_miss.inc(),
        }

        if self.config.emit_events {
            trace!(
                target: METRICS_TARGET,
                op = "resolve",
                source = source.as_str(),
                latency_ms = latency.as_secs_f64() * 1000.0,
            );
        }
    }

    pub fn record_usage(&self, token_type: TokenType, tokens: u64) {
        if !self.config.enabled {
            return;
        }

        self.usage_tracked.inc();
        match token_type {
            TokenType::Llm => self.tokens_llm.add(tokens),
            TokenType::Embedding => self.tokens_embedding.add(tokens),
            TokenType::FineTuning => self.tokens_fine_tuning.add(tokens),
        }
    }

    pub fn record_usage_duplicate(&self) {
        if self.config.enabled {
            self.usage_duplicates.inc();
        }
    }

    pub fn record_usage_skipped(&self) {
        if self.config.enabled {
            self.usage_skipped.inc();
        }
    }

    pub fn record_usage_failure(&self) {
        if self.config.enabled {
            self.usage_failures.inc();
        }
    }

    pub fn record_idempotency_purge(&self, purged: u64) {
        if self.config.enabled {
            self.idempotency_purged.add(purged);
        }
    }

    pub fn summary(&self) -> MetricsSummary {
        MetricsSummary::from_registry(self)
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new(&MetricsConfig::new())
    }
}

/// Point-in-time snapshot for export or display.
#[derive(Debug, Clone, Default)]
pub struct MetricsSummary {
    pub cache_hits: u64,
    pub cache_local_hits: u64,
    pub cache_misses: u64,
    pub cache_sets: u64,
    pub cache_errors: u64,
    pub avg_cache_latency_ms: f64,
    pub resolve_from_cache: u64,
    pub resolve_from_source: u64,
    pub resolve_generated: u64,
    pub resolve_miss: u64,
    pub usage_tracked: u64,
    pub usage_duplicates: u64,
    pub usage_failures: u64,
    pub total_tokens: u64,
}

impl MetricsSummary {
    pub fn from_registry(registry: &MetricsRegistry) -> Self {
        let count = registry.cache_latency_ms.count();
        let avg_latency = if count > 0 {
            registry.cache_latency_ms.sum_ms() / count as f64
        } else {
            0.0
        };

        Self {
            cache_hits: registry.cache_hits.get(),
            cache_local_hits: registry.cache_local_hits.get(),
            cache_misses: registry.cache_misses.get(),
            cache_sets: registry.cache_sets.get(),
            cache_errors: registry.cache_errors.get(),
            avg_cache_latency_ms: avg_latency,
            resolve_from_cache: registry.resolve_from_cache.get(),
            resolve_from_source: registry.resolve_from_source.get(),
            resolve_generated: registry.resolve_generated.get(),
            resolve_miss: registry.resolve_miss.get(),
            usage_tracked: registry.usage_tracked.get(),
            usage_duplicates: registry.usage_duplicates.get(),
            usage_failures: registry.usage_failures.get(),
            total_tokens: registry.tokens_llm.get()
                + registry.tokens_embedding.get()
                + registry.tokens_fine_tuning.get(),
        }
    }

    pub fn cache_hit_rate(&self) -> f64 {
        let total = self.cache_hits + self.cache_misses;
        if total == 0 {
            return 0.0;
        }
        self.cache_hits as f64 / total as f64
    }
}
