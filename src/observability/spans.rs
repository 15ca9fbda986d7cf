//! Structured span definitions for tracing.

use tracing::{Level, Span, field, span};

use crate::cache::CacheKey;
use crate::metering::{Operation, TokenType};

/// Service name used when none is configured.
pub const DEFAULT_SERVICE_NAME: &str = "cachemeter";

/// Tracing configuration.
#[derive(Clone, Debug, Default)]
pub struct TracingConfig {
    pub service_name: Option<String>,
    pub enabled: bool,
    pub level: TracingLevel,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TracingLevel {
    #[default]
    Info,
    Debug,
    Trace,
}

impl TracingLevel {
    pub fn as_filter(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        }
    }
}

impl TracingConfig {
    pub fn new() -> Self {
        Self {
            enabled: true,
            ..Default::default()
        }
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }

    pub fn service_name(&self) -> &str {
        self.service_name.as_deref().unwrap_or(DEFAULT_SERVICE_NAME)
    }
}

/// Root span naming the service. Wrap a worker's top-level future in it so
/// every cache and usage event carries the service name.
pub fn service_span(config: &TracingConfig) -> Span {
    span!(Level::INFO, "service", name = config.service_name())
}

/// Span around one cache-aside resolution. `source` and `latency_ms` are
/// recorded once the outcome is known.
pub fn resolve_span(key: &CacheKey) -> Span {
    span!(
        Level::DEBUG,
        "cache.resolve",
        tenant_id = key.tenant_id(),
        data_type = key.data_type().as_str(),
        key = %key,
        source = field::Empty,
        latency_ms = field::Empty,
    )
}

/// Span around one `track_usage` call.
pub fn usage_span(
    event_id: &str,
    tenant_id: &str,
    token_type: TokenType,
    operation: Operation,
    tokens: i64,
) -> Span {
    span!(
        Level::INFO,
        "usage.track",
        event_id = event_id,
        tenant_id = tenant_id,
        billing_tenant_id = field::Empty,
        token_type = token_type.as_str(),
        operation = operation.as_str(),
        tokens = tokens,
        outcome = field::Empty,
    )
}
