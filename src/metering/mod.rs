//! Idempotent, tenant-attributed token usage metering.
//!
//! [`UsageTracker::track_usage`] is the single write entry point. Each call
//! resolves the billing tenant, checks the idempotency ledger and applies the
//! summary, daily and monthly increments as one unit through a
//! [`UsageStore`].

pub mod attribution;
mod idempotency;
#[cfg(feature = "postgres")]
pub mod postgres;
mod store;
mod sweep;
mod tracker;
mod types;

use std::time::Duration;

pub use attribution::{
    AgentDirectory, Attribution, AttributionMetadata, AttributionResolver, InMemoryAgentDirectory,
};
pub use idempotency::IdempotencyKey;
#[cfg(feature = "postgres")]
pub use postgres::{PgAgentDirectory, PostgresUsageStore};
pub use store::{MemoryUsageStore, UsageStore};
pub use sweep::IdempotencySweeper;
pub use tracker::{UsageEvent, UsageTracker};
pub use types::{
    ApplyOutcome, DailyUsageRecord, Granularity, IdempotencyRecord, Metadata, MonthlyUsageRecord,
    Operation, TenantUsageSummary, TokenType, UsageBuckets, UsageEntry, UsageTotals, YearMonth,
};

use thiserror::Error;

/// How long an idempotency key blocks re-application.
pub const IDEMPOTENCY_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

/// Model recorded when the caller does not name one.
pub const UNKNOWN_MODEL: &str = "unknown";

#[derive(Error, Debug)]
pub enum MeteringError {
    #[error("Validation error: {message}")]
    Validation { message: String },

    #[error("Usage storage error: {message}")]
    Storage { message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl MeteringError {
    pub(crate) fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub(crate) fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }
}

pub type MeteringResult<T> = std::result::Result<T, MeteringError>;

#[cfg(feature = "postgres")]
pub(crate) trait StorageResultExt<T> {
    fn storage_err(self) -> MeteringResult<T>;
    fn storage_err_ctx(self, context: &str) -> MeteringResult<T>;
}

#[cfg(feature = "postgres")]
impl<T, E: std::fmt::Display> StorageResultExt<T> for std::result::Result<T, E> {
    fn storage_err(self) -> MeteringResult<T> {
        self.map_err(|e| MeteringError::storage(e.to_string()))
    }

    fn storage_err_ctx(self, context: &str) -> MeteringResult<T> {
        self.map_err(|e| MeteringError::storage(format!("{}: {}", context, e)))
    }
}

/// Start of the window inside which an idempotency key still counts.
pub(crate) fn retention_cutoff(
    now: chrono::DateTime<chrono::Utc>,
    retention: Duration,
) -> chrono::DateTime<chrono::Utc> {
    let window = chrono::TimeDelta::from_std(retention).unwrap_or(chrono::TimeDelta::hours(24));
    now - window
}
