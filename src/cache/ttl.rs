//! Expiration tiers and per-data-type defaults.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::key::DataType;

pub const TTL_SHORT: Duration = Duration::from_secs(300); // 5 minutes
pub const TTL_STANDARD: Duration = Duration::from_secs(3600); // 1 hour
pub const TTL_EXTENDED: Duration = Duration::from_secs(86400); // 24 hours

/// Named expiration tier other services reference instead of raw durations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TtlTier {
    Short,
    Standard,
    Extended,
    /// Never expires.
    Permanent,
}

impl TtlTier {
    /// Built-in duration for this tier, `None` for permanent entries.
    pub fn duration(&self) -> Option<Duration> {
        match self {
            Self::Short => Some(TTL_SHORT),
            Self::Standard => Some(TTL_STANDARD),
            Self::Extended => Some(TTL_EXTENDED),
            Self::Permanent => None,
        }
    }
}

/// Explicit expiration passed to a cache write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ttl {
    Tier(TtlTier),
    Exact(Duration),
}

impl From<TtlTier> for Ttl {
    fn from(tier: TtlTier) -> Self {
        Self::Tier(tier)
    }
}

impl From<Duration> for Ttl {
    fn from(duration: Duration) -> Self {
        Self::Exact(duration)
    }
}

/// Maps data types to tiers and tiers to durations.
///
/// Tier durations can be overridden from configuration; data types can be
/// pinned to a different tier than their built-in default.
#[derive(Debug, Clone)]
pub struct TtlPolicy {
    short: Duration,
    standard: Duration,
    extended: Duration,
    overrides: HashMap<DataType, TtlTier>,
}

impl Default for TtlPolicy {
    fn default() -> Self {
        Self {
            short: TTL_SHORT,
            standard: TTL_STANDARD,
            extended: TTL_EXTENDED,
            overrides: HashMap::new(),
        }
    }
}

impl TtlPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tier_durations(mut self, short: Duration, standard: Duration, extended: Duration) -> Self {
        self.short = short;
        self.standard = standard;
        self.extended = extended;
        self
    }

    pub fn data_type_tier(mut self, data_type: DataType, tier: TtlTier) -> Self {
        self.overrides.insert(data_type, tier);
        self
    }

    pub fn tier_for(&self, data_type: DataType) -> TtlTier {
        self.overrides
            .get(&data_type)
            .copied()
            .unwrap_or_else(|| data_type.default_tier())
    }

    pub fn tier_duration(&self, tier: TtlTier) -> Option<Duration> {
        match tier {
            TtlTier::Short => Some(self.short),
            TtlTier::Standard => Some(self.standard),
            TtlTier::Extended => Some(self.extended),
            TtlTier::Permanent => None,
        }
    }

    /// Resolve the effective expiry of a write. `None` means no expiry.
    pub fn resolve(&self, data_type: DataType, ttl: Option<Ttl>) -> Option<Duration> {
        match ttl {
            Some(Ttl::Exact(duration)) => Some(duration),
            Some(Ttl::Tier(tier)) => self.tier_duration(tier),
            None => self.tier_duration(self.tier_for(data_type)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_durations() {
        assert_eq!(TtlTier::Short.duration(), Some(Duration::from_secs(300)));
        assert_eq!(TtlTier::Standard.duration(), Some(Duration::from_secs(3600)));
        assert_eq!(TtlTier::Extended.duration(), Some(Duration::from_secs(86400)));
        assert_eq!(TtlTier::Permanent.duration(), None);
    }

    #[test]
    fn test_policy_defaults_by_data_type() {
        let policy = TtlPolicy::default();
        assert_eq!(policy.resolve(DataType::Embedding, None), Some(TTL_EXTENDED));
        assert_eq!(policy.resolve(DataType::QueryResult, None), Some(TTL_SHORT));
        assert_eq!(policy.resolve(DataType::System, None), None);
    }

    #[test]
    fn test_explicit_ttl_wins() {
        let policy = TtlPolicy::default();
        assert_eq!(
            policy.resolve(DataType::Embedding, Some(Duration::from_secs(1).into())),
            Some(Duration::from_secs(1))
        );
        assert_eq!(
            policy.resolve(DataType::Embedding, Some(TtlTier::Permanent.into())),
            None
        );
    }

    #[test]
    fn test_overrides() {
        let policy = TtlPolicy::new()
            .tier_durations(
                Duration::from_secs(60),
                Duration::from_secs(600),
                Duration::from_secs(6000),
            )
            .data_type_tier(DataType::Document, TtlTier::Extended);

        assert_eq!(policy.tier_for(DataType::Document), TtlTier::Extended);
        assert_eq!(
            policy.resolve(DataType::Document, None),
            Some(Duration::from_secs(6000))
        );
        assert_eq!(
            policy.resolve(DataType::Message, None),
            Some(Duration::from_secs(60))
        );
    }
}
