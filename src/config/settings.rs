//! Typed runtime settings assembled from a [`ConfigProvider`].
//!
//! | key                             | type             | default  |
//! |---------------------------------|------------------|----------|
//! | `cache.local_enabled`           | bool             | `true`   |
//! | `cache.local_max_entries`       | integer          | `10000`  |
//! | `cache.key_prefix`              | string           | `""`     |
//! | `cache.ttl_short_secs`          | integer          | `300`    |
//! | `cache.ttl_standard_secs`       | integer          | `3600`   |
//! | `cache.ttl_extended_secs`       | integer          | `86400`  |
//! | `cache.data_type_tiers`         | JSON object      | `{}`     |
//! | `cache.callback_timeout_ms`     | integer          | none     |
//! | `metering.retention_secs`       | integer          | `86400`  |
//! | `metering.sweep_interval_secs`  | integer          | `3600`   |
//! | `storage.redis_url`             | string           | none     |
//! | `storage.database_url`          | string (secret)  | none     |

use std::collections::HashMap;
use std::time::Duration;

use secrecy::SecretString;

use super::provider::{ConfigProvider, ConfigProviderExt};
use super::{ConfigError, ConfigResult, ValidationErrors};
use crate::cache::{DataType, TTL_EXTENDED, TTL_SHORT, TTL_STANDARD, TtlPolicy, TtlTier};
use crate::metering::IDEMPOTENCY_RETENTION;

pub const DEFAULT_LOCAL_MAX_ENTRIES: usize = 10_000;
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub local_enabled: bool,
    pub local_max_entries: usize,
    pub key_prefix: String,
    pub ttl_short: Duration,
    pub ttl_standard: Duration,
    pub ttl_extended: Duration,
    pub data_type_tiers: HashMap<DataType, TtlTier>,
    /// Upper bound on fetch and generate callbacks during a resolve.
    pub callback_timeout: Option<Duration>,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            local_enabled: true,
            local_max_entries: DEFAULT_LOCAL_MAX_ENTRIES,
            key_prefix: String::new(),
            ttl_short: TTL_SHORT,
            ttl_standard: TTL_STANDARD,
            ttl_extended: TTL_EXTENDED,
            data_type_tiers: HashMap::new(),
            callback_timeout: None,
        }
    }
}

impl CacheSettings {
    pub fn ttl_policy(&self) -> TtlPolicy {
        self.data_type_tiers.iter().fold(
            TtlPolicy::new().tier_durations(self.ttl_short, self.ttl_standard, self.ttl_extended),
            |policy, (data_type, tier)| policy.data_type_tier(*data_type, *tier),
        )
    }
}

#[derive(Debug, Clone)]
pub struct MeteringSettings {
    /// Window during which an idempotency key blocks re-application.
    pub retention: Duration,
    pub sweep_interval: Duration,
}

impl Default for MeteringSettings {
    fn default() -> Self {
        Self {
            retention: IDEMPOTENCY_RETENTION,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct StorageSettings {
    pub redis_url: Option<String>,
    pub database_url: Option<SecretString>,
}

#[derive(Debug, Clone, Default)]
pub struct Settings {
    pub cache: CacheSettings,
    pub metering: MeteringSettings,
    pub storage: StorageSettings,
}

impl Settings {
    /// Read every known key, falling back to defaults, then validate.
    pub async fn load<P: ConfigProvider + ?Sized>(provider: &P) -> ConfigResult<Self> {
        let defaults = Self::default();

        let cache = CacheSettings {
            local_enabled: provider
                .get_parsed("cache.local_enabled")
                .await?
                .unwrap_or(defaults.cache.local_enabled),
            local_max_entries: provider
                .get_parsed("cache.local_max_entries")
                .await?
                .unwrap_or(defaults.cache.local_max_entries),
            key_prefix: provider
                .get_raw("cache.key_prefix")
                .await?
                .unwrap_or(defaults.cache.key_prefix),
            ttl_short: secs(provider, "cache.ttl_short_secs")
                .await?
                .unwrap_or(defaults.cache.ttl_short),
            ttl_standard: secs(provider, "cache.ttl_standard_secs")
                .await?
                .unwrap_or(defaults.cache.ttl_standard),
            ttl_extended: secs(provider, "cache.ttl_extended_secs")
                .await?
                .unwrap_or(defaults.cache.ttl_extended),
            data_type_tiers: data_type_tiers(provider).await?,
            callback_timeout: provider
                .get_parsed::<u64>("cache.callback_timeout_ms")
                .await?
                .map(Duration::from_millis),
        };

        let metering = MeteringSettings {
            retention: secs(provider, "metering.retention_secs")
                .await?
                .unwrap_or(defaults.metering.retention),
            sweep_interval: secs(provider, "metering.sweep_interval_secs")
                .await?
                .unwrap_or(defaults.metering.sweep_interval),
        };

        let storage = StorageSettings {
            redis_url: provider.get_raw("storage.redis_url").await?,
            database_url: provider
                .get_raw("storage.database_url")
                .await?
                .map(SecretString::from),
        };

        let settings = Self {
            cache,
            metering,
            storage,
        };
        settings.validate()?;
        Ok(settings)
    }

    /// Collect every violation rather than stopping at the first.
    pub fn validate(&self) -> ConfigResult<()> {
        let mut errors = Vec::new();

        if self.metering.retention.is_zero() {
            errors.push(invalid("metering.retention_secs", "must be greater than zero"));
        }
        if self.metering.sweep_interval.is_zero() {
            errors.push(invalid("metering.sweep_interval_secs", "must be greater than zero"));
        }
        if self.cache.local_enabled && self.cache.local_max_entries == 0 {
            errors.push(invalid(
                "cache.local_max_entries",
                "must be greater than zero when the local layer is enabled",
            ));
        }
        if let Err(e) = crate::cache::validate_prefix(&self.cache.key_prefix) {
            errors.push(invalid("cache.key_prefix", e));
        }
        if !(self.cache.ttl_short <= self.cache.ttl_standard
            && self.cache.ttl_standard <= self.cache.ttl_extended)
        {
            errors.push(invalid(
                "cache.ttl_*_secs",
                "tiers must satisfy short <= standard <= extended",
            ));
        }
        if self.cache.callback_timeout.is_some_and(|t| t.is_zero()) {
            errors.push(invalid("cache.callback_timeout_ms", "must be greater than zero"));
        }

        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(ConfigError::ValidationErrors(ValidationErrors(errors))),
        }
    }
}

fn invalid(key: &str, message: impl ToString) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.to_string(),
    }
}

async fn secs<P: ConfigProvider + ?Sized>(provider: &P, key: &str) -> ConfigResult<Option<Duration>> {
    Ok(provider.get_parsed::<u64>(key).await?.map(Duration::from_secs))
}

async fn data_type_tiers<P: ConfigProvider + ?Sized>(
    provider: &P,
) -> ConfigResult<HashMap<DataType, TtlTier>> {
    const KEY: &str = "cache.data_type_tiers";
    let raw: Option<HashMap<String, TtlTier>> = provider.get(KEY).await?;
    raw.unwrap_or_default()
        .into_iter()
        .map(|(name, tier)| {
            name.parse::<DataType>()
                .map(|dt| (dt, tier))
                .map_err(|e| invalid(KEY, e))
        })
        .collect()
}
