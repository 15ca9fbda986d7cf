//! Environment variable configuration.
//!
//! `cache.local_max_entries` is read from `CACHEMETER_CACHE_LOCAL_MAX_ENTRIES`.

use super::provider::ConfigProvider;
use super::{ConfigError, ConfigResult};

pub const DEFAULT_ENV_PREFIX: &str = "CACHEMETER_";

/// Read-only provider. Modifying the process environment is not
/// thread-safe, so writes are rejected.
#[derive(Debug, Clone)]
pub struct EnvConfigProvider {
    prefix: String,
}

impl EnvConfigProvider {
    pub fn new() -> Self {
        Self::prefixed(DEFAULT_ENV_PREFIX)
    }

    pub fn prefixed(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    fn env_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key.to_uppercase().replace('.', "_"))
    }

    // Underscores are ambiguous on the way back; they always become dots.
    fn key_from_env(&self, env_name: &str) -> Option<String> {
        env_name
            .strip_prefix(&self.prefix)
            .map(|rest| rest.to_lowercase().replace('_', "."))
    }

    fn read_only() -> ConfigError {
        ConfigError::Provider {
            message: "Environment variables are read-only at runtime".into(),
        }
    }
}

impl Default for EnvConfigProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ConfigProvider for EnvConfigProvider {
    fn name(&self) -> &str {
        "env"
    }

    async fn get_raw(&self, key: &str) -> ConfigResult<Option<String>> {
        match std::env::var(self.env_key(key)) {
            Ok(value) => Ok(Some(value)),
            Err(std::env::VarError::NotPresent) => Ok(None),
            Err(e) => Err(ConfigError::Env(e)),
        }
    }

    async fn set_raw(&self, _key: &str, _value: &str) -> ConfigResult<()> {
        Err(Self::read_only())
    }

    async fn delete(&self, _key: &str) -> ConfigResult<bool> {
        Err(Self::read_only())
    }

    async fn list_keys(&self, prefix: &str) -> ConfigResult<Vec<String>> {
        let env_prefix = self.env_key(prefix);
        Ok(std::env::vars()
            .filter(|(k, _)| k.starts_with(&env_prefix))
            .filter_map(|(k, _)| self.key_from_env(&k))
            .collect())
    }
}
