//! Configuration Provider Trait

use std::fmt::Display;
use std::str::FromStr;

use serde::{Serialize, de::DeserializeOwned};

use super::{ConfigError, ConfigResult};

/// Source of raw configuration strings keyed by dotted paths such as
/// `cache.local_max_entries`.
#[async_trait::async_trait]
pub trait ConfigProvider: Send + Sync {
    /// Provider name for logging
    fn name(&self) -> &str;

    async fn get_raw(&self, key: &str) -> ConfigResult<Option<String>>;

    async fn set_raw(&self, key: &str, value: &str) -> ConfigResult<()>;

    async fn delete(&self, key: &str) -> ConfigResult<bool>;

    async fn list_keys(&self, prefix: &str) -> ConfigResult<Vec<String>>;
}

/// Typed access on top of [`ConfigProvider`].
pub trait ConfigProviderExt: ConfigProvider {
    /// Decode a JSON-encoded value.
    fn get<T: DeserializeOwned + Send>(
        &self,
        key: &str,
    ) -> impl std::future::Future<Output = ConfigResult<Option<T>>> + Send
    where
        Self: Sync,
    {
        async move {
            match self.get_raw(key).await? {
                Some(raw) => serde_json::from_str(&raw)
                    .map(Some)
                    .map_err(|e| invalid(key, e)),
                None => Ok(None),
            }
        }
    }

    /// Parse a plain scalar with [`FromStr`]. Environment variables carry
    /// bare strings, so this is the accessor settings use for scalars.
    fn get_parsed<T>(
        &self,
        key: &str,
    ) -> impl std::future::Future<Output = ConfigResult<Option<T>>> + Send
    where
        Self: Sync,
        T: FromStr + Send,
        T::Err: Display,
    {
        async move {
            match self.get_raw(key).await? {
                Some(raw) => raw.trim().parse().map(Some).map_err(|e| invalid(key, e)),
                None => Ok(None),
            }
        }
    }

    fn set<T: Serialize + Send + Sync>(
        &self,
        key: &str,
        value: &T,
    ) -> impl std::future::Future<Output = ConfigResult<()>> + Send
    where
        Self: Sync,
    {
        async move {
            let raw = serde_json::to_string(value)?;
            self.set_raw(key, &raw).await
        }
    }
}

impl<P: ConfigProvider + ?Sized> ConfigProviderExt for P {}

fn invalid(key: &str, error: impl Display) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: error.to_string(),
    }
}
