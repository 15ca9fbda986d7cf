//! Layered configuration: the first provider that knows a key wins.

use std::collections::BTreeSet;

use super::ConfigResult;
use super::provider::ConfigProvider;

#[derive(Default)]
pub struct CompositeConfigProvider {
    providers: Vec<Box<dyn ConfigProvider>>,
}

impl CompositeConfigProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a layer with lower priority than those already added.
    pub fn add_provider(&mut self, provider: Box<dyn ConfigProvider>) {
        self.providers.push(provider);
    }

    pub fn provider(mut self, provider: Box<dyn ConfigProvider>) -> Self {
        self.add_provider(provider);
        self
    }

    pub fn provider_names(&self) -> Vec<&str> {
        self.providers.iter().map(|p| p.name()).collect()
    }
}

#[async_trait::async_trait]
impl ConfigProvider for CompositeConfigProvider {
    fn name(&self) -> &str {
        "composite"
    }

    async fn get_raw(&self, key: &str) -> ConfigResult<Option<String>> {
        for provider in &self.providers {
            if let Some(value) = provider.get_raw(key).await? {
                tracing::trace!(key, provider = provider.name(), "Config value resolved");
                return Ok(Some(value));
            }
        }
        Ok(None)
    }

    /// Writes go to the highest-priority layer only.
    async fn set_raw(&self, key: &str, value: &str) -> ConfigResult<()> {
        match self.providers.first() {
            Some(provider) => provider.set_raw(key, value).await,
            None => Ok(()),
        }
    }

    async fn delete(&self, key: &str) -> ConfigResult<bool> {
        let mut deleted = false;
        for provider in &self.providers {
            deleted |= provider.delete(key).await?;
        }
        Ok(deleted)
    }

    async fn list_keys(&self, prefix: &str) -> ConfigResult<Vec<String>> {
        let mut keys = BTreeSet::new();
        for provider in &self.providers {
            keys.extend(provider.list_keys(prefix).await?);
        }
        Ok(keys.into_iter().collect())
    }
}

impl std::fmt::Debug for CompositeConfigProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositeConfigProvider")
            .field("providers", &self.provider_names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::memory::MemoryConfigProvider;

    fn layered() -> CompositeConfigProvider {
        let overrides = MemoryConfigProvider::named("overrides").value("cache.key_prefix", "staging:");
        let defaults = MemoryConfigProvider::named("defaults")
            .value("cache.key_prefix", "prod:")
            .value("cache.local_max_entries", "100");

        CompositeConfigProvider::new()
            .provider(Box::new(overrides))
            .provider(Box::new(defaults))
    }

    #[tokio::test]
    async fn test_first_layer_wins() {
        let composite = layered();
        assert_eq!(
            composite.get_raw("cache.key_prefix").await.unwrap().as_deref(),
            Some("staging:")
        );
        assert_eq!(
            composite.get_raw("cache.local_max_entries").await.unwrap().as_deref(),
            Some("100")
        );
        assert_eq!(composite.provider_names(), vec!["overrides", "defaults"]);
    }

    #[tokio::test]
    async fn test_list_keys_deduplicates() {
        let keys = layered().list_keys("cache.").await.unwrap();
        assert_eq!(keys, vec!["cache.key_prefix", "cache.local_max_entries"]);
    }

    #[tokio::test]
    async fn test_set_and_delete() {
        let composite = layered();
        composite.set_raw("metering.retention_secs", "60").await.unwrap();
        assert_eq!(
            composite.get_raw("metering.retention_secs").await.unwrap().as_deref(),
            Some("60")
        );

        assert!(composite.delete("cache.key_prefix").await.unwrap());
        assert_eq!(composite.get_raw("cache.key_prefix").await.unwrap(), None);
    }
}
