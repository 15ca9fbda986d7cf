//! Pluggable configuration provider system.
//!
//! ```rust,no_run
//! use cachemeter::config::{ConfigBuilder, Settings};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let provider = ConfigBuilder::new()
//!     .env()
//!     .file("cachemeter.json")
//!     .build();
//! let settings = Settings::load(&provider).await?;
//! # Ok(())
//! # }
//! ```

pub mod composite;
pub mod env;
pub mod file;
pub mod memory;
pub mod provider;
pub mod settings;

pub use composite::CompositeConfigProvider;
pub use env::EnvConfigProvider;
pub use file::FileConfigProvider;
pub use memory::MemoryConfigProvider;
pub use provider::{ConfigProvider, ConfigProviderExt};
pub use settings::{CacheSettings, MeteringSettings, Settings, StorageSettings};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Key not found: {key}")]
    NotFound { key: String },

    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Environment error: {0}")]
    Env(#[from] std::env::VarError),

    #[error("Provider error: {message}")]
    Provider { message: String },

    #[error("{0}")]
    ValidationErrors(ValidationErrors),
}

#[derive(Debug)]
pub struct ValidationErrors(pub Vec<ConfigError>);

impl std::fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Validation failed: ")?;
        let msgs: Vec<String> = self.0.iter().map(|e| e.to_string()).collect();
        write!(f, "{}", msgs.join("; "))
    }
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Layers providers from highest to lowest priority.
#[derive(Default)]
pub struct ConfigBuilder {
    composite: CompositeConfigProvider,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Environment variables under `CACHEMETER_`.
    pub fn env(self) -> Self {
        self.provider(Box::new(EnvConfigProvider::new()))
    }

    pub fn env_with_prefix(self, prefix: &str) -> Self {
        self.provider(Box::new(EnvConfigProvider::prefixed(prefix)))
    }

    pub fn file(self, path: impl AsRef<std::path::Path>) -> Self {
        self.provider(Box::new(FileConfigProvider::new(path.as_ref())))
    }

    pub fn memory(self, provider: MemoryConfigProvider) -> Self {
        self.provider(Box::new(provider))
    }

    pub fn provider(mut self, provider: Box<dyn ConfigProvider>) -> Self {
        self.composite.add_provider(provider);
        self
    }

    pub fn build(self) -> CompositeConfigProvider {
        self.composite
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::NotFound {
            key: "storage.redis_url".to_string(),
        };
        assert!(err.to_string().contains("storage.redis_url"));
    }

    #[tokio::test]
    async fn test_builder_layers_in_order() {
        let provider = ConfigBuilder::new()
            .memory(MemoryConfigProvider::named("overrides").value("cache.local_enabled", "false"))
            .env_with_prefix("CACHEMETER_BUILDER_TEST_")
            .build();
        assert_eq!(provider.provider_names(), vec!["overrides", "env"]);

        let settings = Settings::load(&provider).await.unwrap();
        assert!(!settings.cache.local_enabled);
    }
}
