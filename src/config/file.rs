//! JSON file configuration.
//!
//! Dotted keys address nested objects: `cache.key_prefix` reads
//! `{"cache": {"key_prefix": "..."}}`. A missing file is an empty config.

use std::path::{Path, PathBuf};

use serde_json::{Map, Value};
use tokio::sync::RwLock;

use super::ConfigResult;
use super::provider::ConfigProvider;

pub struct FileConfigProvider {
    path: PathBuf,
    data: RwLock<Option<Map<String, Value>>>,
}

impl FileConfigProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            data: RwLock::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Drop the cached contents; the next access re-reads the file.
    pub async fn reload(&self) -> ConfigResult<()> {
        *self.data.write().await = Some(self.load().await?);
        Ok(())
    }

    async fn load(&self) -> ConfigResult<Map<String, Value>> {
        if !tokio::fs::try_exists(&self.path).await? {
            return Ok(Map::new());
        }
        let content = tokio::fs::read_to_string(&self.path).await?;
        Ok(serde_json::from_str(&content)?)
    }

    async fn save(&self, data: &Map<String, Value>) -> ConfigResult<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.path, serde_json::to_string_pretty(data)?).await?;
        Ok(())
    }

    async fn ensure_loaded(&self) -> ConfigResult<()> {
        let mut data = self.data.write().await;
        if data.is_none() {
            *data = Some(self.load().await?);
        }
        Ok(())
    }
}

fn lookup<'a>(map: &'a Map<String, Value>, key: &str) -> Option<&'a Value> {
    let mut parts = key.split('.');
    let first = map.get(parts.next()?)?;
    parts.try_fold(first, |value, part| value.get(part))
}

// Strings come back bare; everything else as JSON text.
fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn collect_keys(prefix: &str, value: &Value, out: &mut Vec<String>) {
    match value {
        Value::Object(map) => {
            for (k, v) in map {
                let path = if prefix.is_empty() {
                    k.clone()
                } else {
                    format!("{}.{}", prefix, k)
                };
                collect_keys(&path, v, out);
            }
        }
        _ => out.push(prefix.to_string()),
    }
}

#[async_trait::async_trait]
impl ConfigProvider for FileConfigProvider {
    fn name(&self) -> &str {
        "file"
    }

    async fn get_raw(&self, key: &str) -> ConfigResult<Option<String>> {
        self.ensure_loaded().await?;
        let data = self.data.read().await;
        Ok(data
            .as_ref()
            .and_then(|map| lookup(map, key))
            .map(render))
    }

    /// Top-level write. Values that parse as JSON are stored as JSON.
    async fn set_raw(&self, key: &str, value: &str) -> ConfigResult<()> {
        self.ensure_loaded().await?;
        let mut data = self.data.write().await;
        let map = data.get_or_insert_with(Map::new);

        let json_value =
            serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
        map.insert(key.to_string(), json_value);

        self.save(map).await
    }

    async fn delete(&self, key: &str) -> ConfigResult<bool> {
        self.ensure_loaded().await?;
        let mut data = self.data.write().await;
        let Some(map) = data.as_mut() else {
            return Ok(false);
        };
        if map.remove(key).is_none() {
            return Ok(false);
        }
        self.save(map).await?;
        Ok(true)
    }

    /// Leaf keys in dotted form.
    async fn list_keys(&self, prefix: &str) -> ConfigResult<Vec<String>> {
        self.ensure_loaded().await?;
        let data = self.data.read().await;
        let mut keys = Vec::new();
        if let Some(map) = data.as_ref() {
            collect_keys("", &Value::Object(map.clone()), &mut keys);
        }
        keys.retain(|k| k.starts_with(prefix));
        Ok(keys)
    }
}

impl std::fmt::Debug for FileConfigProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileConfigProvider")
            .field("path", &self.path)
            .finish()
    }
}
