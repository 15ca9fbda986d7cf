//! Redis shared layer.
//!
//! Enable with the `redis-backend` feature flag.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::key::validate_prefix;
use super::store::{SharedListOps, SharedStore, StoredValue};
use super::{CacheError, CacheResult, StorageResultExt, with_retry};
use crate::config::CacheSettings;

const SCAN_BATCH: usize = 200;

#[derive(Clone, Debug)]
pub struct RedisConfig {
    /// Namespace prepended to every key, e.g. `rag:`. Empty by default so
    /// rendered cache keys are stored verbatim.
    pub key_prefix: String,
    pub connection_timeout: Duration,
    pub response_timeout: Duration,
    /// Maximum retry attempts for transient failures.
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            key_prefix: String::new(),
            connection_timeout: Duration::from_secs(5),
            response_timeout: Duration::from_secs(10),
            max_retries: 3,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(2),
        }
    }
}

impl RedisConfig {
    pub fn prefix(mut self, prefix: impl Into<String>) -> CacheResult<Self> {
        let prefix = prefix.into();
        validate_prefix(&prefix)?;
        self.key_prefix = prefix;
        Ok(self)
    }

    /// Defaults with the configured key prefix.
    pub fn from_settings(settings: &CacheSettings) -> CacheResult<Self> {
        Self::default().prefix(settings.key_prefix.clone())
    }

    pub fn retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn timeouts(mut self, connection: Duration, response: Duration) -> Self {
        self.connection_timeout = connection;
        self.response_timeout = response;
        self
    }
}

pub struct RedisStore {
    client: Arc<redis::Client>,
    config: RedisConfig,
}

impl RedisStore {
    pub fn new(redis_url: &str) -> Result<Self, redis::RedisError> {
        Self::from_config(redis_url, RedisConfig::default())
    }

    pub fn from_config(redis_url: &str, config: RedisConfig) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self {
            client: Arc::new(client),
            config,
        })
    }

    pub fn prefix(mut self, prefix: impl Into<String>) -> CacheResult<Self> {
        self.config = self.config.prefix(prefix)?;
        Ok(self)
    }

    pub fn config(&self) -> &RedisConfig {
        &self.config
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.config.key_prefix, key)
    }

    async fn get_connection(&self) -> CacheResult<redis::aio::MultiplexedConnection> {
        with_retry(
            self.config.max_retries,
            self.config.initial_backoff,
            self.config.max_backoff,
            Self::is_retryable,
            || async {
                tokio::time::timeout(
                    self.config.connection_timeout,
                    self.client.get_multiplexed_async_connection(),
                )
                .await
                .storage_err_ctx("connection timeout")?
                .storage_err()
            },
        )
        .await
    }

    /// Bound a command by the response timeout.
    async fn bounded<T>(
        &self,
        fut: impl std::future::Future<Output = redis::RedisResult<T>>,
    ) -> CacheResult<T> {
        tokio::time::timeout(self.config.response_timeout, fut)
            .await
            .storage_err_ctx("response timeout")?
            .storage_err()
    }

    fn is_retryable(error: &CacheError) -> bool {
        match error {
            CacheError::Store { message } => {
                message.contains("timeout")
                    || message.contains("connection")
                    || message.contains("BUSY")
                    || message.contains("LOADING")
                    || message.contains("CLUSTERDOWN")
            }
            _ => false,
        }
    }

    async fn scan_keys(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        pattern: &str,
    ) -> CacheResult<Vec<String>> {
        let mut cursor: u64 = 0;
        let mut all_keys = Vec::new();

        loop {
            let (next_cursor, keys): (u64, Vec<String>) = self
                .bounded(
                    redis::cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(pattern)
                        .arg("COUNT")
                        .arg(SCAN_BATCH)
                        .query_async(conn),
                )
                .await?;

            all_keys.extend(keys);
            cursor = next_cursor;
            if cursor == 0 {
                break;
            }
        }

        Ok(all_keys)
    }
}

fn escape_glob(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

fn pttl_to_duration(pttl: i64) -> Option<Duration> {
    (pttl >= 0).then(|| Duration::from_millis(pttl as u64))
}

#[async_trait]
impl SharedStore for RedisStore {
    fn name(&self) -> &str {
        "redis"
    }

    async fn get(&self, key: &str) -> CacheResult<Option<StoredValue>> {
        let mut conn = self.get_connection().await?;
        let key = self.full_key(key);

        let mut pipe = redis::pipe();
        pipe.cmd("GET").arg(&key).cmd("PTTL").arg(&key);
        let (payload, pttl): (Option<String>, i64) =
            self.bounded(pipe.query_async(&mut conn)).await?;

        Ok(payload.map(|payload| StoredValue {
            payload,
            ttl_remaining: pttl_to_duration(pttl),
        }))
    }

    async fn set(&self, key: &str, payload: &str, ttl: Option<Duration>) -> CacheResult<()> {
        let mut conn = self.get_connection().await?;
        let key = self.full_key(key);

        let mut cmd = redis::cmd("SET");
        cmd.arg(&key).arg(payload);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl.as_millis().max(1) as u64);
        }
        self.bounded(cmd.query_async::<()>(&mut conn)).await
    }

    async fn delete(&self, keys: &[String]) -> CacheResult<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.get_connection().await?;
        let full: Vec<String> = keys.iter().map(|k| self.full_key(k)).collect();
        self.bounded(redis::cmd("DEL").arg(&full).query_async::<u64>(&mut conn))
            .await
    }

    async fn keys_with_prefix(&self, prefix: &str) -> CacheResult<Vec<String>> {
        let mut conn = self.get_connection().await?;
        let pattern = format!(
            "{}{}*",
            escape_glob(&self.config.key_prefix),
            escape_glob(prefix)
        );
        let keys = self.scan_keys(&mut conn, &pattern).await?;

        let mut keys: Vec<String> = keys
            .into_iter()
            .filter_map(|k| k.strip_prefix(&self.config.key_prefix).map(str::to_string))
            .collect();
        keys.sort();
        keys.dedup();
        Ok(keys)
    }
}

#[async_trait]
impl SharedListOps for RedisStore {
    async fn rpush(&self, key: &str, value: &str) -> CacheResult<u64> {
        let mut conn = self.get_connection().await?;
        self.bounded(
            redis::cmd("RPUSH")
                .arg(self.full_key(key))
                .arg(value)
                .query_async::<u64>(&mut conn),
        )
        .await
    }

    async fn lpop(&self, key: &str) -> CacheResult<Option<String>> {
        let mut conn = self.get_connection().await?;
        self.bounded(
            redis::cmd("LPOP")
                .arg(self.full_key(key))
                .query_async::<Option<String>>(&mut conn),
        )
        .await
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> CacheResult<Vec<String>> {
        let mut conn = self.get_connection().await?;
        self.bounded(
            redis::cmd("LRANGE")
                .arg(self.full_key(key))
                .arg(start)
                .arg(stop)
                .query_async::<Vec<String>>(&mut conn),
        )
        .await
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>) -> CacheResult<bool> {
        let mut conn = self.get_connection().await?;
        let mut cmd = redis::cmd("SET");
        cmd.arg(self.full_key(key)).arg(value).arg("NX");
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl.as_millis().max(1) as u64);
        }
        let reply: Option<String> = self.bounded(cmd.query_async(&mut conn)).await?;
        Ok(reply.is_some())
    }
}
