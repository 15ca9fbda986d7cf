//! PostgreSQL usage store.
//!
//! Enable with the `postgres` feature flag.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Row};

use super::attribution::AgentDirectory;
use super::store::UsageStore;
use super::types::{
    ApplyOutcome, DailyUsageRecord, IdempotencyRecord, Metadata, MonthlyUsageRecord,
    TenantUsageSummary, UsageEntry, YearMonth,
};
use super::{MeteringError, MeteringResult, StorageResultExt};

/// Table names, optionally namespaced by a common prefix.
#[derive(Debug, Clone)]
struct Tables {
    summary: String,
    daily: String,
    monthly: String,
    idempotency: String,
}

impl Tables {
    fn with_prefix(prefix: &str) -> Self {
        Self {
            summary: format!("{}tenant_usage_summary", prefix),
            daily: format!("{}daily_token_usage", prefix),
            monthly: format!("{}monthly_token_usage", prefix),
            idempotency: format!("{}token_usage_idempotency", prefix),
        }
    }
}

/// Usage store backed by four tables. `apply` runs as one transaction whose
/// final statement claims the idempotency key; losing that race rolls the
/// whole transaction back.
pub struct PostgresUsageStore {
    pool: Arc<PgPool>,
    tables: Tables,
}

impl PostgresUsageStore {
    pub async fn new(database_url: &str) -> Result<Self, sqlx::Error> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self::with_pool(Arc::new(pool)))
    }

    pub fn with_pool(pool: Arc<PgPool>) -> Self {
        Self {
            pool,
            tables: Tables::with_prefix(""),
        }
    }

    /// Prefix every table name, e.g. `billing_`.
    pub fn with_table_prefix(mut self, prefix: &str) -> MeteringResult<Self> {
        validate_identifier("table prefix", prefix)?;
        self.tables = Tables::with_prefix(prefix);
        Ok(self)
    }

    pub async fn migrate(&self) -> Result<(), sqlx::Error> {
        let t = &self.tables;
        let statements = [
            format!(
                r#"
                CREATE TABLE IF NOT EXISTS {} (
                    tenant_id TEXT PRIMARY KEY,
                    token_usage BIGINT NOT NULL DEFAULT 0,
                    embedding_token_usage BIGINT NOT NULL DEFAULT 0,
                    llm_tokens BIGINT NOT NULL DEFAULT 0,
                    embedding_tokens BIGINT NOT NULL DEFAULT 0,
                    fine_tuning_tokens BIGINT NOT NULL DEFAULT 0,
                    last_activity TIMESTAMPTZ,
                    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                )
                "#,
                t.summary
            ),
            format!(
                r#"
                CREATE TABLE IF NOT EXISTS {} (
                    tenant_id TEXT NOT NULL,
                    usage_date DATE NOT NULL,
                    token_type TEXT NOT NULL,
                    operation TEXT NOT NULL,
                    model TEXT NOT NULL,
                    tokens BIGINT NOT NULL DEFAULT 0 CHECK (tokens >= 0),
                    metadata JSONB NOT NULL DEFAULT '{{}}'::jsonb,
                    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                    PRIMARY KEY (tenant_id, usage_date, token_type, operation, model)
                )
                "#,
                t.daily
            ),
            format!(
                r#"
                CREATE TABLE IF NOT EXISTS {} (
                    tenant_id TEXT NOT NULL,
                    year_month TEXT NOT NULL,
                    token_type TEXT NOT NULL,
                    tokens BIGINT NOT NULL DEFAULT 0 CHECK (tokens >= 0),
                    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                    PRIMARY KEY (tenant_id, year_month, token_type)
                )
                "#,
                t.monthly
            ),
            format!(
                r#"
                CREATE TABLE IF NOT EXISTS {} (
                    idempotency_key TEXT PRIMARY KEY,
                    tenant_id TEXT NOT NULL,
                    tokens BIGINT NOT NULL CHECK (tokens >= 0),
                    token_type TEXT NOT NULL,
                    operation TEXT NOT NULL,
                    model TEXT NOT NULL,
                    metadata JSONB NOT NULL DEFAULT '{{}}'::jsonb,
                    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                )
                "#,
                t.idempotency
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS idx_{0}_created ON {0} (created_at)",
                t.idempotency
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS idx_{0}_tenant_date ON {0} (tenant_id, usage_date)",
                t.daily
            ),
        ];

        for statement in &statements {
            sqlx::query(statement).execute(&*self.pool).await?;
        }
        Ok(())
    }
}

fn to_i64(value: u64) -> MeteringResult<i64> {
    i64::try_from(value)
        .map_err(|_| MeteringError::validation(format!("token count {} out of range", value)))
}

fn to_u64(value: i64) -> u64 {
    value.max(0) as u64
}

fn idempotency_from_row(row: &PgRow) -> MeteringResult<IdempotencyRecord> {
    Ok(IdempotencyRecord {
        idempotency_key: row.try_get("idempotency_key").storage_err()?,
        tenant_id: row.try_get("tenant_id").storage_err()?,
        tokens: to_u64(row.try_get("tokens").storage_err()?),
        token_type: row.try_get::<String, _>("token_type").storage_err()?.parse()?,
        operation: row.try_get::<String, _>("operation").storage_err()?.parse()?,
        model: row.try_get("model").storage_err()?,
        created_at: row.try_get("created_at").storage_err()?,
        metadata: row.try_get::<Json<Metadata>, _>("metadata").storage_err()?.0,
    })
}

#[async_trait]
impl UsageStore for PostgresUsageStore {
    fn name(&self) -> &str {
        "postgres"
    }

    async fn find_idempotency(
        &self,
        key: &str,
        dedupe_since: DateTime<Utc>,
    ) -> MeteringResult<Option<IdempotencyRecord>> {
        let query = format!(
            "SELECT * FROM {} WHERE idempotency_key = $1 AND created_at >= $2",
            self.tables.idempotency
        );
        let row = sqlx::query(&query)
            .bind(key)
            .bind(dedupe_since)
            .fetch_optional(&*self.pool)
            .await
            .storage_err()?;

        row.as_ref().map(idempotency_from_row).transpose()
    }

    async fn apply(
        &self,
        entry: &UsageEntry,
        dedupe_since: DateTime<Utc>,
    ) -> MeteringResult<ApplyOutcome> {
        let t = &self.tables;
        let tokens = to_i64(entry.tokens)?;
        let mut delta = TenantUsageSummary::empty(&entry.tenant_id);
        delta.try_add(entry.token_type, entry.tokens, entry.occurred_at)?;

        let mut tx = self.pool.begin().await.storage_err_ctx("begin transaction")?;

        let summary = format!(
            r#"
            INSERT INTO {0} AS s (tenant_id, token_usage, embedding_token_usage,
                                  llm_tokens, embedding_tokens, fine_tuning_tokens, last_activity)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (tenant_id) DO UPDATE SET
                token_usage = s.token_usage + EXCLUDED.token_usage,
                embedding_token_usage = s.embedding_token_usage + EXCLUDED.embedding_token_usage,
                llm_tokens = s.llm_tokens + EXCLUDED.llm_tokens,
                embedding_tokens = s.embedding_tokens + EXCLUDED.embedding_tokens,
                fine_tuning_tokens = s.fine_tuning_tokens + EXCLUDED.fine_tuning_tokens,
                last_activity = GREATEST(s.last_activity, EXCLUDED.last_activity),
                updated_at = NOW()
            "#,
            t.summary
        );
        sqlx::query(&summary)
            .bind(&entry.tenant_id)
            .bind(to_i64(delta.token_usage)?)
            .bind(to_i64(delta.embedding_token_usage)?)
            .bind(to_i64(delta.llm_tokens)?)
            .bind(to_i64(delta.embedding_tokens)?)
            .bind(to_i64(delta.fine_tuning_tokens)?)
            .bind(entry.occurred_at)
            .execute(&mut *tx)
            .await
            .storage_err_ctx("tenant summary upsert")?;

        let daily = format!(
            r#"
            INSERT INTO {0} AS d (tenant_id, usage_date, token_type, operation, model,
                                  tokens, metadata, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $8)
            ON CONFLICT (tenant_id, usage_date, token_type, operation, model) DO UPDATE SET
                tokens = d.tokens + EXCLUDED.tokens,
                metadata = d.metadata || EXCLUDED.metadata,
                updated_at = EXCLUDED.updated_at
            "#,
            t.daily
        );
        sqlx::query(&daily)
            .bind(&entry.tenant_id)
            .bind(entry.date())
            .bind(entry.token_type.as_str())
            .bind(entry.operation.as_str())
            .bind(&entry.model)
            .bind(tokens)
            .bind(Json(&entry.metadata))
            .bind(entry.occurred_at)
            .execute(&mut *tx)
            .await
            .storage_err_ctx("daily usage upsert")?;

        let monthly = format!(
            r#"
            INSERT INTO {0} AS m (tenant_id, year_month, token_type, tokens, updated_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (tenant_id, year_month, token_type) DO UPDATE SET
                tokens = m.tokens + EXCLUDED.tokens,
                updated_at = EXCLUDED.updated_at
            "#,
            t.monthly
        );
        sqlx::query(&monthly)
            .bind(&entry.tenant_id)
            .bind(entry.year_month().to_string())
            .bind(entry.token_type.as_str())
            .bind(tokens)
            .bind(entry.occurred_at)
            .execute(&mut *tx)
            .await
            .storage_err_ctx("monthly usage upsert")?;

        if let Some(ref key) = entry.idempotency_key {
            // An expired row is reclaimed; a live one leaves zero rows affected.
            let claim = format!(
                r#"
                INSERT INTO {0} AS i (idempotency_key, tenant_id, tokens, token_type,
                                      operation, model, metadata, created_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                ON CONFLICT (idempotency_key) DO UPDATE SET
                    tenant_id = EXCLUDED.tenant_id,
                    tokens = EXCLUDED.tokens,
                    token_type = EXCLUDED.token_type,
                    operation = EXCLUDED.operation,
                    model = EXCLUDED.model,
                    metadata = EXCLUDED.metadata,
                    created_at = EXCLUDED.created_at
                WHERE i.created_at < $9
                "#,
                t.idempotency
            );
            let claimed = sqlx::query(&claim)
                .bind(key)
                .bind(&entry.tenant_id)
                .bind(tokens)
                .bind(entry.token_type.as_str())
                .bind(entry.operation.as_str())
                .bind(&entry.model)
                .bind(Json(&entry.metadata))
                .bind(entry.occurred_at)
                .bind(dedupe_since)
                .execute(&mut *tx)
                .await
                .storage_err_ctx("idempotency claim")?;

            if claimed.rows_affected() == 0 {
                tx.rollback().await.storage_err_ctx("rollback")?;
                return Ok(ApplyOutcome::Duplicate);
            }
        }

        tx.commit().await.storage_err_ctx("commit")?;
        Ok(ApplyOutcome::Applied)
    }

    async fn tenant_summary(&self, tenant_id: &str) -> MeteringResult<Option<TenantUsageSummary>> {
        let query = format!("SELECT * FROM {} WHERE tenant_id = $1", self.tables.summary);
        let row = sqlx::query(&query)
            .bind(tenant_id)
            .fetch_optional(&*self.pool)
            .await
            .storage_err()?;

        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(TenantUsageSummary {
            tenant_id: row.try_get("tenant_id").storage_err()?,
            token_usage: to_u64(row.try_get("token_usage").storage_err()?),
            embedding_token_usage: to_u64(row.try_get("embedding_token_usage").storage_err()?),
            llm_tokens: to_u64(row.try_get("llm_tokens").storage_err()?),
            embedding_tokens: to_u64(row.try_get("embedding_tokens").storage_err()?),
            fine_tuning_tokens: to_u64(row.try_get("fine_tuning_tokens").storage_err()?),
            last_activity: row.try_get("last_activity").storage_err()?,
        }))
    }

    async fn daily_usage(
        &self,
        tenant_id: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> MeteringResult<Vec<DailyUsageRecord>> {
        let query = format!(
            r#"
            SELECT * FROM {} WHERE tenant_id = $1 AND usage_date BETWEEN $2 AND $3
            ORDER BY usage_date, token_type, operation, model
            "#,
            self.tables.daily
        );
        let rows = sqlx::query(&query)
            .bind(tenant_id)
            .bind(from)
            .bind(to)
            .fetch_all(&*self.pool)
            .await
            .storage_err()?;

        rows.iter()
            .map(|row| {
                Ok(DailyUsageRecord {
                    tenant_id: row.try_get("tenant_id").storage_err()?,
                    date: row.try_get("usage_date").storage_err()?,
                    token_type: row.try_get::<String, _>("token_type").storage_err()?.parse()?,
                    operation: row.try_get::<String, _>("operation").storage_err()?.parse()?,
                    model: row.try_get("model").storage_err()?,
                    tokens: to_u64(row.try_get("tokens").storage_err()?),
                    metadata: row.try_get::<Json<Metadata>, _>("metadata").storage_err()?.0,
                    created_at: row.try_get("created_at").storage_err()?,
                    updated_at: row.try_get("updated_at").storage_err()?,
                })
            })
            .collect()
    }

    async fn monthly_usage(
        &self,
        tenant_id: &str,
        from: YearMonth,
        to: YearMonth,
    ) -> MeteringResult<Vec<MonthlyUsageRecord>> {
        // YYYY-MM sorts lexicographically in calendar order.
        let query = format!(
            r#"
            SELECT * FROM {} WHERE tenant_id = $1 AND year_month BETWEEN $2 AND $3
            ORDER BY year_month, token_type
            "#,
            self.tables.monthly
        );
        let rows = sqlx::query(&query)
            .bind(tenant_id)
            .bind(from.to_string())
            .bind(to.to_string())
            .fetch_all(&*self.pool)
            .await
            .storage_err()?;

        rows.iter()
            .map(|row| {
                Ok(MonthlyUsageRecord {
                    tenant_id: row.try_get("tenant_id").storage_err()?,
                    year_month: row.try_get::<String, _>("year_month").storage_err()?.parse()?,
                    token_type: row.try_get::<String, _>("token_type").storage_err()?.parse()?,
                    tokens: to_u64(row.try_get("tokens").storage_err()?),
                    updated_at: row.try_get("updated_at").storage_err()?,
                })
            })
            .collect()
    }

    async fn purge_idempotency(&self, older_than: DateTime<Utc>) -> MeteringResult<u64> {
        let query = format!(
            "DELETE FROM {} WHERE created_at < $1",
            self.tables.idempotency
        );
        let result = sqlx::query(&query)
            .bind(older_than)
            .execute(&*self.pool)
            .await
            .storage_err()?;
        Ok(result.rows_affected())
    }
}

/// Resolves agent owners from the platform's agents table.
pub struct PgAgentDirectory {
    pool: Arc<PgPool>,
    table_name: String,
}

impl PgAgentDirectory {
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self {
            pool,
            table_name: "agents".to_string(),
        }
    }

    pub fn with_table_name(mut self, name: impl Into<String>) -> MeteringResult<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(MeteringError::validation("Agent table name must not be empty"));
        }
        validate_identifier("table name", &name)?;
        self.table_name = name;
        Ok(self)
    }
}

/// Names spliced into SQL are limited to ASCII alphanumerics and `_`.
fn validate_identifier(kind: &str, value: &str) -> MeteringResult<()> {
    if !value.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(MeteringError::validation(format!(
            "Invalid {} '{}': only ASCII alphanumeric and underscore allowed",
            kind, value
        )));
    }
    Ok(())
}

#[async_trait]
impl AgentDirectory for PgAgentDirectory {
    async fn agent_owner(&self, agent_id: &str) -> MeteringResult<Option<String>> {
        let query = format!(
            "SELECT tenant_id::text AS tenant_id FROM {} WHERE id::text = $1",
            self.table_name
        );
        let row = sqlx::query(&query)
            .bind(agent_id)
            .fetch_optional(&*self.pool)
            .await
            .storage_err()?;

        row.map(|r| r.try_get::<String, _>("tenant_id"))
            .transpose()
            .storage_err()
    }
}
