//! Usage storage backends.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use tokio::sync::Mutex;

use super::MeteringResult;
use super::types::{
    ApplyOutcome, DailyUsageRecord, IdempotencyRecord, MonthlyUsageRecord, Operation,
    TenantUsageSummary, TokenType, UsageEntry, YearMonth, checked_tokens,
};

/// Persistent home of the idempotency ledger and usage rollups.
///
/// `apply` must be atomic: the summary increment, daily upsert, monthly
/// upsert and idempotency write either all happen or none do. A key already
/// recorded at or after `dedupe_since` yields [`ApplyOutcome::Duplicate`]
/// with nothing changed.
#[async_trait]
pub trait UsageStore: Send + Sync {
    fn name(&self) -> &str;

    async fn find_idempotency(
        &self,
        key: &str,
        dedupe_since: DateTime<Utc>,
    ) -> MeteringResult<Option<IdempotencyRecord>>;

    async fn apply(
        &self,
        entry: &UsageEntry,
        dedupe_since: DateTime<Utc>,
    ) -> MeteringResult<ApplyOutcome>;

    async fn tenant_summary(&self, tenant_id: &str) -> MeteringResult<Option<TenantUsageSummary>>;

    /// Daily rows with `from <= date <= to`.
    async fn daily_usage(
        &self,
        tenant_id: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> MeteringResult<Vec<DailyUsageRecord>>;

    /// Monthly rows with `from <= year_month <= to`.
    async fn monthly_usage(
        &self,
        tenant_id: &str,
        from: YearMonth,
        to: YearMonth,
    ) -> MeteringResult<Vec<MonthlyUsageRecord>>;

    /// Delete idempotency records created before `older_than`.
    async fn purge_idempotency(&self, older_than: DateTime<Utc>) -> MeteringResult<u64>;
}

type DailyKey = (String, NaiveDate, TokenType, Operation, String);
type MonthlyKey = (String, YearMonth, TokenType);

#[derive(Debug, Default)]
struct UsageState {
    idempotency: HashMap<String, IdempotencyRecord>,
    daily: BTreeMap<DailyKey, DailyUsageRecord>,
    monthly: BTreeMap<MonthlyKey, MonthlyUsageRecord>,
    summaries: HashMap<String, TenantUsageSummary>,
}

/// In-memory store (for testing and single-instance deployments).
///
/// One lock covers all tables, so `apply` is atomic with respect to every
/// other call.
#[derive(Debug, Default)]
pub struct MemoryUsageStore {
    state: Mutex<UsageState>,
}

impl MemoryUsageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn idempotency_len(&self) -> usize {
        self.state.lock().await.idempotency.len()
    }
}

#[async_trait]
impl UsageStore for MemoryUsageStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn find_idempotency(
        &self,
        key: &str,
        dedupe_since: DateTime<Utc>,
    ) -> MeteringResult<Option<IdempotencyRecord>> {
        let state = self.state.lock().await;
        Ok(state
            .idempotency
            .get(key)
            .filter(|r| r.created_at >= dedupe_since)
            .cloned())
    }

    async fn apply(
        &self,
        entry: &UsageEntry,
        dedupe_since: DateTime<Utc>,
    ) -> MeteringResult<ApplyOutcome> {
        let mut state = self.state.lock().await;

        if let Some(ref key) = entry.idempotency_key
            && state
                .idempotency
                .get(key)
                .is_some_and(|r| r.created_at >= dedupe_since)
        {
            return Ok(ApplyOutcome::Duplicate);
        }

        let now = entry.occurred_at;
        let date = entry.date();
        let year_month = entry.year_month();
        let daily_key = (
            entry.tenant_id.clone(),
            date,
            entry.token_type,
            entry.operation,
            entry.model.clone(),
        );
        let monthly_key = (entry.tenant_id.clone(), year_month, entry.token_type);

        // Every increment is checked before any table changes.
        let mut summary = state
            .summaries
            .get(&entry.tenant_id)
            .cloned()
            .unwrap_or_else(|| TenantUsageSummary::empty(&entry.tenant_id));
        summary.try_add(entry.token_type, entry.tokens, now)?;
        let daily_tokens = checked_tokens(
            state.daily.get(&daily_key).map_or(0, |row| row.tokens),
            entry.tokens,
        )?;
        let monthly_tokens = checked_tokens(
            state.monthly.get(&monthly_key).map_or(0, |row| row.tokens),
            entry.tokens,
        )?;

        state.summaries.insert(entry.tenant_id.clone(), summary);

        state
            .daily
            .entry(daily_key)
            .and_modify(|row| {
                row.tokens = daily_tokens;
                row.metadata
                    .extend(entry.metadata.iter().map(|(k, v)| (k.clone(), v.clone())));
                row.updated_at = now;
            })
            .or_insert_with(|| DailyUsageRecord {
                tenant_id: entry.tenant_id.clone(),
                date,
                token_type: entry.token_type,
                operation: entry.operation,
                model: entry.model.clone(),
                tokens: daily_tokens,
                metadata: entry.metadata.clone(),
                created_at: now,
                updated_at: now,
            });

        state
            .monthly
            .entry(monthly_key)
            .and_modify(|row| {
                row.tokens = monthly_tokens;
                row.updated_at = now;
            })
            .or_insert_with(|| MonthlyUsageRecord {
                tenant_id: entry.tenant_id.clone(),
                year_month,
                token_type: entry.token_type,
                tokens: monthly_tokens,
                updated_at: now,
            });

        if let Some(ref key) = entry.idempotency_key {
            state
                .idempotency
                .insert(key.clone(), IdempotencyRecord::from_entry(key, entry));
        }

        Ok(ApplyOutcome::Applied)
    }

    async fn tenant_summary(&self, tenant_id: &str) -> MeteringResult<Option<TenantUsageSummary>> {
        Ok(self.state.lock().await.summaries.get(tenant_id).cloned())
    }

    async fn daily_usage(
        &self,
        tenant_id: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> MeteringResult<Vec<DailyUsageRecord>> {
        let state = self.state.lock().await;
        Ok(state
            .daily
            .values()
            .filter(|r| r.tenant_id == tenant_id && r.date >= from && r.date <= to)
            .cloned()
            .collect())
    }

    async fn monthly_usage(
        &self,
        tenant_id: &str,
        from: YearMonth,
        to: YearMonth,
    ) -> MeteringResult<Vec<MonthlyUsageRecord>> {
        let state = self.state.lock().await;
        Ok(state
            .monthly
            .values()
            .filter(|r| r.tenant_id == tenant_id && r.year_month >= from && r.year_month <= to)
            .cloned()
            .collect())
    }

    async fn purge_idempotency(&self, older_than: DateTime<Utc>) -> MeteringResult<u64> {
        let mut state = self.state.lock().await;
        let before = state.idempotency.len();
        state.idempotency.retain(|_, r| r.created_at >= older_than);
        Ok((before - state.idempotency.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metering::{Metadata, MeteringError};
    use chrono::{Duration, TimeZone};
    use serde_json::json;

    fn entry(key: Option<&str>, tokens: u64, at: DateTime<Utc>) -> UsageEntry {
        UsageEntry {
            idempotency_key: key.map(str::to_string),
            tenant_id: "t1".into(),
            tokens,
            token_type: TokenType::Llm,
            operation: Operation::Chat,
            model: "gpt-4o".into(),
            metadata: Metadata::new(),
            occurred_at: at,
        }
    }

    #[tokio::test]
    async fn test_apply_updates_all_tables() {
        let store = MemoryUsageStore::new();
        let at = Utc.with_ymd_and_hms(2025, 3, 14, 9, 0, 0).unwrap();

        let outcome = store
            .apply(&entry(Some("k1"), 40, at), at - Duration::hours(24))
            .await
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::Applied);

        let summary = store.tenant_summary("t1").await.unwrap().unwrap();
        assert_eq!(summary.llm_tokens, 40);
        assert_eq!(summary.token_usage, 40);

        let day = at.date_naive();
        let daily = store.daily_usage("t1", day, day).await.unwrap();
        assert_eq!(daily.len(), 1);
        assert_eq!(daily[0].tokens, 40);

        let ym = YearMonth::of(day);
        let monthly = store.monthly_usage("t1", ym, ym).await.unwrap();
        assert_eq!(monthly[0].tokens, 40);

        assert!(store
            .find_idempotency("k1", at - Duration::hours(24))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_duplicate_changes_nothing() {
        let store = MemoryUsageStore::new();
        let at = Utc.with_ymd_and_hms(2025, 3, 14, 9, 0, 0).unwrap();
        let since = at - Duration::hours(24);

        store.apply(&entry(Some("k1"), 40, at), since).await.unwrap();
        let outcome = store
            .apply(&entry(Some("k1"), 40, at + Duration::minutes(1)), since)
            .await
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::Duplicate);
        assert_eq!(
            store.tenant_summary("t1").await.unwrap().unwrap().llm_tokens,
            40
        );
    }

    #[tokio::test]
    async fn test_expired_key_is_reapplied() {
        let store = MemoryUsageStore::new();
        let first = Utc.with_ymd_and_hms(2025, 3, 14, 9, 0, 0).unwrap();
        let second = first + Duration::hours(25);

        store
            .apply(&entry(Some("k1"), 10, first), first - Duration::hours(24))
            .await
            .unwrap();
        let outcome = store
            .apply(&entry(Some("k1"), 10, second), second - Duration::hours(24))
            .await
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::Applied);
        assert_eq!(
            store.tenant_summary("t1").await.unwrap().unwrap().llm_tokens,
            20
        );
    }

    #[tokio::test]
    async fn test_daily_metadata_merge() {
        let store = MemoryUsageStore::new();
        let at = Utc.with_ymd_and_hms(2025, 3, 14, 9, 0, 0).unwrap();
        let since = at - Duration::hours(24);

        let mut first = entry(None, 5, at);
        first.metadata.insert("source".into(), json!("api"));
        let mut second = entry(None, 7, at);
        second.metadata.insert("agent_id".into(), json!("a1"));

        store.apply(&first, since).await.unwrap();
        store.apply(&second, since).await.unwrap();

        let daily = store
            .daily_usage("t1", at.date_naive(), at.date_naive())
            .await
            .unwrap();
        assert_eq!(daily[0].tokens, 12);
        assert_eq!(daily[0].metadata["source"], "api");
        assert_eq!(daily[0].metadata["agent_id"], "a1");
    }

    #[tokio::test]
    async fn test_overflow_rejects_whole_entry() {
        let store = MemoryUsageStore::new();
        let at = Utc.with_ymd_and_hms(2025, 3, 14, 9, 0, 0).unwrap();
        let since = at - Duration::hours(24);

        store.apply(&entry(None, u64::MAX - 5, at), since).await.unwrap();
        let err = store
            .apply(&entry(Some("k-over"), 10, at), since)
            .await
            .unwrap_err();
        assert!(matches!(err, MeteringError::Validation { .. }));

        let summary = store.tenant_summary("t1").await.unwrap().unwrap();
        assert_eq!(summary.llm_tokens, u64::MAX - 5);
        let daily = store
            .daily_usage("t1", at.date_naive(), at.date_naive())
            .await
            .unwrap();
        assert_eq!(daily[0].tokens, u64::MAX - 5);
        assert_eq!(store.idempotency_len().await, 0);
    }

    #[tokio::test]
    async fn test_purge_idempotency() {
        let store = MemoryUsageStore::new();
        let old = Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap();
        let recent = Utc.with_ymd_and_hms(2025, 3, 3, 0, 0, 0).unwrap();

        store
            .apply(&entry(Some("old"), 1, old), old - Duration::hours(24))
            .await
            .unwrap();
        store
            .apply(&entry(Some("new"), 1, recent), recent - Duration::hours(24))
            .await
            .unwrap();

        let purged = store
            .purge_idempotency(recent - Duration::hours(24))
            .await
            .unwrap();
        assert_eq!(purged, 1);
        assert_eq!(store.idempotency_len().await, 1);
    }
}
