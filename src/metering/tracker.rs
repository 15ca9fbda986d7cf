//! Token usage tracker.

use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, Utc};
use serde_json::Value;
use tracing::{Instrument, Span, debug, error, info, warn};
use uuid::Uuid;

use super::attribution::{Attribution, AttributionResolver};
use super::store::UsageStore;
use super::types::{
    ApplyOutcome, Granularity, Metadata, Operation, TokenType, UsageBuckets, UsageEntry,
    UsageTotals, YearMonth,
};
use super::{IDEMPOTENCY_RETENTION, MeteringError, MeteringResult, UNKNOWN_MODEL, retention_cutoff};
use crate::config::MeteringSettings;
use crate::observability::{MetricsRegistry, usage_span};

/// One usage report. Only the tenant and token count are required.
#[derive(Debug, Clone, Default)]
pub struct UsageEvent {
    pub tenant_id: String,
    pub tokens: i64,
    pub token_type: Option<TokenType>,
    pub operation: Option<Operation>,
    pub model: Option<String>,
    pub metadata: Metadata,
    pub idempotency_key: Option<String>,
    pub agent_id: Option<String>,
    pub conversation_id: Option<String>,
}

impl UsageEvent {
    pub fn new(tenant_id: impl Into<String>, tokens: i64) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            tokens,
            ..Default::default()
        }
    }

    pub fn token_type(mut self, token_type: TokenType) -> Self {
        self.token_type = Some(token_type);
        self
    }

    pub fn operation(mut self, operation: Operation) -> Self {
        self.operation = Some(operation);
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn metadata_entry(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    pub fn conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }
}

/// Records token usage exactly once per idempotency key and keeps the
/// daily, monthly and per-tenant rollups in step.
pub struct UsageTracker {
    store: Arc<dyn UsageStore>,
    attribution: Option<Arc<AttributionResolver>>,
    metrics: Arc<MetricsRegistry>,
    retention: Duration,
}

impl UsageTracker {
    pub fn new(store: Arc<dyn UsageStore>) -> Self {
        Self {
            store,
            attribution: None,
            metrics: Arc::default(),
            retention: IDEMPOTENCY_RETENTION,
        }
    }

    pub fn attribution(mut self, resolver: Arc<AttributionResolver>) -> Self {
        self.attribution = Some(resolver);
        self
    }

    pub fn metrics(mut self, metrics: Arc<MetricsRegistry>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn settings(self, settings: &MeteringSettings) -> Self {
        self.retention(settings.retention)
    }

    pub fn store(&self) -> &Arc<dyn UsageStore> {
        &self.store
    }

    pub fn idempotency_retention(&self) -> Duration {
        self.retention
    }

    /// Record usage. Returns `true` when the usage is accounted for, including
    /// no-op cases (non-positive tokens, duplicate key).
    ///
    /// Never fails: storage errors are logged and reported as `false`.
    pub async fn track_usage(&self, event: UsageEvent) -> bool {
        if event.tokens <= 0 {
            debug!(tenant_id = %event.tenant_id, tokens = event.tokens, "Skipping non-positive usage");
            self.metrics.record_usage_skipped();
            return true;
        }

        if event.tenant_id.trim().is_empty() {
            error!(tokens = event.tokens, "Usage event without tenant_id dropped");
            self.metrics.record_usage_failure();
            return false;
        }

        let event_id = Uuid::new_v4().to_string();
        let token_type = event.token_type.unwrap_or_default();
        let operation = event.operation.unwrap_or_default();
        let span = usage_span(&event_id, &event.tenant_id, token_type, operation, event.tokens);

        self.track_inner(event, event_id, token_type, operation)
            .instrument(span)
            .await
    }

    async fn track_inner(
        &self,
        event: UsageEvent,
        event_id: String,
        token_type: TokenType,
        operation: Operation,
    ) -> bool {
        let span = Span::current();
        let tokens = event.tokens as u64;
        let model = event
            .model
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| UNKNOWN_MODEL.to_string());
        let idempotency_key = event.idempotency_key.filter(|k| !k.is_empty());

        let attribution = match &self.attribution {
            Some(resolver) => {
                resolver
                    .resolve_billing_tenant(&event.tenant_id, event.agent_id.as_deref())
                    .await
            }
            None => Attribution {
                billing_tenant_id: event.tenant_id.clone(),
                metadata: None,
            },
        };
        span.record("billing_tenant_id", attribution.billing_tenant_id.as_str());

        let mut metadata = event.metadata;
        metadata.insert("event_id".into(), event_id.into());
        if let Some(agent_id) = event.agent_id {
            metadata.insert("agent_id".into(), agent_id.into());
        }
        if let Some(conversation_id) = event.conversation_id {
            metadata.insert("conversation_id".into(), conversation_id.into());
        }
        if let Some(ref attribution_metadata) = attribution.metadata {
            metadata.extend(attribution_metadata.to_metadata());
        }

        let now = Utc::now();
        let dedupe_since = retention_cutoff(now, self.retention);

        if let Some(ref key) = idempotency_key {
            match self.store.find_idempotency(key, dedupe_since).await {
                Ok(Some(_)) => {
                    debug!(idempotency_key = %key, "Usage already recorded");
                    span.record("outcome", "duplicate");
                    self.metrics.record_usage_duplicate();
                    return true;
                }
                Ok(None) => {}
                // apply() re-checks the key atomically
                Err(e) => warn!(idempotency_key = %key, error = %e, "Idempotency lookup failed"),
            }
        }

        let entry = UsageEntry {
            idempotency_key,
            tenant_id: attribution.billing_tenant_id,
            tokens,
            token_type,
            operation,
            model,
            metadata,
            occurred_at: now,
        };

        match self.store.apply(&entry, dedupe_since).await {
            Ok(ApplyOutcome::Applied) => {
                span.record("outcome", "applied");
                self.metrics.record_usage(token_type, tokens);
                debug!(
                    tenant_id = %entry.tenant_id,
                    tokens,
                    model = %entry.model,
                    "Recorded token usage"
                );
                true
            }
            Ok(ApplyOutcome::Duplicate) => {
                span.record("outcome", "duplicate");
                self.metrics.record_usage_duplicate();
                debug!(idempotency_key = ?entry.idempotency_key, "Concurrent duplicate usage ignored");
                true
            }
            Err(e) => {
                span.record("outcome", "failed");
                self.metrics.record_usage_failure();
                error!(
                    tenant_id = %entry.tenant_id,
                    tokens,
                    token_type = token_type.as_str(),
                    operation = operation.as_str(),
                    model = %entry.model,
                    idempotency_key = ?entry.idempotency_key,
                    store = self.store.name(),
                    error = %e,
                    "Failed to record token usage"
                );
                false
            }
        }
    }

    pub async fn record_llm_tokens(
        &self,
        tenant_id: &str,
        tokens: i64,
        model: &str,
        operation: Operation,
        idempotency_key: Option<&str>,
    ) -> bool {
        let mut event = UsageEvent::new(tenant_id, tokens)
            .token_type(TokenType::Llm)
            .operation(operation)
            .model(model);
        event.idempotency_key = idempotency_key.map(str::to_string);
        self.track_usage(event).await
    }

    pub async fn record_embedding_tokens(
        &self,
        tenant_id: &str,
        tokens: i64,
        model: &str,
        operation: Operation,
        idempotency_key: Option<&str>,
    ) -> bool {
        let mut event = UsageEvent::new(tenant_id, tokens)
            .token_type(TokenType::Embedding)
            .operation(operation)
            .model(model);
        event.idempotency_key = idempotency_key.map(str::to_string);
        self.track_usage(event).await
    }

    /// Running totals for a tenant. Zero for tenants with no usage yet.
    pub async fn tenant_totals(&self, tenant_id: &str) -> MeteringResult<UsageTotals> {
        Ok(self
            .store
            .tenant_summary(tenant_id)
            .await?
            .map(|s| s.totals())
            .unwrap_or_default())
    }

    /// Tokens per type bucketed by day (`YYYY-MM-DD`) or month (`YYYY-MM`),
    /// for `from..=to`.
    pub async fn usage_by_period(
        &self,
        tenant_id: &str,
        from: NaiveDate,
        to: NaiveDate,
        granularity: Granularity,
    ) -> MeteringResult<UsageBuckets> {
        if from > to {
            return Err(MeteringError::validation(format!(
                "period start {} is after end {}",
                from, to
            )));
        }

        let mut buckets = UsageBuckets::new();
        match granularity {
            Granularity::Daily => {
                for row in self.store.daily_usage(tenant_id, from, to).await? {
                    *buckets
                        .entry(row.date.format("%Y-%m-%d").to_string())
                        .or_default()
                        .entry(row.token_type)
                        .or_default() += row.tokens;
                }
            }
            Granularity::Monthly => {
                let rows = self
                    .store
                    .monthly_usage(tenant_id, YearMonth::of(from), YearMonth::of(to))
                    .await?;
                for row in rows {
                    *buckets
                        .entry(row.year_month.to_string())
                        .or_default()
                        .entry(row.token_type)
                        .or_default() += row.tokens;
                }
            }
        }
        Ok(buckets)
    }

    /// Delete idempotency records older than the retention window.
    pub async fn purge_expired_idempotency(&self) -> MeteringResult<u64> {
        let cutoff = retention_cutoff(Utc::now(), self.retention);
        let purged = self.store.purge_idempotency(cutoff).await?;
        self.metrics.record_idempotency_purge(purged);
        if purged > 0 {
            info!(purged, cutoff = %cutoff, "Purged expired idempotency records");
        }
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metering::{
        DailyUsageRecord, IdempotencyRecord, InMemoryAgentDirectory, MemoryUsageStore,
        MonthlyUsageRecord, TenantUsageSummary,
    };
    use async_trait::async_trait;
    use chrono::DateTime;
    use serde_json::json;

    fn tracker() -> (UsageTracker, Arc<MemoryUsageStore>) {
        let store = Arc::new(MemoryUsageStore::new());
        (UsageTracker::new(store.clone()), store)
    }

    struct FailingStore;

    #[async_trait]
    impl UsageStore for FailingStore {
        fn name(&self) -> &str {
            "failing"
        }
        async fn find_idempotency(
            &self,
            _key: &str,
            _since: DateTime<Utc>,
        ) -> MeteringResult<Option<IdempotencyRecord>> {
            Ok(None)
        }
        async fn apply(
            &self,
            _entry: &UsageEntry,
            _since: DateTime<Utc>,
        ) -> MeteringResult<ApplyOutcome> {
            Err(MeteringError::storage("could not serialize access"))
        }
        async fn tenant_summary(&self, _t: &str) -> MeteringResult<Option<TenantUsageSummary>> {
            Ok(None)
        }
        async fn daily_usage(
            &self,
            _t: &str,
            _f: NaiveDate,
            _to: NaiveDate,
        ) -> MeteringResult<Vec<DailyUsageRecord>> {
            Ok(Vec::new())
        }
        async fn monthly_usage(
            &self,
            _t: &str,
            _f: YearMonth,
            _to: YearMonth,
        ) -> MeteringResult<Vec<MonthlyUsageRecord>> {
            Ok(Vec::new())
        }
        async fn purge_idempotency(&self, _o: DateTime<Utc>) -> MeteringResult<u64> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn test_defaults_applied() {
        let (tracker, store) = tracker();
        assert!(tracker.track_usage(UsageEvent::new("t1", 25)).await);

        let today = Utc::now().date_naive();
        let rows = store.daily_usage("t1", today, today).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].token_type, TokenType::Llm);
        assert_eq!(rows[0].operation, Operation::Query);
        assert_eq!(rows[0].model, UNKNOWN_MODEL);
        assert!(rows[0].metadata.contains_key("event_id"));
    }

    #[tokio::test]
    async fn test_non_positive_tokens_are_noops() {
        let (tracker, store) = tracker();
        assert!(tracker.track_usage(UsageEvent::new("t1", 0)).await);
        assert!(tracker.track_usage(UsageEvent::new("t1", -5)).await);
        assert!(store.tenant_summary("t1").await.unwrap().is_none());
        assert_eq!(tracker.metrics.usage_skipped.get(), 2);
    }

    #[tokio::test]
    async fn test_idempotent_replay() {
        let (tracker, _store) = tracker();
        let event = UsageEvent::new("t1", 100)
            .model("gpt-4o")
            .operation(Operation::Chat)
            .idempotency_key("t1:gpt-4o:conv1:chat:abc");

        assert!(tracker.track_usage(event.clone()).await);
        assert!(tracker.track_usage(event).await);

        let totals = tracker.tenant_totals("t1").await.unwrap();
        assert_eq!(totals.llm_tokens, 100);
        assert_eq!(tracker.metrics.usage_duplicates.get(), 1);
    }

    #[tokio::test]
    async fn test_storage_failure_returns_false() {
        let tracker = UsageTracker::new(Arc::new(FailingStore));
        assert!(!tracker.track_usage(UsageEvent::new("t1", 10)).await);
        assert_eq!(tracker.metrics.usage_failures.get(), 1);
    }

    #[tokio::test]
    async fn test_missing_tenant_rejected() {
        let (tracker, _) = tracker();
        assert!(!tracker.track_usage(UsageEvent::new("  ", 10)).await);
    }

    #[tokio::test]
    async fn test_attribution_bills_owner() {
        let directory = InMemoryAgentDirectory::new();
        directory.register("agent-b", "tenant-b");
        let resolver = Arc::new(AttributionResolver::new(Arc::new(directory)));
        let (tracker, store) = tracker();
        let tracker = tracker.attribution(resolver);

        assert!(
            tracker
                .track_usage(
                    UsageEvent::new("tenant-a", 60)
                        .agent("agent-b")
                        .conversation("conv-1")
                        .metadata_entry("source", json!("widget"))
                )
                .await
        );

        assert_eq!(tracker.tenant_totals("tenant-a").await.unwrap().llm_tokens, 0);
        assert_eq!(tracker.tenant_totals("tenant-b").await.unwrap().llm_tokens, 60);

        let today = Utc::now().date_naive();
        let rows = store.daily_usage("tenant-b", today, today).await.unwrap();
        let metadata = &rows[0].metadata;
        assert_eq!(metadata["requester_tenant_id"], "tenant-a");
        assert_eq!(metadata["owner_tenant_id"], "tenant-b");
        assert_eq!(metadata["agent_id"], "agent-b");
        assert_eq!(metadata["conversation_id"], "conv-1");
        assert_eq!(metadata["source"], "widget");
    }

    #[tokio::test]
    async fn test_usage_by_period() {
        let (tracker, _) = tracker();
        assert!(
            tracker
                .record_llm_tokens("t1", 10, "gpt-4o", Operation::Chat, None)
                .await
        );
        assert!(
            tracker
                .record_embedding_tokens("t1", 5, "text-embedding-3-small", Operation::VectorSearch, None)
                .await
        );
        assert!(
            tracker
                .record_llm_tokens("t1", 7, "gpt-4o-mini", Operation::Summarize, None)
                .await
        );

        let today = Utc::now().date_naive();
        let daily = tracker
            .usage_by_period("t1", today, today, Granularity::Daily)
            .await
            .unwrap();
        let day = &daily[&today.format("%Y-%m-%d").to_string()];
        assert_eq!(day[&TokenType::Llm], 17);
        assert_eq!(day[&TokenType::Embedding], 5);

        let monthly = tracker
            .usage_by_period("t1", today, today, Granularity::Monthly)
            .await
            .unwrap();
        assert_eq!(monthly[&YearMonth::of(today).to_string()], *day);

        assert!(
            tracker
                .usage_by_period("t1", today, today.pred_opt().unwrap(), Granularity::Daily)
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_purge_keeps_recent_keys() {
        let (tracker, store) = tracker();
        tracker
            .track_usage(UsageEvent::new("t1", 1).idempotency_key("k"))
            .await;
        assert_eq!(tracker.purge_expired_idempotency().await.unwrap(), 0);
        assert_eq!(store.idempotency_len().await, 1);

        let tracker = tracker.retention(Duration::ZERO);
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(tracker.purge_expired_idempotency().await.unwrap(), 1);
    }
}
