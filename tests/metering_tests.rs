//! Usage metering integration tests against the in-memory backends.
//!
//! ### 1. Idempotency
//! - Repeated events with the same key are applied once
//! - Concurrent duplicates race to a single application
//!
//! ### 2. Rollups
//! - Summary, daily and monthly counters agree
//! - Concurrent increments are additive
//!
//! ### 3. Attribution
//! - Shared agents bill their owning tenant

use std::sync::Arc;

use cachemeter::metering::{
    AttributionResolver, Granularity, InMemoryAgentDirectory, MemoryUsageStore, Operation,
    TokenType, UsageEvent, UsageStore, UsageTracker,
};
use cachemeter::observability::{MetricsConfig, MetricsRegistry};
use chrono::Utc;

fn tracker() -> (Arc<MemoryUsageStore>, UsageTracker) {
    let store = Arc::new(MemoryUsageStore::new());
    let tracker = UsageTracker::new(store.clone());
    (store, tracker)
}

// ============================================================================
// 1. Idempotency
// ============================================================================

mod idempotency_tests {
    use super::*;

    #[tokio::test]
    async fn test_embedding_event_recorded_once() {
        let (store, tracker) = tracker();

        for _ in 0..2 {
            let recorded = tracker
                .record_embedding_tokens(
                    "T1",
                    150,
                    "text-embedding-3-small",
                    Operation::VectorSearch,
                    Some("T1:emb:coll1:op1"),
                )
                .await;
            assert!(recorded);
        }

        let totals = tracker.tenant_totals("T1").await.unwrap();
        assert_eq!(totals.embedding_tokens, 150);
        assert_eq!(totals.embedding_token_usage, 150);
        assert_eq!(totals.token_usage, 0);
        assert_eq!(totals.total_token_usage, 150);

        let today = Utc::now().date_naive();
        let daily = store.daily_usage("T1", today, today).await.unwrap();
        assert_eq!(daily.len(), 1);
        assert_eq!(daily[0].tokens, 150);
        assert_eq!(daily[0].token_type, TokenType::Embedding);
        assert_eq!(daily[0].operation, Operation::VectorSearch);
        assert_eq!(daily[0].model, "text-embedding-3-small");

        let record = store
            .find_idempotency("T1:emb:coll1:op1", Utc::now() - chrono::Duration::hours(24))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.tokens, 150);
        assert_eq!(store.idempotency_len().await, 1);
    }

    #[tokio::test]
    async fn test_concurrent_duplicates_apply_once() {
        let (_, tracker) = tracker();
        let tracker = Arc::new(tracker);

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let tracker = tracker.clone();
                tokio::spawn(async move {
                    tracker
                        .track_usage(UsageEvent::new("t1", 25).idempotency_key("chat:msg-9"))
                        .await
                })
            })
            .collect();

        for handle in handles {
            assert!(handle.await.unwrap());
        }
        assert_eq!(tracker.tenant_totals("t1").await.unwrap().llm_tokens, 25);
    }

    #[tokio::test]
    async fn test_distinct_keys_accumulate() {
        let (_, tracker) = tracker();
        tracker
            .record_llm_tokens("t1", 10, "gpt-4o", Operation::Chat, Some("k1"))
            .await;
        tracker
            .record_llm_tokens("t1", 15, "gpt-4o", Operation::Chat, Some("k2"))
            .await;
        tracker
            .record_llm_tokens("t1", 15, "gpt-4o", Operation::Chat, Some("k2"))
            .await;

        assert_eq!(tracker.tenant_totals("t1").await.unwrap().llm_tokens, 25);
    }

    #[tokio::test]
    async fn test_duplicates_are_counted() {
        let metrics = Arc::new(MetricsRegistry::new(&MetricsConfig::new()));
        let tracker =
            UsageTracker::new(Arc::new(MemoryUsageStore::new())).metrics(metrics.clone());

        for _ in 0..3 {
            tracker
                .track_usage(UsageEvent::new("t1", 5).idempotency_key("dup"))
                .await;
        }

        let summary = metrics.summary();
        assert_eq!(summary.usage_tracked, 1);
        assert_eq!(summary.usage_duplicates, 2);
        assert_eq!(summary.total_tokens, 5);
    }
}

// ============================================================================
// 2. Rollups and guards
// ============================================================================

mod rollup_tests {
    use super::*;

    #[tokio::test]
    async fn test_concurrent_increments_are_additive() {
        let (_, tracker) = tracker();
        let tracker = Arc::new(tracker);

        let handles: Vec<_> = (0..50)
            .map(|i| {
                let tracker = tracker.clone();
                tokio::spawn(async move {
                    let token_type = if i % 2 == 0 {
                        TokenType::Llm
                    } else {
                        TokenType::FineTuning
                    };
                    tracker
                        .track_usage(UsageEvent::new("t1", 4).token_type(token_type))
                        .await
                })
            })
            .collect();
        for handle in handles {
            assert!(handle.await.unwrap());
        }

        let totals = tracker.tenant_totals("t1").await.unwrap();
        assert_eq!(totals.llm_tokens, 100);
        assert_eq!(totals.fine_tuning_tokens, 100);
        assert_eq!(totals.token_usage, 200);
        assert_eq!(totals.total_token_usage, 200);
    }

    #[tokio::test]
    async fn test_concurrent_increments_share_one_daily_row() {
        let (store, tracker) = tracker();
        let tracker = Arc::new(tracker);

        let handles: Vec<_> = (0..50)
            .map(|_| {
                let tracker = tracker.clone();
                tokio::spawn(async move {
                    tracker
                        .track_usage(
                            UsageEvent::new("t1", 4)
                                .operation(Operation::Chat)
                                .model("gpt-4o"),
                        )
                        .await
                })
            })
            .collect();
        for handle in handles {
            assert!(handle.await.unwrap());
        }

        let today = Utc::now().date_naive();
        let daily = store.daily_usage("t1", today, today).await.unwrap();
        assert_eq!(daily.len(), 1);
        assert_eq!(daily[0].tokens, 50 * 4);
    }

    #[tokio::test]
    async fn test_counter_overflow_is_reported_not_raised() {
        let store = Arc::new(MemoryUsageStore::new());
        let metrics = Arc::new(MetricsRegistry::new(&MetricsConfig::new()));
        let tracker = UsageTracker::new(store.clone()).metrics(metrics.clone());

        assert!(tracker.track_usage(UsageEvent::new("t1", i64::MAX)).await);
        assert!(tracker.track_usage(UsageEvent::new("t1", i64::MAX)).await);
        assert!(!tracker.track_usage(UsageEvent::new("t1", i64::MAX)).await);
        assert_eq!(metrics.usage_failures.get(), 1);

        let expected = 2 * i64::MAX as u64;
        let summary = store.tenant_summary("t1").await.unwrap().unwrap();
        assert_eq!(summary.llm_tokens, expected);

        let today = Utc::now().date_naive();
        let daily = store.daily_usage("t1", today, today).await.unwrap();
        assert_eq!(daily[0].tokens, expected);
    }

    #[tokio::test]
    async fn test_monthly_equals_sum_of_daily() {
        let (_, tracker) = tracker();
        let events = [
            (TokenType::Llm, Operation::Chat, "gpt-4o", 120),
            (TokenType::Llm, Operation::Summarize, "gpt-4o-mini", 30),
            (TokenType::Embedding, Operation::VectorSearch, "text-embedding-3-small", 64),
            (TokenType::Embedding, Operation::Query, "text-embedding-3-large", 16),
        ];
        for (token_type, operation, model, tokens) in events {
            assert!(
                tracker
                    .track_usage(
                        UsageEvent::new("t1", tokens)
                            .token_type(token_type)
                            .operation(operation)
                            .model(model)
                    )
                    .await
            );
        }

        let today = Utc::now().date_naive();
        let daily = tracker
            .usage_by_period("t1", today, today, Granularity::Daily)
            .await
            .unwrap();
        let monthly = tracker
            .usage_by_period("t1", today, today, Granularity::Monthly)
            .await
            .unwrap();

        let month_key = today.format("%Y-%m").to_string();
        let day_key = today.format("%Y-%m-%d").to_string();
        assert_eq!(daily[&day_key], monthly[&month_key]);
        assert_eq!(monthly[&month_key][&TokenType::Llm], 150);
        assert_eq!(monthly[&month_key][&TokenType::Embedding], 80);
    }

    #[tokio::test]
    async fn test_non_positive_tokens_are_skipped() {
        let (store, tracker) = tracker();

        assert!(tracker.track_usage(UsageEvent::new("t1", 0)).await);
        assert!(tracker.track_usage(UsageEvent::new("t1", -40)).await);

        assert!(store.tenant_summary("t1").await.unwrap().is_none());
        assert_eq!(tracker.tenant_totals("t1").await.unwrap().total_token_usage, 0);
    }

    #[tokio::test]
    async fn test_missing_tenant_is_rejected() {
        let (_, tracker) = tracker();
        assert!(!tracker.track_usage(UsageEvent::new("", 10)).await);
    }

    #[tokio::test]
    async fn test_inverted_period_is_rejected() {
        let (_, tracker) = tracker();
        let today = Utc::now().date_naive();
        let yesterday = today.pred_opt().unwrap();
        assert!(
            tracker
                .usage_by_period("t1", today, yesterday, Granularity::Daily)
                .await
                .is_err()
        );
    }
}

// ============================================================================
// 3. Attribution
// ============================================================================

mod attribution_tests {
    use super::*;

    fn attributed_tracker() -> (Arc<MemoryUsageStore>, UsageTracker) {
        let directory = InMemoryAgentDirectory::new();
        directory.register("agent-shared", "tenant-owner");
        directory.register("agent-own", "tenant-user");

        let store = Arc::new(MemoryUsageStore::new());
        let tracker = UsageTracker::new(store.clone())
            .attribution(Arc::new(AttributionResolver::new(Arc::new(directory))));
        (store, tracker)
    }

    #[tokio::test]
    async fn test_shared_agent_bills_owner() {
        let (store, tracker) = attributed_tracker();

        assert!(
            tracker
                .track_usage(
                    UsageEvent::new("tenant-user", 300)
                        .agent("agent-shared")
                        .conversation("conv-1")
                        .idempotency_key("tenant-user:gpt-4o:conv-1:chat")
                )
                .await
        );

        assert_eq!(tracker.tenant_totals("tenant-owner").await.unwrap().llm_tokens, 300);
        assert_eq!(tracker.tenant_totals("tenant-user").await.unwrap().llm_tokens, 0);

        let today = Utc::now().date_naive();
        let daily = store.daily_usage("tenant-owner", today, today).await.unwrap();
        let metadata = &daily[0].metadata;
        assert_eq!(metadata["requester_tenant_id"], "tenant-user");
        assert_eq!(metadata["owner_tenant_id"], "tenant-owner");
        assert_eq!(metadata["agent_id"], "agent-shared");
        assert_eq!(metadata["conversation_id"], "conv-1");
    }

    #[tokio::test]
    async fn test_own_and_unknown_agents_bill_actor() {
        let (store, tracker) = attributed_tracker();

        tracker
            .track_usage(UsageEvent::new("tenant-user", 10).agent("agent-own"))
            .await;
        tracker
            .track_usage(UsageEvent::new("tenant-user", 5).agent("agent-missing"))
            .await;

        assert_eq!(tracker.tenant_totals("tenant-user").await.unwrap().llm_tokens, 15);

        let today = Utc::now().date_naive();
        let daily = store.daily_usage("tenant-user", today, today).await.unwrap();
        assert!(!daily[0].metadata.contains_key("owner_tenant_id"));
    }
}
