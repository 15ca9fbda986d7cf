//! Background retention sweep for the idempotency ledger.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;

use super::tracker::UsageTracker;
use crate::config::MeteringSettings;

/// Periodically deletes idempotency records older than the tracker's
/// retention window. Failures are logged and retried on the next tick.
pub struct IdempotencySweeper {
    tracker: Arc<UsageTracker>,
    every: Duration,
    cancel: CancellationToken,
}

impl IdempotencySweeper {
    pub fn new(tracker: Arc<UsageTracker>, every: Duration) -> Self {
        Self {
            tracker,
            every: every.max(Duration::from_secs(1)),
            cancel: CancellationToken::new(),
        }
    }

    /// Sweep on the configured interval.
    pub fn from_settings(tracker: Arc<UsageTracker>, settings: &MeteringSettings) -> Self {
        Self::new(tracker, settings.sweep_interval)
    }

    pub fn with_cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Token that stops the sweep when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn spawn(self) -> JoinHandle<u64> {
        tokio::spawn(self.run())
    }

    /// Run until cancelled, returning the total number of purged records.
    pub async fn run(self) -> u64 {
        let mut ticker = interval(self.every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!(
            interval_secs = self.every.as_secs(),
            retention_secs = self.tracker.idempotency_retention().as_secs(),
            "Idempotency sweep started"
        );

        let mut total = 0;
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    match self.tracker.purge_expired_idempotency().await {
                        Ok(purged) => total += purged,
                        Err(e) => tracing::warn!(error = %e, "Idempotency sweep failed"),
                    }
                }
            }
        }

        tracing::info!(purged = total, "Idempotency sweep stopped");
        total
    }
}
