//! Per-provider daily usage counters.
//!
//! Rows are created lazily on the first success of a (provider, day) pair
//! and only mutated on success; the rolling latency average lives in the
//! upsert itself. Updates run off the hot path via [`UsageStats::record_detached`].
//!
//! Days are bucketed in the process's local timezone, so the deployment's
//! `TZ` decides when a day rolls over.

use crate::storage::{Store, StorageError};
use switchboard_upstream::TokenUsage;

/// Handle to the daily usage counters. Cheap to clone.
#[derive(Clone)]
pub struct UsageStats {
    store: Store,
}

impl UsageStats {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Fold one successful request into today's counters.
    pub async fn record(
        &self,
        provider_id: i64,
        usage: TokenUsage,
        response_time_ms: f64,
    ) -> Result<(), StorageError> {
        let today = chrono::Local::now().date_naive();
        self.store
            .record_usage_success(provider_id, today, usage, response_time_ms)
            .await
    }

    /// Same as [`UsageStats::record`] but detached from the caller, so the
    /// request path never waits on the database.
    pub fn record_detached(&self, provider_id: i64, usage: TokenUsage, response_time_ms: f64) {
        let stats = self.clone();
        tokio::spawn(async move {
            if let Err(e) = stats.record(provider_id, usage, response_time_ms).await {
                tracing::warn!(provider_id, error = %e, "daily usage update failed");
            }
        });
    }
}
