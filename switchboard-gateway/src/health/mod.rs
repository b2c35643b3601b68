//! # Provider Health Registry
//!
//! Single source of truth for "is this provider eligible for new traffic,
//! and if not, when may we reconsider it?". Both the router (on every
//! dispatch outcome) and the background checker (on periodic scans) write
//! through here; every write replaces the full persisted record.
//!
//! A provider becomes unhealthy only after `max_error_count` consecutive
//! failures (per the live [`HealthCheckConfig`]); the first success flips
//! it back and clears the retry deadline.

pub mod checker;

use chrono::{Duration as ChronoDuration, Utc};

use crate::storage::entities::{HealthCheckConfig, ProviderHealth};
use crate::storage::{Store, StorageError};

/// Handle to the persisted per-provider health records. Cheap to clone.
#[derive(Clone)]
pub struct HealthRegistry {
    store: Store,
}

impl HealthRegistry {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Read a provider's record. Unknown providers read as a synthetic
    /// healthy, never-checked stub; nothing is inserted.
    pub async fn get(&self, provider_id: i64) -> Result<ProviderHealth, StorageError> {
        Ok(self
            .store
            .get_health(provider_id)
            .await?
            .unwrap_or_else(|| ProviderHealth::never_checked(provider_id)))
    }

    pub async fn get_all(&self) -> Result<Vec<ProviderHealth>, StorageError> {
        self.store.list_health().await
    }

    /// Record a successful observation.
    pub async fn on_success(&self, provider_id: i64) -> Result<(), StorageError> {
        let mut health = self.get(provider_id).await?;
        let now = Utc::now();

        health.consecutive_successes += 1;
        health.consecutive_errors = 0;
        health.last_success_at = Some(now);
        health.last_checked_at = Some(now);

        if !health.is_healthy {
            health.is_healthy = true;
            health.last_error = None;
            health.next_retry_at = None;
            tracing::info!(provider_id, "provider recovered");
        }

        self.store.upsert_health(&health).await
    }

    /// Record a failed observation. Trips the record to unhealthy once the
    /// consecutive-error threshold is reached.
    pub async fn on_failure(
        &self,
        provider_id: i64,
        reason: &str,
        status_code: Option<u16>,
    ) -> Result<(), StorageError> {
        let config = self.store.health_check_config().await?;
        let mut health = self.get(provider_id).await?;
        let now = Utc::now();

        health.consecutive_errors += 1;
        health.consecutive_successes = 0;
        health.last_error = Some(reason.to_string());
        health.last_status_code = status_code.map(i64::from);
        health.last_checked_at = Some(now);

        if health.consecutive_errors >= config.max_error_count && health.is_healthy {
            health.is_healthy = false;
            health.next_retry_at = Some(now + ChronoDuration::hours(config.retry_after_hours));
            tracing::warn!(
                provider_id,
                consecutive_errors = health.consecutive_errors,
                reason,
                "provider marked unhealthy"
            );
        }

        self.store.upsert_health(&health).await
    }
}
