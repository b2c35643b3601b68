//! Embedded SQLite persistence.
//!
//! The store owns the only database handle in the process. Every other
//! component (config cache, health registry, usage aggregator, chat-log
//! writer) serializes through it; there is no in-memory write-behind.
//!
//! Migrations are embedded and run at connect time. WAL mode keeps the
//! request hot path from blocking on background writers.

pub mod entities;

use chrono::{NaiveDate, Utc};
use sqlx::migrate::Migrator;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use thiserror::Error;

use entities::{
    Binding, BindingRow, Capability, ChatLog, ChatLogDraft, DailyUsage, HealthCheckConfig, Model,
    Provider, ProviderHealth, StreamUpdate,
};
use switchboard_upstream::{Dialect, TokenUsage};

static MIGRATOR: Migrator = sqlx::migrate!();

/// Storage-layer failures.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

/// Handle to the embedded database. Cheap to clone.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating if missing) the database at `path` and run pending
    /// migrations.
    pub async fn connect(path: &Path) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;
        MIGRATOR.run(&pool).await?;
        Ok(Self { pool })
    }

    // ---- configuration snapshot ------------------------------------------

    pub async fn load_models(&self) -> Result<Vec<Model>, StorageError> {
        Ok(sqlx::query_as::<_, Model>(
            "SELECT id, name, max_retry, timeout_secs FROM models WHERE deleted_at IS NULL",
        )
        .fetch_all(&self.pool)
        .await?)
    }

    pub async fn load_providers(&self) -> Result<Vec<Provider>, StorageError> {
        Ok(sqlx::query_as::<_, Provider>(
            "SELECT id, name, type, config FROM providers WHERE deleted_at IS NULL",
        )
        .fetch_all(&self.pool)
        .await?)
    }

    /// Bindings joined with their model's name, the shape the config cache
    /// indexes by.
    pub async fn load_bindings(&self) -> Result<Vec<Binding>, StorageError> {
        let rows = sqlx::query_as::<_, BindingRow>(
            "SELECT b.id, b.model_id, m.name AS model_name, b.provider_id, b.upstream_model, \
                    b.tool_call, b.structured_output, b.image, b.weight \
             FROM model_with_providers b \
             JOIN models m ON m.id = b.model_id \
             WHERE b.deleted_at IS NULL AND m.deleted_at IS NULL",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Binding::from).collect())
    }

    // ---- provider health --------------------------------------------------

    pub async fn get_health(
        &self,
        provider_id: i64,
    ) -> Result<Option<ProviderHealth>, StorageError> {
        Ok(sqlx::query_as::<_, ProviderHealth>(
            "SELECT provider_id, is_healthy, consecutive_errors, consecutive_successes, \
                    last_error, last_status_code, last_checked_at, last_success_at, next_retry_at \
             FROM provider_validations WHERE provider_id = ? AND deleted_at IS NULL",
        )
        .bind(provider_id)
        .fetch_optional(&self.pool)
        .await?)
    }

    pub async fn list_health(&self) -> Result<Vec<ProviderHealth>, StorageError> {
        Ok(sqlx::query_as::<_, ProviderHealth>(
            "SELECT provider_id, is_healthy, consecutive_errors, consecutive_successes, \
                    last_error, last_status_code, last_checked_at, last_success_at, next_retry_at \
             FROM provider_validations WHERE deleted_at IS NULL",
        )
        .fetch_all(&self.pool)
        .await?)
    }

    /// Full-record replace keyed by provider id.
    pub async fn upsert_health(&self, health: &ProviderHealth) -> Result<(), StorageError> {
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO provider_validations \
                 (provider_id, is_healthy, consecutive_errors, consecutive_successes, \
                  last_error, last_status_code, last_checked_at, last_success_at, next_retry_at, \
                  created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(provider_id) DO UPDATE SET \
                 is_healthy = excluded.is_healthy, \
                 consecutive_errors = excluded.consecutive_errors, \
                 consecutive_successes = excluded.consecutive_successes, \
                 last_error = excluded.last_error, \
                 last_status_code = excluded.last_status_code, \
                 last_checked_at = excluded.last_checked_at, \
                 last_success_at = excluded.last_success_at, \
                 next_retry_at = excluded.next_retry_at, \
                 updated_at = excluded.updated_at",
        )
        .bind(health.provider_id)
        .bind(health.is_healthy)
        .bind(health.consecutive_errors)
        .bind(health.consecutive_successes)
        .bind(&health.last_error)
        .bind(health.last_status_code)
        .bind(health.last_checked_at)
        .bind(health.last_success_at)
        .bind(health.next_retry_at)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ---- health checker configuration -------------------------------------

    /// The singleton checker configuration; defaults when no row exists.
    pub async fn health_check_config(&self) -> Result<HealthCheckConfig, StorageError> {
        let row = sqlx::query_as::<_, HealthCheckConfig>(
            "SELECT enabled, interval_minutes, max_error_count, retry_after_hours \
             FROM health_check_configs WHERE deleted_at IS NULL ORDER BY id LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.unwrap_or_default())
    }

    pub async fn set_health_check_config(
        &self,
        config: &HealthCheckConfig,
    ) -> Result<(), StorageError> {
        let now = Utc::now();
        let updated = sqlx::query(
            "UPDATE health_check_configs \
             SET enabled = ?, interval_minutes = ?, max_error_count = ?, retry_after_hours = ?, \
                 updated_at = ? \
             WHERE id = (SELECT id FROM health_check_configs WHERE deleted_at IS NULL \
                         ORDER BY id LIMIT 1)",
        )
        .bind(config.enabled)
        .bind(config.interval_minutes)
        .bind(config.max_error_count)
        .bind(config.retry_after_hours)
        .bind(now)
        .execute(&self.pool)
        .await?;
        if updated.rows_affected() == 0 {
            sqlx::query(
                "INSERT INTO health_check_configs \
                     (enabled, interval_minutes, max_error_count, retry_after_hours, \
                      created_at, updated_at) \
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(config.enabled)
            .bind(config.interval_minutes)
            .bind(config.max_error_count)
            .bind(config.retry_after_hours)
            .bind(now)
            .bind(now)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    // ---- daily usage -------------------------------------------------------

    /// Fold one successful request into the provider's daily counters.
    ///
    /// The rolling average uses `new = (old * (n - 1) + sample) / n` where
    /// `n` is the new success count; in the upsert below the referenced
    /// columns still hold their pre-update values.
    pub async fn record_usage_success(
        &self,
        provider_id: i64,
        date: NaiveDate,
        usage: TokenUsage,
        response_time_ms: f64,
    ) -> Result<(), StorageError> {
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO provider_usage_stats \
                 (provider_id, date, total_requests, success_requests, failed_requests, \
                  prompt_tokens, completion_tokens, total_tokens, avg_response_time_ms, \
                  created_at, updated_at) \
             VALUES (?, ?, 1, 1, 0, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(provider_id, date) DO UPDATE SET \
                 total_requests = total_requests + 1, \
                 success_requests = success_requests + 1, \
                 prompt_tokens = prompt_tokens + excluded.prompt_tokens, \
                 completion_tokens = completion_tokens + excluded.completion_tokens, \
                 total_tokens = total_tokens + excluded.total_tokens, \
                 avg_response_time_ms = \
                     (avg_response_time_ms * success_requests + excluded.avg_response_time_ms) \
                     / (success_requests + 1), \
                 updated_at = excluded.updated_at",
        )
        .bind(provider_id)
        .bind(date)
        .bind(i64::from(usage.prompt_tokens))
        .bind(i64::from(usage.completion_tokens))
        .bind(i64::from(usage.total_tokens))
        .bind(response_time_ms)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_daily_usage(
        &self,
        provider_id: i64,
        date: NaiveDate,
    ) -> Result<Option<DailyUsage>, StorageError> {
        Ok(sqlx::query_as::<_, DailyUsage>(
            "SELECT provider_id, date, total_requests, success_requests, failed_requests, \
                    prompt_tokens, completion_tokens, total_tokens, avg_response_time_ms \
             FROM provider_usage_stats \
             WHERE provider_id = ? AND date = ? AND deleted_at IS NULL",
        )
        .bind(provider_id)
        .bind(date)
        .fetch_optional(&self.pool)
        .await?)
    }

    // ---- chat logs ---------------------------------------------------------

    pub async fn insert_chat_log(&self, draft: &ChatLogDraft) -> Result<i64, StorageError> {
        let now = Utc::now();
        let result = sqlx::query(
            "INSERT INTO chat_logs \
                 (model_name, provider_name, upstream_model, dialect, status, error, retry, \
                  proxy_time_ms, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&draft.model_name)
        .bind(&draft.provider_name)
        .bind(&draft.upstream_model)
        .bind(&draft.dialect)
        .bind(&draft.status)
        .bind(&draft.error)
        .bind(draft.retry)
        .bind(draft.proxy_time_ms)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Second write of a chat log, applied by the telemetry consumer after
    /// the stream terminates.
    pub async fn update_chat_log_stream(
        &self,
        log_id: i64,
        update: &StreamUpdate,
    ) -> Result<(), StorageError> {
        let usage = update.usage.unwrap_or_default();
        let has_usage = update.usage.is_some();
        let token = |n: u32| has_usage.then_some(i64::from(n));
        sqlx::query(
            "UPDATE chat_logs SET \
                 status = ?, \
                 error = COALESCE(?, error), \
                 first_chunk_ms = ?, \
                 chunk_time_ms = ?, \
                 tps = ?, \
                 prompt_tokens = ?, \
                 completion_tokens = ?, \
                 total_tokens = ?, \
                 cache_creation_tokens = ?, \
                 cache_read_tokens = ?, \
                 updated_at = ? \
             WHERE id = ?",
        )
        .bind(&update.status)
        .bind(&update.error)
        .bind(update.first_chunk_ms)
        .bind(update.chunk_time_ms)
        .bind(update.tps)
        .bind(token(usage.prompt_tokens))
        .bind(token(usage.completion_tokens))
        .bind(token(usage.total_tokens))
        .bind(usage.cache_creation_tokens.map(i64::from))
        .bind(usage.cache_read_tokens.map(i64::from))
        .bind(Utc::now())
        .bind(log_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_chat_log(&self, id: i64) -> Result<Option<ChatLog>, StorageError> {
        Ok(sqlx::query_as::<_, ChatLog>(
            "SELECT id, model_name, provider_name, upstream_model, dialect, status, error, \
                    retry, proxy_time_ms, first_chunk_ms, chunk_time_ms, tps, prompt_tokens, \
                    completion_tokens, total_tokens, cache_creation_tokens, cache_read_tokens \
             FROM chat_logs WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?)
    }

    pub async fn list_chat_logs(&self) -> Result<Vec<ChatLog>, StorageError> {
        Ok(sqlx::query_as::<_, ChatLog>(
            "SELECT id, model_name, provider_name, upstream_model, dialect, status, error, \
                    retry, proxy_time_ms, first_chunk_ms, chunk_time_ms, tps, prompt_tokens, \
                    completion_tokens, total_tokens, cache_creation_tokens, cache_read_tokens \
             FROM chat_logs WHERE deleted_at IS NULL ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?)
    }

    // ---- admin-side writes -------------------------------------------------
    //
    // The admin CRUD surface lives outside this crate; it writes through
    // these operations and relies on the config cache TTL for visibility.

    pub async fn insert_provider(
        &self,
        name: &str,
        dialect: Dialect,
        config_json: &str,
    ) -> Result<i64, StorageError> {
        let now = Utc::now();
        let result = sqlx::query(
            "INSERT INTO providers (name, type, config, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(name)
        .bind(dialect.as_str())
        .bind(config_json)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn insert_model(
        &self,
        name: &str,
        max_retry: i64,
        timeout_secs: i64,
    ) -> Result<i64, StorageError> {
        let now = Utc::now();
        let result = sqlx::query(
            "INSERT INTO models (name, max_retry, timeout_secs, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(name)
        .bind(max_retry)
        .bind(timeout_secs)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn insert_binding(
        &self,
        model_id: i64,
        provider_id: i64,
        upstream_model: &str,
        tool_call: Capability,
        structured_output: Capability,
        image: Capability,
        weight: u32,
    ) -> Result<i64, StorageError> {
        let now = Utc::now();
        let result = sqlx::query(
            "INSERT INTO model_with_providers \
                 (model_id, provider_id, upstream_model, tool_call, structured_output, image, \
                  weight, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(model_id)
        .bind(provider_id)
        .bind(upstream_model)
        .bind(tool_call.to_db())
        .bind(structured_output.to_db())
        .bind(image.to_db())
        .bind(i64::from(weight.max(1)))
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use tempfile::TempDir;

    /// A store over a scratch database file that lives as long as the
    /// returned guard.
    pub async fn temp_store() -> (Store, TempDir) {
        let dir = tempfile::tempdir().expect("create temp dir");
        let store = Store::connect(&dir.path().join("switchboard-test.db"))
            .await
            .expect("connect scratch store");
        (store, dir)
    }
}
