//! Persisted entity types.
//!
//! These mirror the table contract one-to-one. Routing-facing accessors
//! (dialect tag parsing, provider settings) live here so the router never
//! touches raw rows.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use switchboard_upstream::{Dialect, TokenUsage};

/// A registered upstream endpoint plus credentials.
#[derive(Debug, Clone, FromRow)]
pub struct Provider {
    pub id: i64,
    pub name: String,
    /// Dialect tag: `openai` or `anthropic`.
    #[sqlx(rename = "type")]
    pub kind: String,
    /// Opaque JSON blob; see [`ProviderSettings`].
    pub config: String,
}

impl Provider {
    pub fn dialect(&self) -> Option<Dialect> {
        Dialect::parse(&self.kind)
    }

    pub fn settings(&self) -> Result<ProviderSettings, serde_json::Error> {
        serde_json::from_str(&self.config)
    }
}

/// The dialect-specific fields inside a provider's opaque config JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSettings {
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub anthropic_version: Option<String>,
    #[serde(default)]
    pub anthropic_beta: Option<String>,
}

/// A logical client-facing model name and the retry budget it grants.
#[derive(Debug, Clone, FromRow)]
pub struct Model {
    pub id: i64,
    pub name: String,
    /// Maximum dispatch attempts per request.
    pub max_retry: i64,
    /// Wall-clock budget in seconds covering all retries.
    pub timeout_secs: i64,
}

/// Tri-state capability flag on a binding.
///
/// `Unset` is the operationally common case (legacy bindings) and matches
/// any request; only an explicit `No` filters a binding out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Capability {
    #[default]
    Unset,
    No,
    Yes,
}

impl Capability {
    pub fn from_db(value: Option<i64>) -> Self {
        match value {
            None => Capability::Unset,
            Some(0) => Capability::No,
            Some(_) => Capability::Yes,
        }
    }

    pub fn to_db(self) -> Option<i64> {
        match self {
            Capability::Unset => None,
            Capability::No => Some(0),
            Capability::Yes => Some(1),
        }
    }

    /// Whether a binding with this flag can serve a request that needs the
    /// capability (`needed`).
    pub fn allows(self, needed: bool) -> bool {
        !(needed && self == Capability::No)
    }
}

/// The many-to-many edge between a model and a provider.
#[derive(Debug, Clone)]
pub struct Binding {
    pub id: i64,
    pub model_id: i64,
    pub model_name: String,
    pub provider_id: i64,
    pub upstream_model: String,
    pub tool_call: Capability,
    pub structured_output: Capability,
    pub image: Capability,
    pub weight: u32,
}

/// Raw binding row; converted into [`Binding`] after the join.
#[derive(Debug, FromRow)]
pub(crate) struct BindingRow {
    pub id: i64,
    pub model_id: i64,
    pub model_name: String,
    pub provider_id: i64,
    pub upstream_model: String,
    pub tool_call: Option<i64>,
    pub structured_output: Option<i64>,
    pub image: Option<i64>,
    pub weight: i64,
}

impl From<BindingRow> for Binding {
    fn from(row: BindingRow) -> Self {
        Binding {
            id: row.id,
            model_id: row.model_id,
            model_name: row.model_name,
            provider_id: row.provider_id,
            upstream_model: row.upstream_model,
            tool_call: Capability::from_db(row.tool_call),
            structured_output: Capability::from_db(row.structured_output),
            image: Capability::from_db(row.image),
            weight: row.weight.max(1) as u32,
        }
    }
}

/// Per-provider health record, one row per provider.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct ProviderHealth {
    pub provider_id: i64,
    pub is_healthy: bool,
    pub consecutive_errors: i64,
    pub consecutive_successes: i64,
    pub last_error: Option<String>,
    pub last_status_code: Option<i64>,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub next_retry_at: Option<DateTime<Utc>>,
}

impl ProviderHealth {
    /// Synthetic record for a provider that was never observed. Healthy by
    /// construction, never persisted by reads.
    pub fn never_checked(provider_id: i64) -> Self {
        Self {
            provider_id,
            is_healthy: true,
            consecutive_errors: 0,
            consecutive_successes: 0,
            last_error: None,
            last_status_code: None,
            last_checked_at: None,
            last_success_at: None,
            next_retry_at: None,
        }
    }
}

/// Per-provider daily usage counters.
#[derive(Debug, Clone, FromRow)]
pub struct DailyUsage {
    pub provider_id: i64,
    pub date: NaiveDate,
    pub total_requests: i64,
    pub success_requests: i64,
    pub failed_requests: i64,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
    pub avg_response_time_ms: f64,
}

/// Singleton health-checker configuration.
#[derive(Debug, Clone, Copy, FromRow)]
pub struct HealthCheckConfig {
    pub enabled: bool,
    pub interval_minutes: i64,
    pub max_error_count: i64,
    pub retry_after_hours: i64,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_minutes: 5,
            max_error_count: 5,
            retry_after_hours: 1,
        }
    }
}

/// One persisted record per routed attempt.
#[derive(Debug, Clone, FromRow)]
pub struct ChatLog {
    pub id: i64,
    pub model_name: String,
    pub provider_name: String,
    pub upstream_model: String,
    pub dialect: String,
    pub status: String,
    pub error: Option<String>,
    pub retry: i64,
    pub proxy_time_ms: i64,
    pub first_chunk_ms: Option<i64>,
    pub chunk_time_ms: Option<i64>,
    pub tps: Option<f64>,
    pub prompt_tokens: Option<i64>,
    pub completion_tokens: Option<i64>,
    pub total_tokens: Option<i64>,
    pub cache_creation_tokens: Option<i64>,
    pub cache_read_tokens: Option<i64>,
}

/// Chat-log statuses. Stored as plain text.
pub const LOG_STATUS_SUCCESS: &str = "success";
pub const LOG_STATUS_ERROR: &str = "error";

/// Fields of a chat log known at insert time.
#[derive(Debug, Clone)]
pub struct ChatLogDraft {
    pub model_name: String,
    pub provider_name: String,
    pub upstream_model: String,
    pub dialect: String,
    pub status: String,
    pub error: Option<String>,
    pub retry: i64,
    pub proxy_time_ms: i64,
}

/// Fields written back by the telemetry consumer once the stream ends.
#[derive(Debug, Clone, Default)]
pub struct StreamUpdate {
    pub status: String,
    pub error: Option<String>,
    pub first_chunk_ms: Option<i64>,
    pub chunk_time_ms: Option<i64>,
    pub tps: Option<f64>,
    pub usage: Option<TokenUsage>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_round_trips_through_db_encoding() {
        for cap in [Capability::Unset, Capability::No, Capability::Yes] {
            assert_eq!(Capability::from_db(cap.to_db()), cap);
        }
    }

    #[test]
    fn capability_filtering_semantics() {
        // Unset is unconstrained.
        assert!(Capability::Unset.allows(true));
        assert!(Capability::Unset.allows(false));
        // Explicit No only blocks requests that need the capability.
        assert!(!Capability::No.allows(true));
        assert!(Capability::No.allows(false));
        assert!(Capability::Yes.allows(true));
    }

    #[test]
    fn provider_settings_parse_from_opaque_config() {
        let provider = Provider {
            id: 1,
            name: "acme".to_string(),
            kind: "anthropic".to_string(),
            config: r#"{"base_url":"https://api.acme.ai","api_key":"sk-1","anthropic_beta":"tools-2024"}"#
                .to_string(),
        };
        assert_eq!(provider.dialect(), Some(Dialect::Anthropic));
        let settings = provider.settings().unwrap();
        assert_eq!(settings.base_url, "https://api.acme.ai");
        assert_eq!(settings.anthropic_beta.as_deref(), Some("tools-2024"));
        assert_eq!(settings.anthropic_version, None);
    }
}
