//! # Background Health Checker
//!
//! One long-running task that periodically probes every registered
//! provider with a minimal chat request and feeds the outcome into the
//! health registry.
//!
//! Reachability beats correctness here: 401/403/404/429 all mean the
//! provider is up (credentials, model names and rate limits are routing
//! concerns, not liveness concerns), so only 5xx statuses and transport
//! errors count as failures.
//!
//! The checker re-reads its configuration every iteration, so interval
//! and threshold changes take effect without a restart, and it observes
//! the stop signal at every sleep boundary.

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::health::HealthRegistry;
use crate::router::apply_dialect_headers;
use crate::storage::entities::Provider;
use crate::storage::Store;
use switchboard_upstream::{pool, ConnectionPool, Dialect};

/// Header timeout for a single probe.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Sleep period while checking is disabled.
const DISABLED_SLEEP: Duration = Duration::from_secs(60 * 60);

/// Dummy model name stamped into probe requests.
const PROBE_MODEL: &str = "switchboard-health-probe";

enum ProbeOutcome {
    Reachable,
    Failed {
        reason: String,
        status: Option<u16>,
    },
}

pub struct HealthChecker {
    store: Store,
    registry: HealthRegistry,
    pool: Arc<ConnectionPool>,
}

impl HealthChecker {
    pub fn new(store: Store, registry: HealthRegistry, pool: Arc<ConnectionPool>) -> Self {
        Self {
            store,
            registry,
            pool,
        }
    }

    pub fn spawn(self, stop: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run(stop))
    }

    async fn run(self, mut stop: watch::Receiver<bool>) {
        loop {
            let config = match self.store.health_check_config().await {
                Ok(config) => config,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to read health check config");
                    Default::default()
                }
            };

            if !config.enabled {
                if sleep_or_stop(&mut stop, DISABLED_SLEEP).await {
                    break;
                }
                continue;
            }

            self.scan().await;

            let interval = Duration::from_secs(config.interval_minutes.max(1) as u64 * 60);
            if sleep_or_stop(&mut stop, interval).await {
                break;
            }
        }
        tracing::debug!("health checker stopping");
    }

    /// One pass over all providers.
    pub async fn scan(&self) {
        let providers = match self.store.load_providers().await {
            Ok(providers) => providers,
            Err(e) => {
                tracing::warn!(error = %e, "failed to list providers for health scan");
                return;
            }
        };

        let now = chrono::Utc::now();
        for provider in providers {
            let health = match self.registry.get(provider.id).await {
                Ok(health) => health,
                Err(e) => {
                    tracing::warn!(provider_id = provider.id, error = %e, "health read failed");
                    continue;
                }
            };

            // Unhealthy providers stay untouched until their retry deadline.
            if !health.is_healthy {
                if let Some(next_retry) = health.next_retry_at {
                    if next_retry > now {
                        continue;
                    }
                }
            }

            let outcome = self.probe(&provider).await;
            let result = match outcome {
                ProbeOutcome::Reachable => self.registry.on_success(provider.id).await,
                ProbeOutcome::Failed { reason, status } => {
                    self.registry.on_failure(provider.id, &reason, status).await
                }
            };
            if let Err(e) = result {
                tracing::warn!(provider_id = provider.id, error = %e, "health write failed");
            }
        }
    }

    async fn probe(&self, provider: &Provider) -> ProbeOutcome {
        let Some(dialect) = provider.dialect() else {
            return ProbeOutcome::Failed {
                reason: format!("unknown dialect tag: {}", provider.kind),
                status: None,
            };
        };
        let settings = match provider.settings() {
            Ok(settings) => settings,
            Err(e) => {
                return ProbeOutcome::Failed {
                    reason: format!("invalid provider config: {e}"),
                    status: None,
                }
            }
        };

        let endpoint = format!(
            "{}{}",
            settings.base_url.trim_end_matches('/'),
            dialect.chat_path()
        );
        let url = match reqwest::Url::parse(&endpoint) {
            Ok(url) => url,
            Err(e) => {
                return ProbeOutcome::Failed {
                    reason: format!("invalid base URL: {e}"),
                    status: None,
                }
            }
        };

        let mut client = match self.pool.get(&pool::host_key(&url), PROBE_TIMEOUT) {
            Ok(client) => client,
            Err(e) => {
                return ProbeOutcome::Failed {
                    reason: e.to_string(),
                    status: None,
                }
            }
        };

        let request = apply_dialect_headers(
            client.client().post(url).json(&probe_body(dialect)),
            dialect,
            &settings,
        );

        let outcome = match tokio::time::timeout(PROBE_TIMEOUT, request.send()).await {
            Err(_) => {
                client.mark_unhealthy();
                ProbeOutcome::Failed {
                    reason: "health probe timed out".to_string(),
                    status: None,
                }
            }
            Ok(Err(e)) => {
                client.mark_unhealthy();
                ProbeOutcome::Failed {
                    reason: format!("transport error: {e}"),
                    status: None,
                }
            }
            Ok(Ok(response)) => {
                let status = response.status();
                if status.is_server_error() {
                    ProbeOutcome::Failed {
                        reason: format!("upstream returned {}", status.as_u16()),
                        status: Some(status.as_u16()),
                    }
                } else {
                    ProbeOutcome::Reachable
                }
            }
        };

        self.pool.release(client);
        outcome
    }
}

fn probe_body(dialect: Dialect) -> serde_json::Value {
    match dialect {
        Dialect::OpenAi => json!({
            "model": PROBE_MODEL,
            "messages": [{"role": "user", "content": "ping"}],
            "max_tokens": 5,
        }),
        Dialect::Anthropic => json!({
            "model": PROBE_MODEL,
            "max_tokens": 5,
            "messages": [{"role": "user", "content": "ping"}],
        }),
    }
}

/// Sleep for `duration` unless the stop signal fires first. Returns true
/// when the caller should shut down.
async fn sleep_or_stop(stop: &mut watch::Receiver<bool>, duration: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        result = stop.changed() => result.is_err() || *stop.borrow(),
    }
}
