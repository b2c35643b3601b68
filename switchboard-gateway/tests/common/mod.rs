//! Shared harness for gateway integration tests: a real server over a
//! scratch database, seeded directly through the store the way the admin
//! layer would write.

#![allow(dead_code)]

use std::time::Duration;

use axum_test::TestServer;
use tempfile::TempDir;

use switchboard_gateway::config::Config;
use switchboard_gateway::server::{create_server, Gateway};
use switchboard_gateway::storage::entities::{Capability, ChatLog, HealthCheckConfig};
use switchboard_gateway::storage::Store;
use switchboard_upstream::Dialect;

pub struct Harness {
    pub server: TestServer,
    pub store: Store,
    pub gateway: Gateway,
    _dir: TempDir,
}

pub async fn harness() -> Harness {
    harness_with_token(None).await
}

pub async fn harness_with_token(token: Option<&str>) -> Harness {
    let dir = tempfile::tempdir().expect("create temp dir");

    let mut config = Config::default();
    config.database.path = dir.path().join("gateway.db");
    config.auth.token = token.map(str::to_string);
    config.cache.ttl = Duration::from_secs(300);

    let store = Store::connect(&config.database.path)
        .await
        .expect("connect store");
    // Keep the background checker quiet during tests.
    store
        .set_health_check_config(&HealthCheckConfig {
            enabled: false,
            ..HealthCheckConfig::default()
        })
        .await
        .expect("disable health checker");

    let gateway = create_server(config).await.expect("create server");
    let server = TestServer::new(gateway.app.clone()).expect("test server");

    Harness {
        server,
        store,
        gateway,
        _dir: dir,
    }
}

pub async fn seed_provider(store: &Store, name: &str, dialect: Dialect, base_url: &str) -> i64 {
    let config = format!(r#"{{"base_url":"{base_url}","api_key":"sk-test"}}"#);
    store
        .insert_provider(name, dialect, &config)
        .await
        .expect("seed provider")
}

pub async fn seed_model(store: &Store, name: &str, max_retry: i64, timeout_secs: i64) -> i64 {
    store
        .insert_model(name, max_retry, timeout_secs)
        .await
        .expect("seed model")
}

pub async fn seed_binding(
    store: &Store,
    model_id: i64,
    provider_id: i64,
    upstream_model: &str,
    weight: u32,
) -> i64 {
    seed_binding_with_caps(
        store,
        model_id,
        provider_id,
        upstream_model,
        weight,
        Capability::Unset,
        Capability::Unset,
        Capability::Unset,
    )
    .await
}

#[allow(clippy::too_many_arguments)]
pub async fn seed_binding_with_caps(
    store: &Store,
    model_id: i64,
    provider_id: i64,
    upstream_model: &str,
    weight: u32,
    tool_call: Capability,
    structured_output: Capability,
    image: Capability,
) -> i64 {
    store
        .insert_binding(
            model_id,
            provider_id,
            upstream_model,
            tool_call,
            structured_output,
            image,
            weight,
        )
        .await
        .expect("seed binding")
}

pub async fn mark_unhealthy(store: &Store, provider_id: i64, retry_in_future: bool) {
    let mut health = switchboard_gateway::storage::entities::ProviderHealth::never_checked(provider_id);
    health.is_healthy = false;
    health.consecutive_errors = 5;
    health.next_retry_at = Some(if retry_in_future {
        chrono::Utc::now() + chrono::Duration::hours(1)
    } else {
        chrono::Utc::now() - chrono::Duration::minutes(1)
    });
    health.last_checked_at = Some(chrono::Utc::now());
    store.upsert_health(&health).await.expect("seed health");
}

/// Poll the chat logs until `predicate` matches or the deadline passes.
/// The telemetry consumer lands asynchronously after the response body.
pub async fn wait_for_log<F>(store: &Store, predicate: F) -> ChatLog
where
    F: Fn(&ChatLog) -> bool,
{
    for _ in 0..200 {
        let logs = store.list_chat_logs().await.expect("list chat logs");
        if let Some(log) = logs.iter().find(|log| predicate(log)) {
            return log.clone();
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("expected chat log never appeared");
}

pub async fn logs(store: &Store) -> Vec<ChatLog> {
    store.list_chat_logs().await.expect("list chat logs")
}
