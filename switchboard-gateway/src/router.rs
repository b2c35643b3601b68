//! # Router / Retry Engine
//!
//! The heart of the gateway. For each inbound request it:
//!
//! 1. Inspects the body (dialect-specific) for the model name, streaming
//!    flag and capability needs.
//! 2. Builds the candidate set: the model's bindings, filtered to the
//!    request's dialect, then to healthy providers (falling back to the
//!    full set when nothing is healthy — a stale health signal must never
//!    black-hole a servable model), then through the capability flags.
//! 3. Runs the retry loop: weighted pick, dispatch with a per-attempt
//!    header timeout of a third of the model's budget, classify the
//!    outcome. Transport errors and hard statuses drop the binding for
//!    this request; a 429 only decays its weight. The loop ends on
//!    success, on `max_retry` attempts, on candidate exhaustion, or when
//!    the model's wall-clock budget fires — the outer budget always
//!    dominates.
//! 4. On success: persist the success chat log, feed the health registry,
//!    flush stream-mode headers and pump the body to the client through
//!    the telemetry tee.
//!
//! Failed attempts are logged off the hot path through the per-request
//! [`LogWriter`] channel. The weight map is request-local by design: a 429
//! decays a binding only within this request, never globally, so a slow
//! upstream is not starved by a feedback loop.

use axum::body::Body;
use axum::http::{header, Response};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::cache::ConfigCache;
use crate::chatlog::LogWriter;
use crate::gateway_error::GatewayError;
use crate::health::HealthRegistry;
use crate::storage::entities::{
    Binding, ChatLogDraft, Provider, ProviderSettings, LOG_STATUS_ERROR, LOG_STATUS_SUCCESS,
};
use crate::storage::Store;
use crate::telemetry::{self, TelemetryParams};
use crate::usage::UsageStats;
use switchboard_upstream::{anthropic, dialect, picker, pool, ConnectionPool, Dialect, RequestFacts};

/// The process singletons the router runs against, passed as dependencies
/// rather than reached through globals.
#[derive(Clone)]
pub struct RouterContext {
    pub store: Store,
    pub cache: ConfigCache,
    pub pool: Arc<ConnectionPool>,
    pub health: HealthRegistry,
    pub usage: UsageStats,
}

#[derive(Clone)]
struct Candidate {
    binding: Binding,
    provider: Provider,
}

struct AttemptFailure {
    reason: String,
    status: Option<u16>,
    rate_limited: bool,
}

struct DispatchSuccess {
    response: reqwest::Response,
    /// Captured immediately before the send; telemetry measures
    /// first-chunk latency against it.
    started_at: Instant,
}

/// Route one chat request end to end.
///
/// The returned response streams the upstream body through the telemetry
/// tee; the handler returns as soon as headers are ready, and the
/// telemetry consumer outlives it.
pub async fn route_chat(
    ctx: &RouterContext,
    dialect_tag: Dialect,
    body: &[u8],
) -> Result<Response<Body>, GatewayError> {
    let request_start = Instant::now();
    let request_id = uuid::Uuid::new_v4();

    let facts = dialect::inspect(dialect_tag, body)?;
    let (model, bindings) = ctx.cache.lookup(&facts.model).await?;
    let candidates = select_candidates(ctx, dialect_tag, &facts, bindings).await?;

    let mut items: HashMap<i64, u32> = candidates
        .iter()
        .map(|c| (c.binding.id, c.binding.weight))
        .collect();
    let by_id: HashMap<i64, Candidate> = candidates
        .into_iter()
        .map(|c| (c.binding.id, c))
        .collect();

    let max_retry = model.max_retry.max(0) as u32;
    let budget = Duration::from_secs(model.timeout_secs.max(0) as u64);
    let deadline = request_start + budget;
    let attempt_timeout = budget / 3;

    let log_writer = LogWriter::spawn(ctx.store.clone());
    let mut last_error: Option<String> = None;
    let mut deadline_fired = false;
    let mut success: Option<(i64, DispatchSuccess, u32)> = None;

    for attempt in 0..max_retry {
        // The outer budget dominates the per-attempt timeouts. The first
        // attempt may start even on a zero budget.
        if attempt > 0 && Instant::now() >= deadline {
            deadline_fired = true;
            break;
        }

        let binding_id = match picker::pick(&items) {
            Ok(id) => id,
            Err(_) => break, // every candidate was dropped or decayed away
        };
        let candidate = &by_id[&binding_id];

        match dispatch(ctx, dialect_tag, candidate, &facts, attempt_timeout).await {
            Ok(dispatched) => {
                success = Some((binding_id, dispatched, attempt));
                break;
            }
            Err(failure) => {
                tracing::debug!(
                    %request_id,
                    binding_id,
                    attempt,
                    error = %failure.reason,
                    "dispatch attempt failed"
                );
                log_writer.submit(ChatLogDraft {
                    model_name: facts.model.clone(),
                    provider_name: candidate.provider.name.clone(),
                    upstream_model: candidate.binding.upstream_model.clone(),
                    dialect: dialect_tag.as_str().to_string(),
                    status: LOG_STATUS_ERROR.to_string(),
                    error: Some(failure.reason.clone()),
                    retry: i64::from(attempt),
                    proxy_time_ms: request_start.elapsed().as_millis() as i64,
                });
                if let Err(e) = ctx
                    .health
                    .on_failure(candidate.provider.id, &failure.reason, failure.status)
                    .await
                {
                    tracing::warn!(provider_id = candidate.provider.id, error = %e, "health write failed");
                }

                if failure.rate_limited {
                    decay_weight(&mut items, binding_id);
                } else {
                    items.remove(&binding_id);
                }
                last_error = Some(failure.reason);
            }
        }
    }

    let Some((binding_id, dispatched, attempt)) = success else {
        log_writer.finish().await;
        let last_error = last_error.unwrap_or_else(|| "no dispatch attempts were made".to_string());
        return Err(if deadline_fired {
            GatewayError::BudgetExceeded { last_error }
        } else {
            GatewayError::RetryExhausted { last_error }
        });
    };

    // Success path: log first, then health and usage off the hot path.
    let candidate = &by_id[&binding_id];
    let log_id = ctx
        .store
        .insert_chat_log(&ChatLogDraft {
            model_name: facts.model.clone(),
            provider_name: candidate.provider.name.clone(),
            upstream_model: candidate.binding.upstream_model.clone(),
            dialect: dialect_tag.as_str().to_string(),
            status: LOG_STATUS_SUCCESS.to_string(),
            error: None,
            retry: i64::from(attempt),
            proxy_time_ms: request_start.elapsed().as_millis() as i64,
        })
        .await?;

    {
        let health = ctx.health.clone();
        let provider_id = candidate.provider.id;
        tokio::spawn(async move {
            if let Err(e) = health.on_success(provider_id).await {
                tracing::warn!(provider_id, error = %e, "health write failed");
            }
        });
    }

    log_writer.finish().await;

    let (tee_tx, _consumer) = telemetry::spawn_consumer(
        ctx.store.clone(),
        ctx.usage.clone(),
        TelemetryParams {
            dialect: dialect_tag,
            stream: facts.stream,
            log_id,
            provider_id: candidate.provider.id,
            dispatch_start: dispatched.started_at,
        },
    );

    tracing::info!(
        %request_id,
        model = %facts.model,
        provider = %candidate.provider.name,
        retry = attempt,
        stream = facts.stream,
        "request routed"
    );

    let mut builder = Response::builder().status(dispatched.response.status());
    builder = if facts.stream {
        builder
            .header(header::CONTENT_TYPE, "text/event-stream")
            .header(header::CACHE_CONTROL, "no-cache")
            .header(header::CONNECTION, "keep-alive")
    } else {
        builder.header(header::CONTENT_TYPE, "application/json")
    };
    builder
        .body(telemetry::tee_body(dispatched.response, tee_tx))
        .map_err(|e| GatewayError::internal(e.to_string()))
}

/// Dialect, health (with the degradation rule) and capability filtering.
async fn select_candidates(
    ctx: &RouterContext,
    dialect_tag: Dialect,
    facts: &RequestFacts,
    bindings: Vec<Binding>,
) -> Result<Vec<Candidate>, GatewayError> {
    let mut in_dialect = Vec::new();
    for binding in bindings {
        let provider = match ctx.cache.provider(binding.provider_id).await {
            Ok(provider) => provider,
            Err(_) => {
                tracing::debug!(binding_id = binding.id, "binding references unknown provider");
                continue;
            }
        };
        if provider.dialect() != Some(dialect_tag) {
            continue;
        }
        in_dialect.push(Candidate { binding, provider });
    }
    if in_dialect.is_empty() {
        return Err(GatewayError::NoProviderForModel {
            model: facts.model.clone(),
        });
    }

    let mut healthy = Vec::new();
    for candidate in &in_dialect {
        let health = ctx.health.get(candidate.provider.id).await?;
        if health.is_healthy {
            healthy.push(candidate.clone());
        }
    }
    let candidates = if healthy.is_empty() {
        tracing::warn!(
            model = %facts.model,
            "no healthy provider; falling back to full candidate set"
        );
        in_dialect
    } else {
        healthy
    };

    let capable: Vec<Candidate> = candidates
        .into_iter()
        .filter(|c| {
            c.binding.tool_call.allows(facts.wants_tool_call)
                && c.binding.structured_output.allows(facts.wants_structured_output)
                && c.binding.image.allows(facts.wants_image)
        })
        .collect();
    if capable.is_empty() {
        return Err(GatewayError::NoCapableProvider {
            model: facts.model.clone(),
        });
    }
    Ok(capable)
}

/// Rate-limit decay: subtract a third of the weight, at least one point,
/// flooring at one so the binding stays eligible.
fn decay_weight(items: &mut HashMap<i64, u32>, binding_id: i64) {
    if let Some(weight) = items.get_mut(&binding_id) {
        let decay = (*weight / 3).max(1);
        *weight = weight.saturating_sub(decay).max(1);
    }
}

/// One upstream attempt: acquire a client, stamp the upstream model into
/// the body, send with the header timeout, classify the result.
async fn dispatch(
    ctx: &RouterContext,
    dialect_tag: Dialect,
    candidate: &Candidate,
    facts: &RequestFacts,
    attempt_timeout: Duration,
) -> Result<DispatchSuccess, AttemptFailure> {
    let hard = |reason: String| AttemptFailure {
        reason,
        status: None,
        rate_limited: false,
    };

    let settings = candidate
        .provider
        .settings()
        .map_err(|e| hard(format!("invalid provider config: {e}")))?;
    let endpoint = format!(
        "{}{}",
        settings.base_url.trim_end_matches('/'),
        dialect_tag.chat_path()
    );
    let url =
        reqwest::Url::parse(&endpoint).map_err(|e| hard(format!("invalid base URL: {e}")))?;
    let body = dialect::rewrite_model(&facts.body, &candidate.binding.upstream_model)
        .map_err(|e| hard(e.to_string()))?;

    let mut client = ctx
        .pool
        .get(&pool::host_key(&url), attempt_timeout)
        .map_err(|e| hard(e.to_string()))?;

    let request = apply_dialect_headers(
        client
            .client()
            .post(url)
            .header(header::CONTENT_TYPE, "application/json")
            .body(body),
        dialect_tag,
        &settings,
    );

    let started_at = Instant::now();
    match tokio::time::timeout(client.header_timeout(), request.send()).await {
        Err(_) => {
            client.mark_unhealthy();
            ctx.pool.release(client);
            Err(hard("response header timeout".to_string()))
        }
        Ok(Err(e)) => {
            client.mark_unhealthy();
            ctx.pool.release(client);
            Err(hard(format!("transport error: {e}")))
        }
        Ok(Ok(response)) => {
            let status = response.status();
            if status.is_success() {
                ctx.pool.release(client);
                Ok(DispatchSuccess {
                    response,
                    started_at,
                })
            } else if status.as_u16() == 429 {
                drop(response);
                ctx.pool.release(client);
                Err(AttemptFailure {
                    reason: "upstream returned 429: rate limited".to_string(),
                    status: Some(429),
                    rate_limited: true,
                })
            } else {
                let code = status.as_u16();
                let message = read_error_message(response, attempt_timeout).await;
                ctx.pool.release(client);
                Err(AttemptFailure {
                    reason: format!("upstream returned {code}: {message}"),
                    status: Some(code),
                    rate_limited: false,
                })
            }
        }
    }
}

/// Dialect-specific auth and protocol headers.
pub(crate) fn apply_dialect_headers(
    request: reqwest::RequestBuilder,
    dialect_tag: Dialect,
    settings: &ProviderSettings,
) -> reqwest::RequestBuilder {
    match dialect_tag {
        Dialect::OpenAi => request.bearer_auth(&settings.api_key),
        Dialect::Anthropic => {
            let mut request = request.header("x-api-key", &settings.api_key).header(
                "anthropic-version",
                settings
                    .anthropic_version
                    .as_deref()
                    .unwrap_or(anthropic::DEFAULT_VERSION),
            );
            if let Some(beta) = &settings.anthropic_beta {
                request = request.header("anthropic-beta", beta);
            }
            request
        }
    }
}

/// Best-effort extraction of an upstream error message; consumes (and
/// therefore closes) the response body.
async fn read_error_message(response: reqwest::Response, limit: Duration) -> String {
    match tokio::time::timeout(limit.max(Duration::from_secs(1)), response.text()).await {
        Ok(Ok(text)) => serde_json::from_str::<serde_json::Value>(&text)
            .ok()
            .and_then(|v| {
                v.pointer("/error/message")
                    .and_then(|m| m.as_str())
                    .map(str::to_string)
            })
            .unwrap_or_else(|| {
                let mut text = text;
                text.truncate(512);
                text
            }),
        _ => "failed to read error response".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::entities::Capability;
    use crate::storage::test_support::temp_store;
    use switchboard_upstream::PoolConfig;

    #[test]
    fn decay_follows_two_thirds_and_floors_at_one() {
        let mut items = HashMap::from([(1i64, 3u32), (2, 9)]);

        decay_weight(&mut items, 1);
        assert_eq!(items[&1], 2);
        decay_weight(&mut items, 1);
        assert_eq!(items[&1], 1);
        decay_weight(&mut items, 1);
        assert_eq!(items[&1], 1, "decayed binding stays eligible");

        decay_weight(&mut items, 2);
        assert_eq!(items[&2], 6);
    }

    #[test]
    fn decay_decreases_the_total_until_the_floor() {
        let mut items = HashMap::from([(1i64, 7u32), (2, 2)]);
        let mut previous: u64 = items.values().map(|&w| u64::from(w)).sum();
        while items[&1] > 1 {
            decay_weight(&mut items, 1);
            let total: u64 = items.values().map(|&w| u64::from(w)).sum();
            assert!(total < previous);
            previous = total;
        }
    }

    async fn seeded_context() -> (RouterContext, tempfile::TempDir) {
        let (store, dir) = temp_store().await;
        let ctx = RouterContext {
            store: store.clone(),
            cache: ConfigCache::new(store.clone(), Duration::from_secs(300)),
            pool: Arc::new(ConnectionPool::new(PoolConfig::default())),
            health: HealthRegistry::new(store.clone()),
            usage: UsageStats::new(store),
        };
        (ctx, dir)
    }

    fn facts(model: &str, wants_tool_call: bool) -> RequestFacts {
        RequestFacts {
            model: model.to_string(),
            stream: false,
            wants_tool_call,
            wants_structured_output: false,
            wants_image: false,
            body: b"{}".to_vec(),
        }
    }

    #[tokio::test]
    async fn capability_filter_drops_explicit_refusals_only() {
        let (ctx, _dir) = seeded_context().await;
        let provider = ctx
            .store
            .insert_provider("acme", Dialect::OpenAi, r#"{"base_url":"http://localhost:1"}"#)
            .await
            .unwrap();
        let model = ctx.store.insert_model("m1", 3, 60).await.unwrap();
        let refuses = ctx
            .store
            .insert_binding(
                model,
                provider,
                "a",
                Capability::No,
                Capability::Unset,
                Capability::Unset,
                1,
            )
            .await
            .unwrap();
        let unset = ctx
            .store
            .insert_binding(
                model,
                provider,
                "b",
                Capability::Unset,
                Capability::Unset,
                Capability::Unset,
                1,
            )
            .await
            .unwrap();

        let (_, bindings) = ctx.cache.lookup("m1").await.unwrap();
        let selected = select_candidates(&ctx, Dialect::OpenAi, &facts("m1", true), bindings)
            .await
            .unwrap();
        let ids: Vec<i64> = selected.iter().map(|c| c.binding.id).collect();
        assert!(!ids.contains(&refuses));
        assert!(ids.contains(&unset));
    }

    #[tokio::test]
    async fn dialect_mismatch_yields_no_provider_for_model() {
        let (ctx, _dir) = seeded_context().await;
        let provider = ctx
            .store
            .insert_provider(
                "claude-only",
                Dialect::Anthropic,
                r#"{"base_url":"http://localhost:1"}"#,
            )
            .await
            .unwrap();
        let model = ctx.store.insert_model("m1", 3, 60).await.unwrap();
        ctx.store
            .insert_binding(
                model,
                provider,
                "a",
                Capability::Unset,
                Capability::Unset,
                Capability::Unset,
                1,
            )
            .await
            .unwrap();

        let (_, bindings) = ctx.cache.lookup("m1").await.unwrap();
        let result = select_candidates(&ctx, Dialect::OpenAi, &facts("m1", false), bindings).await;
        assert!(matches!(
            result,
            Err(GatewayError::NoProviderForModel { .. })
        ));
    }

    #[tokio::test]
    async fn all_unhealthy_falls_back_to_the_full_set() {
        let (ctx, _dir) = seeded_context().await;
        let provider = ctx
            .store
            .insert_provider("acme", Dialect::OpenAi, r#"{"base_url":"http://localhost:1"}"#)
            .await
            .unwrap();
        let model = ctx.store.insert_model("m1", 3, 60).await.unwrap();
        ctx.store
            .insert_binding(
                model,
                provider,
                "a",
                Capability::Unset,
                Capability::Unset,
                Capability::Unset,
                1,
            )
            .await
            .unwrap();

        let mut health = ctx.health.get(provider).await.unwrap();
        health.is_healthy = false;
        ctx.store.upsert_health(&health).await.unwrap();

        let (_, bindings) = ctx.cache.lookup("m1").await.unwrap();
        let selected = select_candidates(&ctx, Dialect::OpenAi, &facts("m1", false), bindings)
            .await
            .unwrap();
        assert_eq!(selected.len(), 1, "degradation keeps the unhealthy candidate");
    }
}
