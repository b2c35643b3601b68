//! # HTTP Request Handlers
//!
//! The routed subset of the API surface:
//!
//! - `POST /v1/chat/completions` — OpenAI-dialect chat, streamed or not
//! - `POST /v1/messages` — Anthropic-dialect messages
//! - `GET /v1/models` — configured logical models as an OpenAI ModelList
//! - `GET /health` — liveness probe
//!
//! Request and response bodies pass through opaquely; the handlers hand
//! raw bytes to the router and stream whatever the upstream answers back
//! to the caller, SSE framing preserved byte for byte.

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::Response;
use axum::Json;
use serde_json::{json, Value};

use crate::gateway_error::GatewayError;
use crate::router;
use crate::server::AppState;
use switchboard_upstream::Dialect;

/// OpenAI-compatible chat completion endpoint.
pub async fn chat_completions(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Response<Body>, GatewayError> {
    router::route_chat(&state.router, Dialect::OpenAi, &body).await
}

/// Anthropic-compatible messages endpoint.
pub async fn messages(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Response<Body>, GatewayError> {
    router::route_chat(&state.router, Dialect::Anthropic, &body).await
}

/// List the configured logical models, shaped like an OpenAI ModelList.
pub async fn list_models(State(state): State<AppState>) -> Result<Json<Value>, GatewayError> {
    let models = state.router.cache.models().await?;
    let created = chrono::Utc::now().timestamp();
    let data: Vec<Value> = models
        .iter()
        .map(|model| {
            json!({
                "id": model.name,
                "object": "model",
                "created": created,
                "owned_by": "switchboard",
            })
        })
        .collect();
    Ok(Json(json!({"object": "list", "data": data})))
}

/// Liveness probe; deliberately does not touch the database.
pub async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}
