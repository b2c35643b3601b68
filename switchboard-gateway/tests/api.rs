//! API surface tests: model listing, auth middleware, liveness.

mod common;

use axum::http::StatusCode;
use serde_json::{json, Value};

use common::*;
use switchboard_upstream::Dialect;

#[tokio::test]
async fn health_check_is_open() {
    let h = harness_with_token(Some("sekret")).await;
    let response = h.server.get("/health").await;
    assert_eq!(response.status_code(), StatusCode::OK);
    let body: Value = response.json();
    assert_eq!(body["status"], "healthy");
    assert!(body["version"].is_string());
    assert!(body["timestamp"].is_string());
}

#[tokio::test]
async fn models_list_is_shaped_like_openai() {
    let h = harness().await;
    let provider = seed_provider(&h.store, "acme", Dialect::OpenAi, "http://localhost:1").await;
    let alpha = seed_model(&h.store, "alpha", 3, 60).await;
    let beta = seed_model(&h.store, "beta", 3, 60).await;
    seed_binding(&h.store, alpha, provider, "up-alpha", 1).await;
    seed_binding(&h.store, beta, provider, "up-beta", 1).await;

    let response = h.server.get("/v1/models").await;
    assert_eq!(response.status_code(), StatusCode::OK);
    let body: Value = response.json();
    assert_eq!(body["object"], "list");
    let data = body["data"].as_array().unwrap();
    assert_eq!(data.len(), 2);
    assert_eq!(data[0]["id"], "alpha");
    assert_eq!(data[0]["object"], "model");
    assert_eq!(data[1]["id"], "beta");
}

#[tokio::test]
async fn routed_endpoints_require_the_token() {
    let h = harness_with_token(Some("sekret")).await;

    let response = h.server.get("/v1/models").await;
    assert_eq!(response.status_code(), StatusCode::UNAUTHORIZED);

    let response = h
        .server
        .get("/v1/models")
        .add_header("Authorization", "Bearer wrong")
        .await;
    assert_eq!(response.status_code(), StatusCode::UNAUTHORIZED);
    let body: Value = response.json();
    assert_eq!(body["error"]["type"], "authentication_error");

    let response = h
        .server
        .get("/v1/models")
        .add_header("Authorization", "Bearer sekret")
        .await;
    assert_eq!(response.status_code(), StatusCode::OK);

    // The Anthropic-style header form is accepted everywhere.
    let response = h
        .server
        .get("/v1/models")
        .add_header("x-api-key", "sekret")
        .await;
    assert_eq!(response.status_code(), StatusCode::OK);
}

#[tokio::test]
async fn chat_endpoints_are_also_guarded() {
    let h = harness_with_token(Some("sekret")).await;
    let response = h
        .server
        .post("/v1/chat/completions")
        .json(&json!({"model": "m1", "messages": []}))
        .await;
    assert_eq!(response.status_code(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn malformed_bodies_are_rejected_as_bad_requests() {
    let h = harness().await;

    let response = h
        .server
        .post("/v1/chat/completions")
        .json(&json!({"messages": [{"role": "user", "content": "hi"}]}))
        .await;
    assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);
    let body: Value = response.json();
    assert_eq!(body["error"]["type"], "invalid_request");

    let response = h
        .server
        .post("/v1/messages")
        .add_header("content-type", "application/json")
        .bytes("not json at all".into())
        .await;
    assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);
}
