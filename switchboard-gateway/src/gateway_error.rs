//! # Gateway Error Types
//!
//! The single error enum the HTTP surface speaks, with the status-code
//! mapping for every failure class the router can surface.
//!
//! Routing-internal outcomes (transport errors, 429s, non-2xx statuses,
//! pool exhaustion) are recovered inside the retry loop and never reach
//! this type directly; what surfaces is the terminal classification:
//! selection failures, budget exhaustion, or preprocessing rejection.
//! Once the first byte of a streamed response has been flushed, failures
//! can no longer change the status code; the stream simply terminates.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use crate::storage::StorageError;
use switchboard_upstream::UpstreamError;

/// Request-terminating failures of the gateway.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// The preprocessor rejected the request body.
    #[error("bad request: {message}")]
    BadRequest { message: String },

    /// The requested logical model is not configured.
    #[error("model not configured: {model}")]
    ModelNotConfigured { model: String },

    /// The model exists but has no bindings.
    #[error("no bindings for model: {model}")]
    NoBindings { model: String },

    /// A binding references a provider the cache does not know.
    #[error("provider not configured: {id}")]
    ProviderNotConfigured { id: i64 },

    /// No binding in the requested dialect serves this model.
    #[error("no provider available for model: {model}")]
    NoProviderForModel { model: String },

    /// Candidates exist but none satisfies the request's capabilities.
    #[error("no capable provider for model: {model}")]
    NoCapableProvider { model: String },

    /// The retry loop ran out of attempts or candidates.
    #[error("retries exhausted: {last_error}")]
    RetryExhausted { last_error: String },

    /// The model's wall-clock budget expired before any attempt succeeded.
    #[error("retry budget exceeded: {last_error}")]
    BudgetExceeded { last_error: String },

    /// The inbound request was cancelled by the caller.
    #[error("request cancelled")]
    Cancelled,

    /// Authentication middleware rejection.
    #[error("authentication failed: {message}")]
    Auth { message: String },

    /// Persistence failure on the request path.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Anything else. Should not normally surface.
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl GatewayError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        GatewayError::BadRequest {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        GatewayError::Internal {
            message: message.into(),
        }
    }
}

impl From<UpstreamError> for GatewayError {
    fn from(err: UpstreamError) -> Self {
        match err {
            UpstreamError::BadRequest { message } => GatewayError::BadRequest { message },
            other => GatewayError::Internal {
                message: other.to_string(),
            },
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let (status, error_type) = match &self {
            GatewayError::BadRequest { .. } => (StatusCode::BAD_REQUEST, "invalid_request"),
            GatewayError::ModelNotConfigured { .. } => {
                (StatusCode::NOT_FOUND, "model_not_configured")
            }
            GatewayError::NoBindings { .. } => (StatusCode::NOT_FOUND, "no_bindings"),
            GatewayError::ProviderNotConfigured { .. } => {
                (StatusCode::NOT_FOUND, "provider_not_configured")
            }
            GatewayError::NoProviderForModel { .. } => {
                (StatusCode::SERVICE_UNAVAILABLE, "no_provider_for_model")
            }
            GatewayError::NoCapableProvider { .. } => {
                (StatusCode::SERVICE_UNAVAILABLE, "no_capable_provider")
            }
            GatewayError::RetryExhausted { .. } => {
                (StatusCode::SERVICE_UNAVAILABLE, "retry_exhausted")
            }
            GatewayError::BudgetExceeded { .. } => {
                (StatusCode::SERVICE_UNAVAILABLE, "budget_exceeded")
            }
            GatewayError::Cancelled => (StatusCode::REQUEST_TIMEOUT, "cancelled"),
            GatewayError::Auth { .. } => (StatusCode::UNAUTHORIZED, "authentication_error"),
            GatewayError::Storage(_) | GatewayError::Internal { .. } => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal_error")
            }
        };

        let body = Json(json!({
            "error": {
                "message": self.to_string(),
                "type": error_type,
                "code": status.as_u16()
            }
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_follows_the_taxonomy() {
        let cases: Vec<(GatewayError, StatusCode)> = vec![
            (
                GatewayError::bad_request("nope"),
                StatusCode::BAD_REQUEST,
            ),
            (
                GatewayError::ModelNotConfigured {
                    model: "m".to_string(),
                },
                StatusCode::NOT_FOUND,
            ),
            (
                GatewayError::NoBindings {
                    model: "m".to_string(),
                },
                StatusCode::NOT_FOUND,
            ),
            (
                GatewayError::NoCapableProvider {
                    model: "m".to_string(),
                },
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                GatewayError::RetryExhausted {
                    last_error: "x".to_string(),
                },
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                GatewayError::BudgetExceeded {
                    last_error: "x".to_string(),
                },
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                GatewayError::Auth {
                    message: "x".to_string(),
                },
                StatusCode::UNAUTHORIZED,
            ),
        ];
        for (error, expected) in cases {
            assert_eq!(error.into_response().status(), expected);
        }
    }
}
