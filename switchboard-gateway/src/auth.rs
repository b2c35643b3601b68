//! Static-token authentication middleware.
//!
//! The gateway authenticates callers against the single `TOKEN`
//! credential. OpenAI-style callers send `Authorization: Bearer <token>`,
//! Anthropic-style callers send `x-api-key: <token>`; both forms are
//! accepted on every routed endpoint. With no token configured the
//! middleware passes everything through (a warning is logged at boot).

use axum::extract::{Request, State};
use axum::http::header;
use axum::middleware::Next;
use axum::response::Response;

use crate::gateway_error::GatewayError;
use crate::server::AppState;

pub async fn auth_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, GatewayError> {
    let Some(expected) = state.config.auth.token.as_deref() else {
        return Ok(next.run(request).await);
    };

    let verdict = {
        let headers = request.headers();
        headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(str::trim)
            .or_else(|| {
                headers
                    .get("x-api-key")
                    .and_then(|value| value.to_str().ok())
            })
            .map(|token| token == expected)
    };

    match verdict {
        Some(true) => Ok(next.run(request).await),
        Some(false) => Err(GatewayError::Auth {
            message: "invalid token".to_string(),
        }),
        None => Err(GatewayError::Auth {
            message: "missing credentials".to_string(),
        }),
    }
}
