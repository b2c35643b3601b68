//! Error types for upstream plumbing.
//!
//! These are the per-attempt outcomes the gateway's retry engine recovers
//! from, plus the non-recoverable preprocessing and telemetry failures.

use thiserror::Error;

/// Errors produced while preprocessing, dispatching to, or parsing an
/// upstream provider.
#[derive(Error, Debug)]
pub enum UpstreamError {
    /// The inbound request body could not be interpreted for routing.
    #[error("bad request: {message}")]
    BadRequest { message: String },

    /// The per-host connection pool is at its active-connection limit.
    #[error("connection limit reached for host {host}")]
    ConnectionLimitReached { host: String },

    /// The upstream could not be reached, or the response headers did not
    /// arrive within the attempt's header timeout.
    #[error("upstream transport error: {message}")]
    Transport { message: String },

    /// The upstream answered HTTP 429.
    #[error("upstream rate limited")]
    RateLimited,

    /// The upstream answered a non-2xx status other than 429.
    #[error("upstream returned {status}: {message}")]
    Status { status: u16, message: String },

    /// The telemetry consumer could not make sense of the response stream.
    /// Recorded into the chat log, never surfaced to the caller.
    #[error("telemetry parse error: {message}")]
    TelemetryParse { message: String },
}

impl UpstreamError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        UpstreamError::BadRequest {
            message: message.into(),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        UpstreamError::Transport {
            message: message.into(),
        }
    }
}

impl From<reqwest::Error> for UpstreamError {
    fn from(err: reqwest::Error) -> Self {
        UpstreamError::Transport {
            message: err.to_string(),
        }
    }
}
