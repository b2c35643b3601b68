//! # Switchboard Upstream Plumbing
//!
//! Dialect-aware building blocks shared by the Switchboard gateway:
//! request preprocessors and stream-usage parsers for the supported
//! upstream wire protocols, a weighted picker for load balancing, and a
//! per-host HTTP connection pool.
//!
//! ## Overview
//!
//! This crate knows nothing about the gateway's database or HTTP surface.
//! It answers four questions:
//!
//! - **What does this request need?** [`dialect::inspect`] extracts the
//!   model name, streaming flag and capability requirements from a raw
//!   request body without otherwise interpreting it.
//! - **Which candidate gets the request?** [`picker::pick`] selects one key
//!   from a weight map, proportionally to weight.
//! - **Over which connection?** [`pool::ConnectionPool`] hands out pooled,
//!   lifetime-managed HTTP clients per upstream host.
//! - **What did the upstream say?** [`dialect::StreamScanner`] parses a
//!   teed copy of the response stream into token usage and error facts.
//!
//! ## Dialects
//!
//! Two wire protocol families are supported: `openai` (chat completions,
//! `data:`-framed SSE) and `anthropic` (messages, `event:`/`data:` SSE).
//! The gateway forwards bodies opaquely; the only rewrites ever applied are
//! stamping the upstream model name and, for streamed OpenAI requests,
//! forcing `stream_options.include_usage` so the final chunk carries usage.

pub mod anthropic;
pub mod dialect;
pub mod error;
pub mod openai;
pub mod picker;
pub mod pool;
pub mod sse;

pub use dialect::{Dialect, RequestFacts, StreamScanner, TokenUsage};
pub use error::UpstreamError;
pub use picker::{pick, PickError};
pub use pool::{ConnectionPool, PoolConfig, PooledClient};
