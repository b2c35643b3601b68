//! # Switchboard Gateway
//!
//! A self-hosted LLM API gateway. Operators register providers (upstream
//! endpoints plus credentials), logical model names, and weighted
//! bindings between them; the gateway accepts OpenAI- and
//! Anthropic-dialect chat requests, picks a binding
//! capability-and-health-aware, retries across candidates within a
//! per-model budget, and streams the upstream response back while a teed
//! copy feeds per-request telemetry into the chat log.
//!
//! ## Module Map
//!
//! - [`config`]: process configuration (TOML + environment)
//! - [`storage`]: embedded SQLite persistence for all entities
//! - [`cache`]: hot snapshot of {models, providers, bindings}
//! - [`health`]: provider health registry and the background checker
//! - [`usage`]: per-provider daily usage counters
//! - [`chatlog`]: off-path chat-log writer for the retry loop
//! - [`router`]: candidate selection, weighted pick, retry engine
//! - [`telemetry`]: stream tee and the per-request usage parser
//! - [`auth`], [`handlers`], [`server`]: the HTTP surface
//!
//! The dialect parsers, weighted picker and connection pool live in the
//! `switchboard-upstream` crate.

pub mod auth;
pub mod cache;
pub mod chatlog;
pub mod config;
pub mod gateway_error;
pub mod handlers;
pub mod health;
pub mod router;
pub mod server;
pub mod storage;
pub mod telemetry;
pub mod usage;

pub use gateway_error::GatewayError;
pub use server::{create_server, Gateway};
