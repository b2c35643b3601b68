//! # Stream Tee & Telemetry Consumer
//!
//! The upstream response body is forwarded to the client byte-for-byte
//! while a teed copy flows through a bounded channel into a per-request
//! consumer task. The consumer parses the copy for first-chunk latency,
//! stream duration, token usage and TPS, then applies the second write to
//! the request's chat log and folds the usage into the daily counters.
//!
//! Client delivery is never blocked by telemetry: when the channel fills
//! up the tee degrades to forward-only, and when the consumer aborts (for
//! example on an oversized frame) the tee sees the closed channel and
//! stops copying. Dropping the response body, as axum does when the caller
//! disconnects, closes the channel and unwinds the consumer with whatever
//! partial metrics it has.

use axum::body::{Body, Bytes};
use futures::StreamExt;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::storage::entities::{StreamUpdate, LOG_STATUS_ERROR, LOG_STATUS_SUCCESS};
use crate::storage::Store;
use crate::usage::UsageStats;
use switchboard_upstream::sse::MAX_FRAME_BYTES;
use switchboard_upstream::{dialect, Dialect, StreamScanner};

const TEE_CAPACITY: usize = 256;

/// Everything the consumer needs to know about its request.
#[derive(Debug, Clone, Copy)]
pub struct TelemetryParams {
    pub dialect: Dialect,
    pub stream: bool,
    pub log_id: i64,
    pub provider_id: i64,
    /// Captured at dispatch; first-chunk latency is measured against it.
    pub dispatch_start: Instant,
}

/// Spawn the per-request telemetry consumer. Returns the tee's send side
/// and the consumer handle (detached in production, awaited in tests).
pub fn spawn_consumer(
    store: Store,
    usage_stats: UsageStats,
    params: TelemetryParams,
) -> (mpsc::Sender<Bytes>, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(TEE_CAPACITY);
    let handle = tokio::spawn(consume(store, usage_stats, params, rx));
    (tx, handle)
}

/// Wrap the upstream body so every chunk goes to the client and, while the
/// consumer keeps up, to the telemetry channel.
pub fn tee_body(upstream: reqwest::Response, tx: mpsc::Sender<Bytes>) -> Body {
    let mut stream = upstream.bytes_stream();
    Body::from_stream(async_stream::stream! {
        let mut tee_open = true;
        while let Some(next) = stream.next().await {
            match next {
                Ok(bytes) => {
                    if tee_open {
                        match tx.try_send(bytes.clone()) {
                            Ok(()) => {}
                            Err(mpsc::error::TrySendError::Full(_)) => {
                                tracing::warn!(
                                    "telemetry consumer lagging; tee degrades to forward-only"
                                );
                                tee_open = false;
                            }
                            Err(mpsc::error::TrySendError::Closed(_)) => {
                                tee_open = false;
                            }
                        }
                    }
                    yield Ok::<Bytes, std::io::Error>(bytes);
                }
                Err(e) => {
                    yield Err(std::io::Error::other(e));
                    break;
                }
            }
        }
    })
}

async fn consume(
    store: Store,
    usage_stats: UsageStats,
    params: TelemetryParams,
    mut rx: mpsc::Receiver<Bytes>,
) {
    let update = if params.stream {
        scan_stream(params.dialect, params.dispatch_start, &mut rx).await
    } else {
        scan_body(params.dialect, params.dispatch_start, &mut rx).await
    };
    let elapsed_ms = params.dispatch_start.elapsed().as_millis() as f64;

    if let Err(e) = store.update_chat_log_stream(params.log_id, &update).await {
        tracing::warn!(log_id = params.log_id, error = %e, "telemetry log update failed");
    }

    if update.status == LOG_STATUS_SUCCESS {
        if let Some(usage) = update.usage {
            usage_stats.record_detached(params.provider_id, usage, elapsed_ms);
        }
    }
}

async fn scan_stream(
    dialect: Dialect,
    dispatch_start: Instant,
    rx: &mut mpsc::Receiver<Bytes>,
) -> StreamUpdate {
    let mut scanner = StreamScanner::new(dialect);
    let mut first_frame_at: Option<Instant> = None;
    let mut abort_error: Option<String> = None;

    while let Some(chunk) = rx.recv().await {
        if let Err(e) = scanner.push(&chunk) {
            // Oversized frame. Stop consuming; the tee degrades on its own.
            abort_error = Some(e.to_string());
            break;
        }
        if first_frame_at.is_none() && scanner.frames() > 0 {
            first_frame_at = Some(Instant::now());
        }
    }

    let stream_end = Instant::now();
    let outcome = scanner.finish();
    let error = abort_error.or(outcome.error);

    let first_chunk_ms = first_frame_at.map(|at| (at - dispatch_start).as_millis() as i64);
    let chunk_time_ms = first_frame_at.map(|at| (stream_end - at).as_millis() as i64);
    let tps = match (outcome.usage, chunk_time_ms) {
        (Some(usage), Some(ms)) if ms > 0 && usage.total_tokens > 0 => {
            Some(f64::from(usage.total_tokens) / (ms as f64 / 1000.0))
        }
        _ => None,
    };

    StreamUpdate {
        status: if error.is_some() {
            LOG_STATUS_ERROR.to_string()
        } else {
            LOG_STATUS_SUCCESS.to_string()
        },
        error,
        first_chunk_ms,
        chunk_time_ms,
        tps,
        usage: outcome.usage,
    }
}

async fn scan_body(
    dialect: Dialect,
    dispatch_start: Instant,
    rx: &mut mpsc::Receiver<Bytes>,
) -> StreamUpdate {
    let mut body = Vec::new();
    let mut first_chunk_at: Option<Instant> = None;
    let mut overflowed = false;

    while let Some(chunk) = rx.recv().await {
        if first_chunk_at.is_none() {
            first_chunk_at = Some(Instant::now());
        }
        if body.len() + chunk.len() > MAX_FRAME_BYTES {
            overflowed = true;
            break;
        }
        body.extend_from_slice(&chunk);
    }

    let first_chunk_ms = first_chunk_at.map(|at| (at - dispatch_start).as_millis() as i64);
    let parsed = if overflowed {
        Err(format!("response body exceeds {MAX_FRAME_BYTES} bytes"))
    } else {
        dialect::parse_body_usage(dialect, &body).map_err(|e| e.to_string())
    };

    match parsed {
        Ok(usage) => StreamUpdate {
            status: LOG_STATUS_SUCCESS.to_string(),
            error: None,
            first_chunk_ms,
            chunk_time_ms: None,
            tps: None,
            usage: Some(usage),
        },
        Err(message) => StreamUpdate {
            status: LOG_STATUS_ERROR.to_string(),
            error: Some(message),
            first_chunk_ms,
            chunk_time_ms: None,
            tps: None,
            usage: None,
        },
    }
}
