//! Off-path chat-log persistence for the retry loop.
//!
//! Failed attempts inside a retried request must not block on a slow
//! database, so they are pushed through a bounded channel and written by a
//! per-request drain task. Closing the channel (dropping the writer) is
//! the drain's done signal; [`LogWriter::finish`] waits for the last
//! insert before the request completes.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::storage::entities::ChatLogDraft;
use crate::storage::Store;

const CHANNEL_CAPACITY: usize = 32;

/// Per-request error-log channel plus its drain task.
pub struct LogWriter {
    tx: mpsc::Sender<ChatLogDraft>,
    handle: JoinHandle<()>,
}

impl LogWriter {
    /// Spawn the drain task for one request.
    pub fn spawn(store: Store) -> Self {
        let (tx, mut rx) = mpsc::channel::<ChatLogDraft>(CHANNEL_CAPACITY);
        let handle = tokio::spawn(async move {
            while let Some(draft) = rx.recv().await {
                if let Err(e) = store.insert_chat_log(&draft).await {
                    tracing::warn!(error = %e, "failed to persist chat log");
                }
            }
        });
        Self { tx, handle }
    }

    /// Queue a draft without waiting. A full channel drops the record with
    /// a warning rather than stalling the retry loop.
    pub fn submit(&self, draft: ChatLogDraft) {
        if let Err(e) = self.tx.try_send(draft) {
            tracing::warn!(error = %e, "chat log channel full; dropping record");
        }
    }

    /// Close the channel and wait for queued records to land.
    pub async fn finish(self) {
        drop(self.tx);
        let _ = self.handle.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::entities::LOG_STATUS_ERROR;
    use crate::storage::test_support::temp_store;

    fn error_draft(retry: i64) -> ChatLogDraft {
        ChatLogDraft {
            model_name: "m1".to_string(),
            provider_name: "acme".to_string(),
            upstream_model: "gpt-test".to_string(),
            dialect: "openai".to_string(),
            status: LOG_STATUS_ERROR.to_string(),
            error: Some("upstream returned 500".to_string()),
            retry,
            proxy_time_ms: 12,
        }
    }

    #[tokio::test]
    async fn drain_persists_everything_before_finish_returns() {
        let (store, _dir) = temp_store().await;
        let writer = LogWriter::spawn(store.clone());

        writer.submit(error_draft(0));
        writer.submit(error_draft(1));
        writer.finish().await;

        let logs = store.list_chat_logs().await.unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].retry, 0);
        assert_eq!(logs[1].retry, 1);
        assert_eq!(logs[1].status, "error");
    }
}
