//! Storage decorator that records access events.
//!
//! Every successful stat/get emits a read event and every put a write
//! event into a bounded channel. A single consumer turns them into
//! access log entries. A full buffer blocks the request path: losing
//! usage data is worse than adding tail latency.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use super::{ByteReader, Storage, StorageError};
use crate::accesslog::AccessLog;
use crate::metrics::Metrics;

pub const BUFFER_SIZE: usize = 2048;

#[derive(Debug)]
enum EventType {
    Read,
    Write,
    Delete,
}

enum Message {
    Event { filename: String, event: EventType },
    Shutdown(oneshot::Sender<()>),
}

pub struct LoggedStorage {
    wrapped: Arc<dyn Storage>,
    tx: mpsc::Sender<Message>,
}

/// Seals the event channel and waits for the consumer to drain.
pub struct ShutdownHandle {
    tx: mpsc::Sender<Message>,
}

impl ShutdownHandle {
    pub async fn shutdown(self, timeout: std::time::Duration) -> Result<(), ShutdownTimeout> {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(Message::Shutdown(ack_tx)).await.is_err() {
            return Ok(());
        }
        tokio::time::timeout(timeout, ack_rx)
            .await
            .map(|_| ())
            .map_err(|_| ShutdownTimeout)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("timed out waiting for access log events to complete")]
pub struct ShutdownTimeout;

impl LoggedStorage {
    pub fn new(wrapped: Arc<dyn Storage>, access_log: AccessLog, metrics: Metrics) -> (Self, ShutdownHandle) {
        let (tx, mut rx) = mpsc::channel::<Message>(BUFFER_SIZE);

        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                match message {
                    Message::Event { filename, event } => {
                        tracing::debug!(filename = %filename, event = ?event, "logging access");
                        let result = match event {
                            EventType::Read => access_log.read(&filename).await,
                            EventType::Write => access_log.write(&filename).await,
                            EventType::Delete => access_log.delete(&filename).await,
                        };
                        if let Err(e) = result {
                            tracing::error!(filename = %filename, error = %e, "failed to log access");
                            metrics.record_access_log_error();
                        }
                    }
                    Message::Shutdown(ack) => {
                        let _ = ack.send(());
                        break;
                    }
                }
            }
        });

        (
            Self {
                wrapped,
                tx: tx.clone(),
            },
            ShutdownHandle { tx },
        )
    }

    async fn emit(&self, filename: &str, event: EventType) {
        let message = Message::Event {
            filename: filename.to_string(),
            event,
        };
        if self.tx.send(message).await.is_err() {
            tracing::debug!(filename, "access log is shut down, dropping event");
        }
    }
}

#[async_trait]
impl Storage for LoggedStorage {
    async fn stat(&self, name: &str) -> Result<Option<u64>, StorageError> {
        let size = self.wrapped.stat(name).await?;
        self.emit(name, EventType::Read).await;
        Ok(size)
    }

    async fn get(&self, name: &str) -> Result<Option<ByteReader>, StorageError> {
        let reader = self.wrapped.get(name).await?;
        self.emit(name, EventType::Read).await;
        Ok(reader)
    }

    async fn put(&self, name: &str, data: ByteReader) -> Result<u64, StorageError> {
        let written = self.wrapped.put(name, data).await?;
        self.emit(name, EventType::Write).await;
        Ok(written)
    }
}
