//! Status event sink — fire-and-forget side channel for engine events.
//!
//! Every event goes to `tracing`, the `log_entries` table and a broadcast
//! channel. The daemon subscribes [`DevAlert::forward`](crate::alert::DevAlert::forward)
//! to that channel. None of these can fail a dispatch.

use chrono::Utc;
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::message::{LogEntry, LogLevel};
use crate::persistence::DispatchDb;

const BROADCAST_CAPACITY: usize = 256;

#[derive(Clone)]
pub struct LogSink {
    db: Arc<DispatchDb>,
    tx: broadcast::Sender<LogEntry>,
}

impl LogSink {
    /// Sink that persists events in `db`.
    pub fn new(db: Arc<DispatchDb>) -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self { db, tx }
    }

    /// Live feed of events emitted after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<LogEntry> {
        self.tx.subscribe()
    }

    pub fn emit(&self, level: LogLevel, source: &str, message: impl Into<String>) {
        let message = message.into();
        match level {
            LogLevel::Debug => tracing::debug!("[{source}] {message}"),
            LogLevel::Info => tracing::info!("[{source}] {message}"),
            LogLevel::Warning => tracing::warn!("[{source}] {message}"),
            LogLevel::Error => tracing::error!("[{source}] {message}"),
        }

        let entry = match self.db.insert_log(level, source, &message) {
            Ok(entry) => entry,
            Err(e) => {
                tracing::debug!("Log event not persisted: {e}");
                LogEntry {
                    id: 0,
                    level,
                    source: source.to_string(),
                    message,
                    created_at: Utc::now(),
                }
            }
        };

        // No subscribers is fine.
        let _ = self.tx.send(entry);
    }

    pub fn info(&self, source: &str, message: impl Into<String>) {
        self.emit(LogLevel::Info, source, message);
    }

    pub fn warning(&self, source: &str, message: impl Into<String>) {
        self.emit(LogLevel::Warning, source, message);
    }

    pub fn error(&self, source: &str, message: impl Into<String>) {
        self.emit(LogLevel::Error, source, message);
    }
}
