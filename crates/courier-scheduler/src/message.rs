//! Scheduled message model: recipients, dispatch status, ledger rows, log rows.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A destination on the provider. Immutable to the engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Recipient {
    pub id: i64,
    pub name: String,
    /// `@username` or a numeric chat id.
    pub handle: String,
}

/// Dispatch status of a scheduled message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageStatus {
    /// Created, not yet eligible (no recipients or no future schedule).
    Pending,
    /// A dispatch job is queued.
    Scheduled,
    /// The send loop has started at least once and not finished cleanly.
    Partial,
    /// Every recipient has a SENT ledger entry.
    Sent,
    /// Last loop failed. Terminal unless a retry job is pending.
    Failed,
    Cancelled,
}

impl MessageStatus {
    pub const ALL: [MessageStatus; 6] = [
        MessageStatus::Pending,
        MessageStatus::Scheduled,
        MessageStatus::Partial,
        MessageStatus::Sent,
        MessageStatus::Failed,
        MessageStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Pending => "PENDING",
            MessageStatus::Scheduled => "SCHEDULED",
            MessageStatus::Partial => "PARTIAL",
            MessageStatus::Sent => "SENT",
            MessageStatus::Failed => "FAILED",
            MessageStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s.trim()))
    }

    /// The transition table of the dispatch state machine.
    pub fn can_transition_to(self, next: MessageStatus) -> bool {
        use MessageStatus::*;
        matches!(
            (self, next),
            (Pending, Scheduled)
                | (Pending, Cancelled)
                | (Scheduled, Scheduled)
                | (Scheduled, Partial)
                | (Scheduled, Cancelled)
                | (Partial, Partial)
                | (Partial, Sent)
                | (Partial, Failed)
                | (Failed, Partial)
                | (Failed, Scheduled)
        )
    }

    /// SENT and CANCELLED never change again.
    pub fn is_terminal(self) -> bool {
        matches!(self, MessageStatus::Sent | MessageStatus::Cancelled)
    }
}

impl std::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A message scheduled for delivery through one account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledMessage {
    pub id: i64,
    pub account_id: i64,
    pub text: String,
    /// Path of a file sent along with the text.
    pub attachment: Option<String>,
    pub scheduled_at: DateTime<Utc>,
    pub status: MessageStatus,
    /// Handle of the queued dispatch job. A job whose handle no longer
    /// matches this one is stale.
    pub job_id: Option<String>,
    /// When the current job is due; used to re-adopt jobs after a restart.
    pub next_run_at: Option<DateTime<Utc>>,
    /// Generic-failure retries consumed since the last fresh trigger.
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ScheduledMessage {
    /// True when a dispatch job is expected to fire for this message.
    pub fn has_pending_job(&self) -> bool {
        self.job_id.is_some() && !self.status.is_terminal() && self.status != MessageStatus::Pending
    }
}

/// Outcome recorded for one (message, recipient) attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryStatus {
    Sent,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Sent => "SENT",
            DeliveryStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "SENT" => Some(DeliveryStatus::Sent),
            "FAILED" => Some(DeliveryStatus::Failed),
            _ => None,
        }
    }
}

/// One row of the delivery ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: i64,
    pub message_id: i64,
    pub recipient_id: i64,
    pub status: DeliveryStatus,
    pub error: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

/// Severity of a persisted log event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARNING",
            LogLevel::Error => "ERROR",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "DEBUG" => Some(LogLevel::Debug),
            "INFO" => Some(LogLevel::Info),
            "WARNING" | "WARN" => Some(LogLevel::Warning),
            "ERROR" => Some(LogLevel::Error),
            _ => None,
        }
    }
}

/// A status event from the engine, as stored and broadcast.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: i64,
    pub level: LogLevel,
    /// Emitting component (`engine`, `send_loop`, ...).
    pub source: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
}
