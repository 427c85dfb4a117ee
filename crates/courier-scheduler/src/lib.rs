//! # Courier Scheduler
//!
//! Dispatch engine for scheduled outbound messages.
//!
//! ## Architecture
//! ```text
//! attach recipients ─▶ trigger ─▶ JobQueue (tokio timers)
//!                                     │ due
//!                                     ▼
//!                         worker pool ─▶ DispatchEngine::fire
//!                                          ├── SendLoop ─▶ SendChannel (Telegram)
//!                                          │      └── DeliveryLedger (SQLite)
//!                                          └── RetryPolicy ─▶ re-enqueue / FAILED
//! ```
//!
//! State lives in SQLite, so a restarted daemon re-adopts queued jobs and
//! resumes partially sent messages without sending twice.

pub mod alert;
pub mod engine;
pub mod ledger;
pub mod message;
pub mod notify;
pub mod persistence;
pub mod queue;
pub mod retry;
pub mod send_loop;

#[cfg(test)]
mod testing;

pub use alert::DevAlert;
pub use engine::{DispatchEngine, FireOutcome, SkipReason};
pub use ledger::Ledger;
pub use message::{
    DeliveryStatus, LedgerEntry, LogEntry, LogLevel, MessageStatus, Recipient, ScheduledMessage,
};
pub use notify::LogSink;
pub use persistence::DispatchDb;
pub use queue::{DeferredQueue, DueJob, JobHandle, JobQueue, TimerQueue};
pub use retry::{RetryDecision, RetryPolicy};
pub use send_loop::{LoopReport, run_send_loop};
