//! Error types.
//!
//! `CourierError` is the crate-wide error used by storage, configuration and
//! the public engine API. `SendError` and `DispatchFailure` form the failure
//! taxonomy of a dispatch: what a single provider call can report, and how a
//! whole send loop ends when it does not finish cleanly.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, CourierError>;

#[derive(Debug, Error)]
pub enum CourierError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid transition for message {id}: {from} -> {to}")]
    InvalidTransition { id: i64, from: String, to: String },

    #[error("Message {0} has no recipients")]
    NoRecipients(i64),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Outcome of one provider call that did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    /// Provider-imposed wait. The caller must not send again before it elapses.
    #[error("flood wait: retry after {seconds}s")]
    FloodWait { seconds: u64 },

    /// The stored session cannot act for the account.
    #[error("session not authorized: {0}")]
    Unauthorized(String),

    /// The connection itself failed; nothing more can be sent on it.
    #[error("connection lost: {0}")]
    Disconnected(String),

    /// The provider refused this one message (bad handle, blocked, too large...).
    #[error("rejected: {0}")]
    Rejected(String),
}

/// Why a send loop stopped before every recipient was attempted.
///
/// Per-recipient rejections are not here: they are written to the delivery
/// ledger and the loop moves on.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchFailure {
    #[error("rate limited for {seconds}s")]
    RateLimited { seconds: u64 },

    #[error("authorization failed: {0}")]
    AuthorizationFailed(String),

    #[error("loop failed: {0}")]
    LoopFailed(String),
}

impl From<SendError> for DispatchFailure {
    fn from(err: SendError) -> Self {
        match err {
            SendError::FloodWait { seconds } => DispatchFailure::RateLimited { seconds },
            SendError::Unauthorized(e) => DispatchFailure::AuthorizationFailed(e),
            SendError::Disconnected(e) | SendError::Rejected(e) => DispatchFailure::LoopFailed(e),
        }
    }
}

impl From<CourierError> for DispatchFailure {
    fn from(err: CourierError) -> Self {
        DispatchFailure::LoopFailed(err.to_string())
    }
}
