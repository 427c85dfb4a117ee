//! Channel seams between the dispatch engine and a messaging provider.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::SendError;

/// An outbound messaging account, as seen by a channel adapter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Account {
    pub id: i64,
    /// Friendly name for the account.
    pub name: String,
    pub phone: String,
    /// Session file stem inside the data directory.
    pub session_file: String,
    pub is_active: bool,
}

impl Account {
    /// Session file stem derived from the digits of a phone number.
    pub fn session_file_for(phone: &str) -> String {
        let digits: String = phone.chars().filter(|c| c.is_ascii_digit()).collect();
        format!("session_{digits}")
    }

    /// Full path of the session file under `data_dir`.
    pub fn session_path(&self, data_dir: &Path) -> PathBuf {
        data_dir.join(format!("{}.session", self.session_file))
    }
}

/// One authenticated connection to the provider for a single account.
///
/// A connection is not assumed safe for concurrent use: the send loop drives
/// it sequentially.
#[async_trait]
pub trait SendChannel: Send + Sync {
    /// Provider name, for logs.
    fn name(&self) -> &str;

    /// Open the connection. Fails with `SendError::Unauthorized` when the
    /// stored session cannot act for the account.
    async fn connect(&mut self) -> Result<(), SendError>;

    /// Send `text` (with an optional attachment) to a provider handle.
    async fn send_message(
        &self,
        target: &str,
        text: &str,
        attachment: Option<&Path>,
    ) -> Result<(), SendError>;

    /// Release the connection. Must be safe to call after a failed connect.
    async fn disconnect(&mut self) -> Result<(), SendError>;
}

/// Builds channels for accounts and owns whatever per-account state they share.
pub trait ChannelFactory: Send + Sync {
    /// Build a fresh, not yet connected channel for `account`.
    fn open(&self, account: &Account) -> Result<Box<dyn SendChannel>, SendError>;

    /// Drop any cached credentials for `account` (called after an
    /// authorization failure so the next attempt re-reads the session).
    fn invalidate(&self, account: &Account);
}
