//! Account sessions — credential material read from `<data_dir>/<session_file>.session`.
//!
//! The file holds either JSON (`{"bot_token": "..."}`) or a bare token.
//! Loaded sessions are kept in an explicit per-account cache that the engine
//! invalidates after an authorization failure.

use courier_core::error::SendError;
use courier_core::traits::Account;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Credentials for one account.
#[derive(Clone, Serialize, Deserialize, PartialEq)]
pub struct Session {
    pub bot_token: String,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session").field("bot_token", &"<redacted>").finish()
    }
}

impl Session {
    /// Parse the contents of a session file.
    pub fn parse(content: &str) -> Result<Self, SendError> {
        let trimmed = content.trim();
        if trimmed.is_empty() {
            return Err(SendError::Unauthorized("session file is empty".into()));
        }
        let session = if trimmed.starts_with('{') {
            serde_json::from_str::<Session>(trimmed)
                .map_err(|e| SendError::Unauthorized(format!("invalid session file: {e}")))?
        } else {
            Session { bot_token: trimmed.to_string() }
        };
        if session.bot_token.trim().is_empty() {
            return Err(SendError::Unauthorized("session has no token".into()));
        }
        Ok(session)
    }

    /// Read the session for `account` from `data_dir`.
    pub fn load(account: &Account, data_dir: &Path) -> Result<Self, SendError> {
        let path = account.session_path(data_dir);
        let content = std::fs::read_to_string(&path).map_err(|e| {
            SendError::Unauthorized(format!("session {} unreadable: {e}", path.display()))
        })?;
        Self::parse(&content)
    }
}

/// Per-account session cache with explicit invalidation.
pub struct SessionCache {
    data_dir: PathBuf,
    entries: Mutex<HashMap<i64, Session>>,
}

impl SessionCache {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Return the cached session for `account`, loading it on a miss.
    /// Load failures are not cached.
    pub fn get(&self, account: &Account) -> Result<Session, SendError> {
        if let Ok(entries) = self.entries.lock()
            && let Some(session) = entries.get(&account.id)
        {
            return Ok(session.clone());
        }

        let session = Session::load(account, &self.data_dir)?;
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(account.id, session.clone());
        }
        tracing::debug!("Loaded session for account {} ({})", account.id, account.name);
        Ok(session)
    }

    /// Forget the cached session for `account`.
    pub fn invalidate(&self, account_id: i64) -> bool {
        self.entries
            .lock()
            .map(|mut entries| entries.remove(&account_id).is_some())
            .unwrap_or(false)
    }
}
