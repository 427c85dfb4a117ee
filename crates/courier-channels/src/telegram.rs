//! Telegram send adapter — Bot API over HTTPS.
//!
//! Maps provider responses onto the send taxonomy:
//! 429 (`retry_after`) → `FloodWait`, 401 → `Unauthorized`, transport and
//! 5xx failures → `Disconnected`, anything else → `Rejected`.

use async_trait::async_trait;
use courier_core::config::TelegramConfig;
use courier_core::error::SendError;
use courier_core::traits::{Account, ChannelFactory, SendChannel};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::session::SessionCache;

/// Connection to the Bot API for one account.
pub struct TelegramChannel {
    api_base: String,
    bot_token: String,
    client: reqwest::Client,
    me: Option<TelegramUser>,
}

impl TelegramChannel {
    pub fn new(api_base: &str, bot_token: &str, client: reqwest::Client) -> Self {
        Self {
            api_base: api_base.trim_end_matches('/').to_string(),
            bot_token: bot_token.to_string(),
            client,
            me: None,
        }
    }

    fn api_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_base, self.bot_token, method)
    }

    async fn read_response(
        response: reqwest::Response,
    ) -> Result<(u16, TelegramApiResponse<serde_json::Value>), SendError> {
        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());
        let text = response
            .text()
            .await
            .map_err(|e| SendError::Disconnected(format!("Telegram response unreadable: {e}")))?;
        Ok((status, decode_body(status, &text, retry_after)?))
    }
}

/// Parse a Bot API body. Error pages that are not JSON (proxies, gateways)
/// keep their HTTP status so `classify` still sees 401 or 429.
fn decode_body(
    status: u16,
    text: &str,
    retry_after: Option<u64>,
) -> Result<TelegramApiResponse<serde_json::Value>, SendError> {
    match serde_json::from_str(text) {
        Ok(body) => Ok(body),
        Err(e) if (200..300).contains(&status) => {
            Err(SendError::Disconnected(format!("Invalid Telegram response: {e}")))
        }
        Err(_) => {
            let snippet: String = text.trim().chars().take(120).collect();
            Ok(TelegramApiResponse {
                ok: false,
                result: None,
                description: Some(format!("HTTP {status}: {snippet}")),
                error_code: None,
                parameters: Some(ResponseParameters {
                    retry_after,
                    migrate_to_chat_id: None,
                }),
            })
        }
    }
}

#[async_trait]
impl SendChannel for TelegramChannel {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn connect(&mut self) -> Result<(), SendError> {
        let response = self
            .client
            .get(self.api_url("getMe"))
            .send()
            .await
            .map_err(|e| SendError::Disconnected(format!("Telegram getMe failed: {e}")))?;
        let (status, body) = Self::read_response(response).await?;

        // A bad token comes back as 401 (or 404 for a malformed one).
        if status == 401 || status == 404 {
            return Err(SendError::Unauthorized(format!(
                "Telegram rejected the session: {}",
                body.description.unwrap_or_default()
            )));
        }
        classify(status, &body)?;

        let me: TelegramUser = body
            .result
            .and_then(|v| serde_json::from_value(v).ok())
            .ok_or_else(|| SendError::Unauthorized("getMe returned no identity".into()))?;
        tracing::info!(
            "Telegram session: @{} ({})",
            me.username.as_deref().unwrap_or("unknown"),
            me.first_name
        );
        self.me = Some(me);
        Ok(())
    }

    async fn send_message(
        &self,
        target: &str,
        text: &str,
        attachment: Option<&Path>,
    ) -> Result<(), SendError> {
        if self.me.is_none() {
            return Err(SendError::Disconnected("channel not connected".into()));
        }
        let chat_id = resolve_chat_id(target)?;

        let request = match attachment {
            Some(path) => {
                let bytes = tokio::fs::read(path).await.map_err(|e| {
                    SendError::Rejected(format!("attachment {} unreadable: {e}", path.display()))
                })?;
                let file_name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "attachment".into());
                let form = reqwest::multipart::Form::new()
                    .text("chat_id", chat_id_text(&chat_id))
                    .text("caption", text.to_string())
                    .part("document", reqwest::multipart::Part::bytes(bytes).file_name(file_name));
                self.client.post(self.api_url("sendDocument")).multipart(form)
            }
            None => self.client.post(self.api_url("sendMessage")).json(&serde_json::json!({
                "chat_id": chat_id,
                "text": text,
            })),
        };

        let response = request
            .send()
            .await
            .map_err(|e| SendError::Disconnected(format!("Telegram send failed: {e}")))?;
        let (status, body) = Self::read_response(response).await?;

        match classify(status, &body) {
            Err(SendError::FloodWait { seconds }) => {
                tracing::warn!("FloodWait from Telegram: need to sleep {seconds} seconds");
                Err(SendError::FloodWait { seconds })
            }
            Err(e) => {
                tracing::error!("Failed to send to {target}: {e}");
                Err(e)
            }
            Ok(()) => Ok(()),
        }
    }

    async fn disconnect(&mut self) -> Result<(), SendError> {
        self.me = None;
        Ok(())
    }
}

/// Turn a recipient handle into a Bot API `chat_id`.
///
/// Accepts `@username` and numeric chat ids. Phone numbers cannot be
/// addressed through the Bot API.
pub fn resolve_chat_id(handle: &str) -> Result<serde_json::Value, SendError> {
    let handle = handle.trim();
    if let Some(name) = handle.strip_prefix('@') {
        if name.is_empty() {
            return Err(SendError::Rejected("empty username".into()));
        }
        return Ok(serde_json::Value::String(handle.to_string()));
    }
    if let Ok(id) = handle.parse::<i64>() {
        return Ok(serde_json::json!(id));
    }
    Err(SendError::Rejected(format!(
        "handle '{handle}' is neither @username nor a numeric chat id"
    )))
}

fn chat_id_text(chat_id: &serde_json::Value) -> String {
    match chat_id {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Classify an API response.
pub fn classify(status: u16, body: &TelegramApiResponse<serde_json::Value>) -> Result<(), SendError> {
    if body.ok && (200..300).contains(&status) {
        return Ok(());
    }
    let code = body.error_code.unwrap_or(status as i64);
    let description = body.description.clone().unwrap_or_else(|| format!("HTTP {status}"));

    if code == 429 {
        let seconds = body
            .parameters
            .as_ref()
            .and_then(|p| p.retry_after)
            .unwrap_or(1);
        return Err(SendError::FloodWait { seconds });
    }
    if code == 401 {
        return Err(SendError::Unauthorized(description));
    }
    if code >= 500 {
        return Err(SendError::Disconnected(description));
    }
    Err(SendError::Rejected(description))
}

/// Builds Telegram channels from account sessions.
pub struct TelegramChannelFactory {
    config: TelegramConfig,
    sessions: SessionCache,
    client: reqwest::Client,
}

impl TelegramChannelFactory {
    pub fn new(config: TelegramConfig, data_dir: impl Into<PathBuf>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .unwrap_or_default();
        Self {
            config,
            sessions: SessionCache::new(data_dir),
            client,
        }
    }
}

impl ChannelFactory for TelegramChannelFactory {
    fn open(&self, account: &Account) -> Result<Box<dyn SendChannel>, SendError> {
        if !account.is_active {
            return Err(SendError::Unauthorized(format!(
                "account {} is disabled",
                account.name
            )));
        }
        let session = self.sessions.get(account)?;
        Ok(Box::new(TelegramChannel::new(
            &self.config.api_base,
            &session.bot_token,
            self.client.clone(),
        )))
    }

    fn invalidate(&self, account: &Account) {
        if self.sessions.invalidate(account.id) {
            tracing::info!("Session cache invalidated for account {}", account.name);
        }
    }
}

// --- Telegram API Types ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramApiResponse<T> {
    pub ok: bool,
    pub result: Option<T>,
    pub description: Option<String>,
    pub error_code: Option<i64>,
    pub parameters: Option<ResponseParameters>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseParameters {
    pub retry_after: Option<u64>,
    pub migrate_to_chat_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramUser {
    pub id: i64,
    pub is_bot: bool,
    pub first_name: String,
    pub username: Option<String>,
}
