//! Developer alerts — error-level events pushed to a Telegram chat.

use courier_core::config::AlertConfig;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};

use crate::message::{LogEntry, LogLevel};

/// Sends log events to a developer chat through the Bot API.
#[derive(Clone)]
pub struct DevAlert {
    api_base: String,
    bot_token: String,
    chat_id: String,
    client: reqwest::Client,
}

impl DevAlert {
    /// `None` unless both token and chat id are configured.
    pub fn from_config(config: &AlertConfig, api_base: &str) -> Option<Self> {
        if !config.is_configured() {
            return None;
        }
        Some(Self {
            api_base: api_base.trim_end_matches('/').to_string(),
            bot_token: config.bot_token.clone(),
            chat_id: config.chat_id.clone(),
            client: reqwest::Client::new(),
        })
    }

    pub async fn send(&self, entry: &LogEntry) -> Result<(), String> {
        let url = format!("{}/bot{}/sendMessage", self.api_base, self.bot_token);
        let resp = self
            .client
            .post(&url)
            .json(&serde_json::json!({
                "chat_id": self.chat_id,
                "text": format_alert(entry),
                "parse_mode": "Markdown"
            }))
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| format!("Telegram alert failed: {e}"))?;

        if resp.status().is_success() {
            Ok(())
        } else {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            Err(format!("Telegram API error {status}: {body}"))
        }
    }
}

impl DevAlert {
    /// Push every error-level event from a sink's live feed until the sink
    /// is dropped. Delivery failures are logged and skipped.
    pub async fn forward(self, mut events: broadcast::Receiver<LogEntry>) {
        loop {
            match events.recv().await {
                Ok(entry) if entry.level == LogLevel::Error => {
                    if let Err(e) = self.send(&entry).await {
                        tracing::warn!("Developer alert not delivered: {e}");
                    }
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("Developer alerts fell behind, {skipped} event(s) skipped");
                }
                Err(RecvError::Closed) => break,
            }
        }
        tracing::debug!("Developer alert forwarder stopped");
    }
}

fn format_alert(entry: &LogEntry) -> String {
    let emoji = match entry.level {
        LogLevel::Error => "🚨",
        LogLevel::Warning => "⚠️",
        LogLevel::Info => "📢",
        LogLevel::Debug => "ℹ️",
    };
    format!(
        "{} *Courier {}*\n\n{}\n\n_Source: {} • {}_",
        emoji,
        entry.level.as_str(),
        escape_markdown(&entry.message),
        escape_markdown(&entry.source),
        entry.created_at.format("%Y-%m-%d %H:%M:%S UTC")
    )
}

fn escape_markdown(s: &str) -> String {
    s.replace('_', "\\_")
        .replace('*', "\\*")
        .replace('[', "\\[")
        .replace('`', "\\`")
}
