//! Courier configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{CourierError, Result};

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CourierConfig {
    /// Directory holding account session files.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub alerts: AlertConfig,
}

fn default_data_dir() -> String { "~/.courier/data".into() }

impl Default for CourierConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            database: DatabaseConfig::default(),
            dispatch: DispatchConfig::default(),
            telegram: TelegramConfig::default(),
            alerts: AlertConfig::default(),
        }
    }
}

impl CourierConfig {
    /// Load config from the default path (~/.courier/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        let mut config = if path.exists() {
            Self::load_from(&path)?
        } else {
            Self::default()
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| CourierError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| CourierError::Config(format!("Failed to parse config: {e}")))?;
        Ok(config)
    }

    /// Save config to a path.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| CourierError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Overlay values from the environment. `lookup` is `std::env::var` in
    /// production.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup("COURIER_DATA_DIR") {
            self.data_dir = dir;
        }
        if let Some(db) = lookup("COURIER_DATABASE") {
            self.database.path = db;
        }
        if let Some(token) = lookup("TELEGRAM_BOT_TOKEN") {
            self.alerts.bot_token = token;
        }
        if let Some(chat_id) = lookup("TELEGRAM_DEV_CHAT_ID") {
            self.alerts.chat_id = chat_id;
        }
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the Courier home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".courier")
    }

    /// Data directory with `~` expanded.
    pub fn data_dir(&self) -> PathBuf {
        expand(&self.data_dir)
    }

    /// Database path with `~` expanded.
    pub fn database_path(&self) -> PathBuf {
        expand(&self.database.path)
    }
}

fn expand(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).into_owned())
}

/// Durable store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

fn default_db_path() -> String { "~/.courier/courier.db".into() }

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { path: default_db_path() }
    }
}

/// Retry policy and worker pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Generic-failure retries before a message is left FAILED.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base of the exponential backoff: `base * 2^attempt`.
    #[serde(default = "default_backoff_base")]
    pub backoff_base_secs: u64,
    /// Added on top of a provider flood wait.
    #[serde(default = "default_flood_margin")]
    pub flood_wait_margin_secs: u64,
    /// Concurrent send loops (across different messages).
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// How often the daemon adopts jobs persisted by other processes.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

fn default_max_retries() -> u32 { 5 }
fn default_backoff_base() -> u64 { 60 }
fn default_flood_margin() -> u64 { 5 }
fn default_workers() -> usize { 4 }
fn default_sweep_interval() -> u64 { 30 }

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_base_secs: default_backoff_base(),
            flood_wait_margin_secs: default_flood_margin(),
            workers: default_workers(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

/// Telegram provider settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_api_base() -> String { "https://api.telegram.org".into() }
fn default_request_timeout() -> u64 { 30 }

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            api_base: default_api_base(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

/// Developer alert chat for error-level log events.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AlertConfig {
    #[serde(default)]
    pub bot_token: String,
    #[serde(default)]
    pub chat_id: String,
}

impl AlertConfig {
    pub fn is_configured(&self) -> bool {
        !self.bot_token.is_empty() && !self.chat_id.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CourierConfig::default();
        assert_eq!(config.dispatch.max_retries, 5);
        assert_eq!(config.dispatch.backoff_base_secs, 60);
        assert_eq!(config.dispatch.flood_wait_margin_secs, 5);
        assert_eq!(config.telegram.api_base, "https://api.telegram.org");
        assert!(!config.alerts.is_configured());
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            data_dir = "/srv/courier"

            [dispatch]
            max_retries = 3
            workers = 8

            [alerts]
            bot_token = "123:abc"
            chat_id = "-100200"
        "#;

        let config: CourierConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.data_dir(), PathBuf::from("/srv/courier"));
        assert_eq!(config.dispatch.max_retries, 3);
        assert_eq!(config.dispatch.workers, 8);
        assert_eq!(config.dispatch.backoff_base_secs, 60);
        assert!(config.alerts.is_configured());
    }

    #[test]
    fn test_config_missing_fields_use_defaults() {
        let config: CourierConfig = toml::from_str("").unwrap();
        assert_eq!(config.dispatch.sweep_interval_secs, 30);
        assert_eq!(config.database.path, "~/.courier/courier.db");
    }

    #[test]
    fn test_env_overrides() {
        let mut config = CourierConfig::default();
        config.apply_env(|key| match key {
            "TELEGRAM_BOT_TOKEN" => Some("42:xyz".into()),
            "TELEGRAM_DEV_CHAT_ID" => Some("777".into()),
            _ => None,
        });
        assert_eq!(config.alerts.bot_token, "42:xyz");
        assert_eq!(config.alerts.chat_id, "777");
        assert_eq!(config.data_dir, default_data_dir());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = std::env::temp_dir().join("courier-config-test");
        let path = dir.join("config.toml");
        let mut config = CourierConfig::default();
        config.dispatch.workers = 2;
        config.save_to(&path).unwrap();

        let loaded = CourierConfig::load_from(&path).unwrap();
        assert_eq!(loaded.dispatch.workers, 2);
        std::fs::remove_dir_all(&dir).ok();
    }
}
