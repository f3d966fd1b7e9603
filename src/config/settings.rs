//! Application settings for the panel connection and backup schedule.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Telegram identity used by the presentation layer.
///
/// The core never talks to Telegram itself; these values are carried so the
/// presentation layer and the config file keep a single source of truth.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    /// Bot token in the `NUMERIC_ID:TOKEN` format.
    pub bot_token: String,

    /// Chat ID that is allowed to issue commands.
    pub admin_chat_id: i64,
}

/// Connection settings for the remote Marzban panel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PanelConfig {
    /// Base URL of the panel, e.g. `https://panel.example.com`.
    pub base_url: String,

    /// Panel sudo admin username.
    pub username: String,

    /// Panel sudo admin password.
    pub password: String,

    /// Request timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Assumed bearer token lifetime in seconds.
    ///
    /// The panel does not report token expiry, so the client refreshes
    /// proactively after this long. Conservative by default.
    #[serde(default = "default_token_ttl_secs")]
    pub token_ttl_secs: u64,
}

fn default_timeout_secs() -> u64 {
    10
}

fn default_token_ttl_secs() -> u64 {
    3600
}

/// Retry behaviour for transient panel failures.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the first).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Base delay before the first retry, in seconds.
    #[serde(default = "default_base_delay_secs")]
    pub base_delay_secs: u64,

    /// Multiplier applied to the delay after each failed attempt.
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: u32,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay_secs() -> u64 {
    1
}

fn default_backoff_factor() -> u32 {
    2
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_secs: default_base_delay_secs(),
            backoff_factor: default_backoff_factor(),
        }
    }
}

impl RetryPolicy {
    /// Returns the delay to sleep before retrying after `failed_attempts`
    /// attempts have already failed.
    #[must_use]
    pub fn delay_for(&self, failed_attempts: u32) -> Duration {
        let exponent = failed_attempts.saturating_sub(1);
        let factor = u64::from(self.backoff_factor.max(1)).saturating_pow(exponent);
        Duration::from_secs(self.base_delay_secs.saturating_mul(factor))
    }
}

/// Top-level application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Telegram identity for the presentation layer.
    pub telegram: TelegramConfig,

    /// Panel connection settings.
    pub panel: PanelConfig,

    /// Path to the local SQLite mirror.
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    /// Directory that receives backup archives.
    #[serde(default = "default_backup_dir")]
    pub backup_dir: PathBuf,

    /// Minutes between scheduled backup runs.
    #[serde(default = "default_backup_interval_mins")]
    pub backup_interval_mins: u64,

    /// How many archives to keep; older ones are pruned.
    #[serde(default = "default_retention_count")]
    pub retention_count: usize,

    /// Minutes between reconciliation passes.
    #[serde(default = "default_sync_interval_mins")]
    pub sync_interval_mins: u64,

    /// Retry policy for panel calls.
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Prefix that marks operator commands, e.g. "`/panel`".
    #[serde(default = "default_command_prefix")]
    pub command_prefix: String,

    /// Log level for the application.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_database_path() -> PathBuf {
    PathBuf::from("marzban_control.db")
}

fn default_backup_dir() -> PathBuf {
    PathBuf::from("backups")
}

fn default_backup_interval_mins() -> u64 {
    60
}

fn default_retention_count() -> usize {
    30
}

fn default_sync_interval_mins() -> u64 {
    5
}

fn default_command_prefix() -> String {
    "/panel".to_owned()
}

fn default_log_level() -> String {
    "info".to_owned()
}

impl Settings {
    /// Loads settings from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io {
            path: path.as_ref().to_path_buf(),
            source: e,
        })?;
        let settings: Self = serde_json::from_str(&content)?;
        Ok(settings)
    }

    /// Saves settings to a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(&path, content).map_err(|e| ConfigError::Io {
            path: path.as_ref().to_path_buf(),
            source: e,
        })
    }

    /// Applies environment variable overrides for the secrets.
    ///
    /// Recognized variables: `PANEL_BASE_URL`, `PANEL_USERNAME`,
    /// `PANEL_PASSWORD`, `BOT_TOKEN`, `ADMIN_CHAT_ID`.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("PANEL_BASE_URL") {
            self.panel.base_url = url;
        }
        if let Ok(user) = std::env::var("PANEL_USERNAME") {
            self.panel.username = user;
        }
        if let Ok(pass) = std::env::var("PANEL_PASSWORD") {
            self.panel.password = pass;
        }
        if let Ok(token) = std::env::var("BOT_TOKEN") {
            self.telegram.bot_token = token;
        }
        if let Ok(chat) = std::env::var("ADMIN_CHAT_ID")
            && let Ok(id) = chat.parse()
        {
            self.telegram.admin_chat_id = id;
        }
    }

    /// Validates that the settings are usable.
    ///
    /// # Errors
    ///
    /// Returns the first validation problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.panel.base_url.is_empty() {
            return Err(ConfigError::MissingField("panel.base_url"));
        }
        if self.panel.username.is_empty() {
            return Err(ConfigError::MissingField("panel.username"));
        }
        if self.panel.password.is_empty() {
            return Err(ConfigError::MissingField("panel.password"));
        }
        if self.backup_interval_mins == 0 {
            return Err(ConfigError::InvalidValue {
                field: "backup_interval_mins",
                reason: "must be greater than zero",
            });
        }
        if self.sync_interval_mins == 0 {
            return Err(ConfigError::InvalidValue {
                field: "sync_interval_mins",
                reason: "must be greater than zero",
            });
        }
        if self.retention_count == 0 {
            return Err(ConfigError::InvalidValue {
                field: "retention_count",
                reason: "must keep at least one archive",
            });
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                field: "retry.max_attempts",
                reason: "must allow at least one attempt",
            });
        }
        Ok(())
    }

    /// Returns the panel base URL without a trailing slash.
    #[must_use]
    pub fn panel_base_url(&self) -> &str {
        self.panel.base_url.trim_end_matches('/')
    }

    /// Creates an example configuration for operators to fill in.
    #[must_use]
    pub fn example() -> Self {
        Self {
            telegram: TelegramConfig {
                bot_token: "123456:YOUR_BOT_TOKEN".to_owned(),
                admin_chat_id: 0,
            },
            panel: PanelConfig {
                base_url: "https://panel.example.com".to_owned(),
                username: "admin".to_owned(),
                password: "change-me".to_owned(),
                timeout_secs: default_timeout_secs(),
                token_ttl_secs: default_token_ttl_secs(),
            },
            database_path: default_database_path(),
            backup_dir: default_backup_dir(),
            backup_interval_mins: default_backup_interval_mins(),
            retention_count: default_retention_count(),
            sync_interval_mins: default_sync_interval_mins(),
            retry: RetryPolicy::default(),
            command_prefix: default_command_prefix(),
            log_level: default_log_level(),
        }
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to access configuration file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Missing required configuration field: {0}")]
    MissingField(&'static str),

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue {
        field: &'static str,
        reason: &'static str,
    },
}
