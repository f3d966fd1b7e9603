//! Configuration loading and validation.
//!
//! Settings are loaded from a JSON file (historically `config.json` next to
//! the binary) with environment variable overrides for the secrets.

mod settings;

pub use settings::{ConfigError, PanelConfig, RetryPolicy, Settings, TelegramConfig};
