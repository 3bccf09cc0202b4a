//! Configuration loader and validator for the campaign dispatch service.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub delivery: Delivery,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    /// Pause between consecutive send batches, in milliseconds.
    pub batch_delay_ms: u64,
}

/// Delivery provider settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Delivery {
    pub api_url: String,
    pub api_key: String,
    pub sender_email: String,
    pub sender_name: String,
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }

    if cfg.delivery.api_url.trim().is_empty() {
        return Err(ConfigError::Invalid("delivery.api_url must be non-empty"));
    }
    if cfg.delivery.api_key.trim().is_empty() {
        return Err(ConfigError::Invalid("delivery.api_key must be non-empty"));
    }
    if cfg.delivery.sender_email.trim().is_empty() {
        return Err(ConfigError::Invalid(
            "delivery.sender_email must be non-empty",
        ));
    }
    if !cfg.delivery.sender_email.contains('@') {
        return Err(ConfigError::Invalid(
            "delivery.sender_email must be an email address",
        ));
    }
    if cfg.delivery.sender_name.trim().is_empty() {
        return Err(ConfigError::Invalid(
            "delivery.sender_name must be non-empty",
        ));
    }

    Ok(())
}

/// Example YAML document, also used by the config tests.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  batch_delay_ms: 1000

delivery:
  api_url: "https://api.sendgrid.com"
  api_key: "YOUR_SENDGRID_API_KEY"
  sender_email: "no-reply@example.com"
  sender_name: "Mass Mailer"
"#
}
