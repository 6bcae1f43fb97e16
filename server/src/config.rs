//! Server configuration module.
//!
//! Parses configuration from environment variables for the Boardwatch server.
//!
//! # Environment Variables
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `BOARDWATCH_JIRA_URL` | Yes | - | Base URL of the Jira site |
//! | `BOARDWATCH_JIRA_EMAIL` | Yes | - | Jira API user |
//! | `BOARDWATCH_JIRA_API_TOKEN` | Yes | - | Jira API token |
//! | `BOARDWATCH_WEBHOOK_TOKEN` | No | - | Shared secret expected as `?token=` on `/webhook` |
//! | `BOARDWATCH_CACHE_DURATION_SECS` | No | 21600 | Interval between membership refreshes |
//! | `BOARDWATCH_DATA_DIR` | No | `./data` | Directory holding the space store |
//! | `BOARDWATCH_CUSTOM_FIELDS` | No | - | Format: `customfield_1:Label,customfield_2:Label` |
//! | `PORT` | No | 8080 | HTTP server port |

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use tracing::warn;

use crate::refresh::DEFAULT_CACHE_DURATION;

/// Default HTTP server port.
const DEFAULT_PORT: u16 = 8080;

/// Default directory for persisted space configuration.
const DEFAULT_DATA_DIR: &str = "./data";

/// Errors that can occur when parsing configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),

    /// Environment variable has invalid format.
    #[error("invalid format for {var}: {message}")]
    InvalidFormat { var: String, message: String },

    /// Port number is invalid.
    #[error("invalid port number: {0}")]
    InvalidPort(#[from] std::num::ParseIntError),

    /// Configuration validation failed.
    #[error("configuration validation failed: {0}")]
    ValidationError(String),
}

/// A Jira custom field whose value is appended to notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomField {
    /// Field id as it appears in the issue payload (e.g. `customfield_10010`).
    pub id: String,

    /// Label shown in front of the value.
    pub label: String,
}

/// Server configuration parsed from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the Jira site, without trailing slash.
    pub jira_url: String,

    /// Jira API user.
    pub jira_email: String,

    /// Jira API token.
    pub jira_api_token: String,

    /// Shared secret for the webhook endpoint. `None` accepts any caller.
    pub webhook_token: Option<String>,

    /// Interval between background membership refreshes.
    pub cache_duration: Duration,

    /// Directory holding the space store.
    pub data_dir: PathBuf,

    /// Custom fields annotated onto notifications, in display order.
    pub custom_fields: Vec<CustomField>,

    /// HTTP server port.
    pub port: u16,
}

impl Config {
    /// Parse configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if:
    /// - Jira credentials are missing
    /// - Environment variables have invalid format
    /// - Port number is not a valid u16
    /// - The cache duration is zero
    ///
    /// # Example
    ///
    /// ```no_run
    /// use boardwatch_server::config::Config;
    ///
    /// let config = Config::from_env().expect("Failed to load config");
    /// println!("Server will listen on port {}", config.port);
    /// ```
    pub fn from_env() -> Result<Self, ConfigError> {
        let jira_url = required_var("BOARDWATCH_JIRA_URL")?
            .trim_end_matches('/')
            .to_string();
        let jira_email = required_var("BOARDWATCH_JIRA_EMAIL")?;
        let jira_api_token = required_var("BOARDWATCH_JIRA_API_TOKEN")?;
        let webhook_token = env::var("BOARDWATCH_WEBHOOK_TOKEN")
            .ok()
            .filter(|token| !token.is_empty());
        let cache_duration = parse_cache_duration()?;
        let data_dir = env::var("BOARDWATCH_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_DATA_DIR));
        let custom_fields = parse_custom_fields()?;
        let port = parse_port()?;

        let config = Self {
            jira_url,
            jira_email,
            jira_api_token,
            webhook_token,
            cache_duration,
            data_dir,
            custom_fields,
            port,
        };

        config.validate()?;

        if config.webhook_token.is_none() {
            warn!(
                "BOARDWATCH_WEBHOOK_TOKEN is not set - the webhook endpoint accepts \
                 payloads from anyone"
            );
        }

        Ok(config)
    }

    /// Validate the configuration.
    fn validate(&self) -> Result<(), ConfigError> {
        if !self.jira_url.starts_with("http://") && !self.jira_url.starts_with("https://") {
            return Err(ConfigError::InvalidFormat {
                var: "BOARDWATCH_JIRA_URL".to_string(),
                message: format!("expected an http(s) URL, got '{}'", self.jira_url),
            });
        }

        if self.cache_duration.is_zero() {
            return Err(ConfigError::ValidationError(
                "BOARDWATCH_CACHE_DURATION_SECS must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }
}

/// Read a required, non-empty environment variable.
fn required_var(name: &str) -> Result<String, ConfigError> {
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => Ok(value.trim().to_string()),
        _ => Err(ConfigError::MissingEnvVar(name.to_string())),
    }
}

/// Parse the PORT environment variable.
///
/// Returns the default port if not set.
fn parse_port() -> Result<u16, ConfigError> {
    match env::var("PORT") {
        Ok(port_str) => Ok(port_str.parse()?),
        Err(env::VarError::NotPresent) => Ok(DEFAULT_PORT),
        Err(env::VarError::NotUnicode(_)) => Err(ConfigError::InvalidFormat {
            var: "PORT".to_string(),
            message: "contains invalid unicode".to_string(),
        }),
    }
}

/// Parse the BOARDWATCH_CACHE_DURATION_SECS environment variable.
fn parse_cache_duration() -> Result<Duration, ConfigError> {
    match env::var("BOARDWATCH_CACHE_DURATION_SECS") {
        Ok(value) => value
            .trim()
            .parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|e| ConfigError::InvalidFormat {
                var: "BOARDWATCH_CACHE_DURATION_SECS".to_string(),
                message: e.to_string(),
            }),
        Err(_) => Ok(DEFAULT_CACHE_DURATION),
    }
}

/// Parse the BOARDWATCH_CUSTOM_FIELDS environment variable.
///
/// Expected format: `customfield_1:Label,customfield_2:Other label`
fn parse_custom_fields() -> Result<Vec<CustomField>, ConfigError> {
    let fields_str = match env::var("BOARDWATCH_CUSTOM_FIELDS") {
        Ok(s) if !s.is_empty() => s,
        _ => return Ok(Vec::new()),
    };

    let mut fields = Vec::new();

    for pair in fields_str.split(',') {
        let pair = pair.trim();
        if pair.is_empty() {
            continue;
        }

        let Some((id, label)) = pair.split_once(':') else {
            return Err(ConfigError::InvalidFormat {
                var: "BOARDWATCH_CUSTOM_FIELDS".to_string(),
                message: format!("expected 'field:label' format, got '{pair}'"),
            });
        };

        let id = id.trim();
        let label = label.trim();

        if id.is_empty() || label.is_empty() {
            return Err(ConfigError::InvalidFormat {
                var: "BOARDWATCH_CUSTOM_FIELDS".to_string(),
                message: format!("field id and label cannot be empty in '{pair}'"),
            });
        }

        fields.push(CustomField {
            id: id.to_string(),
            label: label.to_string(),
        });
    }

    Ok(fields)
}
