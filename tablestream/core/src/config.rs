//! Client Configuration
//!
//! Configuration is layered: built-in defaults, then an optional TOML file,
//! then [`ConfigOverrides`] (environment first, command line last).
//!
//! # File Format
//!
//! ```toml
//! [api]
//! base_url = "https://api.example.com/v1"
//! api_key = "pk_live_..."
//! platform = "ios"
//!
//! [stream]
//! streaming_enabled = true
//! polling_interval_ms = 30000
//! reconnect_base_delay_ms = 3000
//! max_reconnect_attempts = 5
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration loading errors
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// The config file exists but could not be read
    #[error("Failed to read config {path}: {message}")]
    Io {
        /// File that failed to load
        path: PathBuf,
        /// Underlying I/O error
        message: String,
    },

    /// The file is not valid TOML for [`ClientConfig`]
    #[error("Failed to parse config: {0}")]
    Parse(String),

    /// A value is out of range
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

// ============================================================================
// Stream Configuration
// ============================================================================

/// Tuning for one subscription's streaming/polling behavior
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Open a live stream after the initial fetch
    ///
    /// Callers usually gate this on the user being signed in.
    pub streaming_enabled: bool,

    /// Allow the fallback poller to run
    pub polling_enabled: bool,

    /// Poll period in milliseconds
    pub polling_interval_ms: u64,

    /// First retry delay; doubled for every further attempt
    pub reconnect_base_delay_ms: u64,

    /// Retries before streaming is given up (0 = never retry)
    pub max_reconnect_attempts: u32,

    /// Maximum lifetime of one stream connection
    pub connection_timeout_ms: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            streaming_enabled: true,
            polling_enabled: true,
            polling_interval_ms: 30_000,
            reconnect_base_delay_ms: 3_000,
            max_reconnect_attempts: 5,
            connection_timeout_ms: 3_600_000, // 1 hour
        }
    }
}

impl StreamConfig {
    /// Polling-only configuration (anonymous users)
    #[must_use]
    pub fn polling_only() -> Self {
        Self {
            streaming_enabled: false,
            ..Default::default()
        }
    }

    /// Poll period
    #[must_use]
    pub fn polling_interval(&self) -> Duration {
        Duration::from_millis(self.polling_interval_ms)
    }

    /// Base retry delay
    #[must_use]
    pub fn reconnect_base_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_delay_ms)
    }

    /// Connection lifetime
    #[must_use]
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    /// Reject values that would spin or never fire
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.polling_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "polling_interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.reconnect_base_delay_ms == 0 {
            return Err(ConfigError::Invalid(
                "reconnect_base_delay_ms must be greater than 0".to_string(),
            ));
        }
        if self.connection_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "connection_timeout_ms must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// API Configuration
// ============================================================================

/// Where and how to reach the availability API
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Base URL, without trailing slash
    pub base_url: String,
    /// API key sent as `X-API-Key`
    pub api_key: String,
    /// Client platform sent as `X-Client-Platform`
    pub platform: String,
    /// Client version sent as `X-App-Version`
    pub app_version: String,
    /// Timeout for plain request/response calls
    pub request_timeout_ms: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080/api".to_string(),
            api_key: String::new(),
            platform: "cli".to_string(),
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            request_timeout_ms: 15_000,
        }
    }
}

impl ApiConfig {
    /// Request timeout
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Base URL with any trailing slash removed
    #[must_use]
    pub fn normalized_base_url(&self) -> &str {
        self.base_url.trim_end_matches('/')
    }

    /// Reject obviously unusable endpoints
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.base_url.starts_with("http://") || self.base_url.starts_with("https://")) {
            return Err(ConfigError::Invalid(format!(
                "base_url must be an http(s) URL, got {:?}",
                self.base_url
            )));
        }
        Ok(())
    }
}

/// Top-level client configuration file
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// API endpoint settings
    pub api: ApiConfig,
    /// Streaming behavior
    pub stream: StreamConfig,
}

impl ClientConfig {
    /// Parse from TOML text
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Validate both sections
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.api.validate()?;
        self.stream.validate()
    }
}

// ============================================================================
// Loading
// ============================================================================

/// Where the configuration came from
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConfigSource {
    /// No file found, built-in defaults
    Default,
    /// Loaded from this file
    File(PathBuf),
}

/// Default config path: `$XDG_CONFIG_HOME/tablestream/config.toml`
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("tablestream").join("config.toml"))
}

/// Load from the default path, falling back to defaults if it is absent
pub fn load_config() -> Result<(ClientConfig, ConfigSource), ConfigError> {
    match default_config_path() {
        Some(path) if path.exists() => load_config_from_path(&path),
        _ => Ok((ClientConfig::default(), ConfigSource::Default)),
    }
}

/// Load from an explicit path
pub fn load_config_from_path(path: &Path) -> Result<(ClientConfig, ConfigSource), ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    let config = ClientConfig::from_toml(&text)?;
    tracing::debug!(path = ?path, "Loaded configuration");
    Ok((config, ConfigSource::File(path.to_path_buf())))
}

/// Values that take precedence over the file
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConfigOverrides {
    /// API base URL
    pub base_url: Option<String>,
    /// API key
    pub api_key: Option<String>,
    /// Client platform
    pub platform: Option<String>,
    /// Streaming on/off
    pub streaming_enabled: Option<bool>,
    /// Polling on/off
    pub polling_enabled: Option<bool>,
    /// Poll period (ms)
    pub polling_interval_ms: Option<u64>,
    /// Base retry delay (ms)
    pub reconnect_base_delay_ms: Option<u64>,
    /// Retry budget
    pub max_reconnect_attempts: Option<u32>,
}

fn env_flag(name: &str) -> Option<bool> {
    std::env::var(name)
        .ok()
        .map(|v| v != "0" && v.to_lowercase() != "false")
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

impl ConfigOverrides {
    /// Read overrides from environment variables
    ///
    /// - `TABLESTREAM_API_URL`, `TABLESTREAM_API_KEY`, `TABLESTREAM_PLATFORM`
    /// - `TABLESTREAM_STREAMING`, `TABLESTREAM_POLLING`: "0"/"false" to disable
    /// - `TABLESTREAM_POLL_INTERVAL`, `TABLESTREAM_RECONNECT_DELAY`: milliseconds
    /// - `TABLESTREAM_RECONNECT_ATTEMPTS`: retry budget
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            base_url: std::env::var("TABLESTREAM_API_URL").ok(),
            api_key: std::env::var("TABLESTREAM_API_KEY").ok(),
            platform: std::env::var("TABLESTREAM_PLATFORM").ok(),
            streaming_enabled: env_flag("TABLESTREAM_STREAMING"),
            polling_enabled: env_flag("TABLESTREAM_POLLING"),
            polling_interval_ms: env_parse("TABLESTREAM_POLL_INTERVAL"),
            reconnect_base_delay_ms: env_parse("TABLESTREAM_RECONNECT_DELAY"),
            max_reconnect_attempts: env_parse("TABLESTREAM_RECONNECT_ATTEMPTS"),
        }
    }

    /// Layer `other` on top of `self` (values in `other` win)
    #[must_use]
    pub fn merge(self, other: Self) -> Self {
        Self {
            base_url: other.base_url.or(self.base_url),
            api_key: other.api_key.or(self.api_key),
            platform: other.platform.or(self.platform),
            streaming_enabled: other.streaming_enabled.or(self.streaming_enabled),
            polling_enabled: other.polling_enabled.or(self.polling_enabled),
            polling_interval_ms: other.polling_interval_ms.or(self.polling_interval_ms),
            reconnect_base_delay_ms: other
                .reconnect_base_delay_ms
                .or(self.reconnect_base_delay_ms),
            max_reconnect_attempts: other
                .max_reconnect_attempts
                .or(self.max_reconnect_attempts),
        }
    }

    /// Apply to a loaded configuration
    pub fn apply(&self, config: &mut ClientConfig) {
        if let Some(ref url) = self.base_url {
            config.api.base_url.clone_from(url);
        }
        if let Some(ref key) = self.api_key {
            config.api.api_key.clone_from(key);
        }
        if let Some(ref platform) = self.platform {
            config.api.platform.clone_from(platform);
        }
        if let Some(v) = self.streaming_enabled {
            config.stream.streaming_enabled = v;
        }
        if let Some(v) = self.polling_enabled {
            config.stream.polling_enabled = v;
        }
        if let Some(v) = self.polling_interval_ms {
            config.stream.polling_interval_ms = v;
        }
        if let Some(v) = self.reconnect_base_delay_ms {
            config.stream.reconnect_base_delay_ms = v;
        }
        if let Some(v) = self.max_reconnect_attempts {
            config.stream.max_reconnect_attempts = v;
        }
    }
}
