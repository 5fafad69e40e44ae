//! Error Types
//!
//! A single error taxonomy shared by every layer of the streaming client.
//! Errors are `Clone` so they can be handed to callbacks and channels as
//! well as returned.

use thiserror::Error;

use crate::config::ConfigError;

/// Errors produced by the availability streaming client
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum StreamError {
    /// The subscription key was rejected before any I/O happened
    #[error("Invalid subscription key: {0}")]
    InvalidKey(String),

    /// Stream settings were rejected before a subscription started
    #[error("Invalid stream configuration: {0}")]
    InvalidConfig(String),

    /// Transport-level failure (DNS, TCP, TLS, dropped body)
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// The server answered with a non-success status
    #[error("Server returned HTTP {status}: {message}")]
    HttpStatus {
        /// HTTP status code
        status: u16,
        /// Canonical reason or response body excerpt
        message: String,
    },

    /// The server rejected the access token
    #[error("Unauthorized: access token rejected")]
    Unauthorized,

    /// Token refresh failed; the user has to sign in again
    #[error("Session expired, please sign in again")]
    SessionExpired,

    /// The reconnection budget is exhausted
    #[error("Max reconnection attempts reached ({attempts})")]
    MaxReconnectAttempts {
        /// Number of retries that were scheduled before giving up
        attempts: u32,
    },

    /// A snapshot fetch against the REST endpoint failed
    #[error("Failed to fetch availability: {0}")]
    FetchFailed(String),

    /// A frame payload could not be decoded as a snapshot
    #[error("Malformed availability payload: {0}")]
    Parse(String),

    /// The subscription was closed before the operation completed
    #[error("Subscription closed")]
    Closed,
}

impl StreamError {
    /// Build an `HttpStatus` error using the canonical reason phrase
    #[must_use]
    pub fn from_status(status: u16) -> Self {
        let message = reqwest::StatusCode::from_u16(status)
            .ok()
            .and_then(|s| s.canonical_reason())
            .unwrap_or("Unknown status")
            .to_string();
        Self::HttpStatus { status, message }
    }

    /// Whether the generic reconnection policy may retry after this error
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::ConnectionFailed(_) | Self::FetchFailed(_) => true,
            Self::HttpStatus { status, .. } => *status != 401,
            _ => false,
        }
    }
}

impl From<ConfigError> for StreamError {
    fn from(e: ConfigError) -> Self {
        match e {
            ConfigError::Invalid(message) => Self::InvalidConfig(message),
            other => Self::InvalidConfig(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for StreamError {
    fn from(e: serde_json::Error) -> Self {
        Self::Parse(e.to_string())
    }
}

/// Convenience result alias
pub type Result<T> = std::result::Result<T, StreamError>;
