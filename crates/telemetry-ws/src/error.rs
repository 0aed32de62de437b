//! Error handling for the telemetry subscription layer.

use std::{string::FromUtf8Error, time::Duration};

use thiserror::Error;

/// The main result type used throughout the crate.
pub type TelemetryResult<T> = Result<T, TelemetryError>;

/// Error type for all telemetry operations.
///
/// Transport failures are recovered by the engine itself and never reach
/// `subscribe`/`unsubscribe` callers; the variants below surface either
/// misuse (bad configuration) or internal plumbing failures.
#[derive(Error, Debug)]
pub enum TelemetryError {
    /// Authentication errors (token refresh rejected, no token available).
    #[error("Authentication error: {message}")]
    Auth { message: String },

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Malformed endpoint URL
    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    /// WebSocket errors
    #[error("WebSocket error: {message}")]
    WebSocket { message: String },

    /// The connection or the engine task is gone
    #[error("Connection closed: {}", reason.as_deref().unwrap_or("no reason given"))]
    ConnectionClosed { reason: Option<String> },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Timeout errors
    #[error("Operation timed out after {duration:?}")]
    Timeout { duration: Duration },

    /// Internal errors (should not happen in normal operation)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl From<FromUtf8Error> for TelemetryError {
    fn from(e: FromUtf8Error) -> Self {
        Self::Serialization(serde_json::Error::io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            e.to_string(),
        )))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for TelemetryError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket {
            message: e.to_string(),
        }
    }
}

impl TelemetryError {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create an authentication error.
    pub fn auth(message: impl Into<String>) -> Self {
        Self::Auth {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Create a WebSocket error.
    pub fn websocket(message: impl Into<String>) -> Self {
        Self::WebSocket {
            message: message.into(),
        }
    }

    /// Create a connection-closed error.
    pub fn connection_closed(reason: Option<String>) -> Self {
        Self::ConnectionClosed { reason }
    }

    /// Create a timeout error.
    pub fn timeout(duration: Duration) -> Self {
        Self::Timeout { duration }
    }
}
