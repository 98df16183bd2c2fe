//! Error types for the stream client.
//!
//! Errors are split by concern, each a `thiserror` enum:
//!
//! - **`TransportError`**: what a frame transport reports when a connection attempt or
//!   frame delivery fails. It is either *transient* (eligible for retry) or *terminal*
//!   (the backend said the camera is unavailable).
//! - **`StreamError`**: the taxonomy used by the connection state machine. Transport
//!   errors are folded into it, together with `ExhaustedRetries` (retry ceiling reached)
//!   and `StaleCallback` (a completion from a superseded attempt). None of these are ever
//!   returned from `open`/`pause`/`resume`/`close`; the host observes them through the
//!   connection's `phase` and `last_error`.
//! - **`ClientError`**: failures talking to the backend REST API.
//! - **`AquariumError`**: top-level application error (configuration, I/O, client).

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::address::AddressError;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, AquariumError>;

/// WebSocket close code the backend sends when a camera cannot be streamed.
pub const CLOSE_CODE_POLICY_VIOLATION: u16 = 1008;

/// Error message plus optional machine-readable code, as shown to the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDescriptor {
    /// Human-readable message.
    pub message: String,
    /// Optional code (HTTP status or WebSocket close code).
    pub code: Option<u16>,
}

impl ErrorDescriptor {
    /// Descriptor without a code.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
        }
    }

    /// Descriptor carrying a status or close code.
    pub fn with_code(message: impl Into<String>, code: u16) -> Self {
        Self {
            message: message.into(),
            code: Some(code),
        }
    }
}

impl fmt::Display for ErrorDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "{} (code {})", self.message, code),
            None => write!(f, "{}", self.message),
        }
    }
}

/// Failure reported by a frame transport.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Network blip, timeout or generic close. Retryable.
    #[error("transient transport error: {0}")]
    Transient(ErrorDescriptor),

    /// Backend explicitly reported the device as unavailable. Not retryable.
    #[error("terminal transport error: {0}")]
    Terminal(ErrorDescriptor),
}

impl TransportError {
    /// Transient error without a code.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(ErrorDescriptor::new(message))
    }

    /// Terminal error without a code.
    pub fn terminal(message: impl Into<String>) -> Self {
        Self::Terminal(ErrorDescriptor::new(message))
    }

    /// Returns true if the state machine may retry after this error.
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// The descriptor recorded as the connection's last error.
    #[must_use]
    pub fn descriptor(&self) -> &ErrorDescriptor {
        match self {
            Self::Transient(d) | Self::Terminal(d) => d,
        }
    }
}

/// Error taxonomy of the stream connection state machine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    /// Retryable transport failure.
    #[error("stream interrupted: {0}")]
    TransientTransport(ErrorDescriptor),

    /// Camera unavailable; no automatic retry.
    #[error("camera unavailable: {0}")]
    TerminalTransport(ErrorDescriptor),

    /// Consecutive failures reached the retry ceiling.
    #[error("gave up after {attempts} consecutive failures: {last}")]
    ExhaustedRetries {
        /// Consecutive failures observed.
        attempts: u32,
        /// The failure that reached the ceiling.
        last: ErrorDescriptor,
    },

    /// Completion from a superseded attempt. Dropped, never shown to the user.
    #[error("stale callback for generation {generation} (current {current})")]
    StaleCallback {
        /// Generation the callback was tagged with.
        generation: u64,
        /// Generation currently in effect.
        current: u64,
    },
}

impl From<TransportError> for StreamError {
    fn from(value: TransportError) -> Self {
        match value {
            TransportError::Transient(d) => Self::TransientTransport(d),
            TransportError::Terminal(d) => Self::TerminalTransport(d),
        }
    }
}

/// Errors from the backend REST client.
#[derive(Error, Debug)]
pub enum ClientError {
    /// Could not build a request URL.
    #[error("Invalid URL: {0}")]
    UrlParse(#[from] url::ParseError),

    /// HTTP transport failure (connect refused, timeout, TLS).
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The backend answered with a non-success status.
    #[error("Server error ({status}): {detail}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// `detail` field of the backend's error body, or the status reason.
        detail: String,
    },

    /// Response body did not match the expected shape.
    #[error("Unexpected response: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Top-level application error.
#[derive(Error, Debug)]
pub enum AquariumError {
    /// Configuration could not be loaded or parsed.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Configuration parsed but holds invalid values.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Backend address rejected.
    #[error("Invalid backend address: {0}")]
    Address(#[from] AddressError),

    /// I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Backend request failed.
    #[error("Backend error: {0}")]
    Client(#[from] ClientError),

    /// Logging could not be initialized.
    #[error("Logging error: {0}")]
    Logging(String),
}

impl From<figment::Error> for AquariumError {
    fn from(value: figment::Error) -> Self {
        Self::Config(Box::new(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_error_retriability() {
        assert!(TransportError::transient("reset").is_retriable());
        assert!(!TransportError::terminal("gone").is_retriable());
    }

    #[test]
    fn transport_error_folds_into_stream_error() {
        let err: StreamError =
            TransportError::Terminal(ErrorDescriptor::with_code("camera not available", 1008))
                .into();
        match err {
            StreamError::TerminalTransport(d) => assert_eq!(d.code, Some(1008)),
            other => panic!("unexpected variant: {:?}", other),
        }
    }

    #[test]
    fn descriptor_display_includes_code() {
        let d = ErrorDescriptor::with_code("service unavailable", 503);
        assert_eq!(d.to_string(), "service unavailable (code 503)");
        assert_eq!(ErrorDescriptor::new("reset").to_string(), "reset");
    }

    #[test]
    fn exhausted_retries_message() {
        let err = StreamError::ExhaustedRetries {
            attempts: 3,
            last: ErrorDescriptor::new("connection refused"),
        };
        assert!(err.to_string().contains("3 consecutive failures"));
        assert!(err.to_string().contains("connection refused"));
    }
}
