//! Engine Errors
//!
//! Two error families live here:
//! - [`TransportError`]: failures of the raw duplex link (connect, send, close)
//! - [`EngineError`]: the closed set of outcomes a caller can observe for a
//!   request, a session handshake, or a connection attempt
//!
//! `EngineError` is `Clone` because a single failure (for example a dropped
//! connection) is fanned out to every outstanding request handle.

use std::time::Duration;

use thiserror::Error;

use crate::correlator::PendingKind;
use crate::guard::Denial;

/// Errors raised by a transport link
#[derive(Debug, Error)]
pub enum TransportError {
    /// Could not establish the link
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Link closed by the peer or locally
    #[error("Connection closed")]
    ConnectionClosed,

    /// Connect did not finish within the configured timeout
    #[error("Connect timed out after {0:?}")]
    Timeout(Duration),

    /// Failed to hand a frame to the link
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Request or credentials could not be built
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// IO error from the underlying socket
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Every failure a caller of the engine can observe
#[derive(Clone, Debug, Error, PartialEq)]
pub enum EngineError {
    /// Transport failed to establish or dropped
    #[error("Connection error: {0}")]
    Connection(String),

    /// An operation needed a live connection and there is none
    #[error("Not connected")]
    NotConnected,

    /// Reconnect attempts were used up
    #[error("Connection retries exhausted after {attempts} attempts")]
    ConnectionExhausted {
        /// Number of reconnect attempts made
        attempts: u32,
    },

    /// Session handshake failed or timed out
    #[error("Session error: {reason}")]
    Session {
        /// Why the handshake failed
        reason: String,
    },

    /// No terminal response arrived before the deadline
    #[error("{kind} timed out after {after:?}")]
    Timeout {
        /// Kind of request that timed out
        kind: PendingKind,
        /// Time elapsed since submission
        after: Duration,
    },

    /// The pending-request cap would be exceeded
    #[error("Too many pending requests (limit: {limit})")]
    Backpressure {
        /// Configured cap
        limit: usize,
    },

    /// Unmatched, duplicate, or malformed frame
    #[error("Protocol anomaly: {0}")]
    ProtocolAnomaly(String),

    /// Caller cancelled the request
    #[error("Request cancelled")]
    Cancelled,

    /// The session went away while the request was outstanding
    #[error("Session lost")]
    SessionLost,

    /// The guard refused the action in the current state
    #[error("Denied: {0}")]
    Denied(Denial),

    /// The backend reported an error for this request
    #[error("Server error{}: {message}", code.as_ref().map(|c| format!(" ({c})")).unwrap_or_default())]
    Server {
        /// Machine-readable error code, when present
        code: Option<String>,
        /// Human-readable message
        message: String,
    },

    /// Caller-supplied content failed validation
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl EngineError {
    /// Whether this error was produced by the guard before any state changed
    #[must_use]
    pub fn is_denial(&self) -> bool {
        matches!(
            self,
            Self::Denied(_) | Self::Backpressure { .. } | Self::InvalidInput(_)
        )
    }
}

impl From<TransportError> for EngineError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::ConnectionClosed => Self::NotConnected,
            other => Self::Connection(other.to_string()),
        }
    }
}
