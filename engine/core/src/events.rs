//! Engine events
//!
//! Notifications pushed to the embedding application over an unbounded
//! channel. They describe what the engine did on its own (reconnects, expired
//! sessions, dropped frames); results of caller requests are delivered through
//! their handles instead.

use std::time::Duration;

use crate::connection::ConnectionState;
use crate::session::SessionState;

/// Something the application may want to react to
#[derive(Clone, Debug, PartialEq)]
pub enum EngineEvent {
    /// Connection state changed
    ConnectionStateChanged {
        /// Previous state
        from: ConnectionState,
        /// New state
        to: ConnectionState,
    },

    /// Session state changed
    SessionStateChanged {
        /// Previous state
        from: SessionState,
        /// New state
        to: SessionState,
    },

    /// A reconnect attempt will run after `delay`
    ReconnectScheduled {
        /// 1-based attempt number
        attempt: u32,
        /// Backoff delay before the attempt
        delay: Duration,
    },

    /// A reconnect attempt succeeded; the session must be initialized again
    Reconnected {
        /// Attempt that succeeded
        attempt: u32,
    },

    /// Reconnecting was abandoned
    ConnectionExhausted {
        /// Attempts made
        attempts: u32,
    },

    /// The handshake is being retried with a fresh id
    HandshakeRetry {
        /// Attempt about to run
        attempt: u32,
        /// Why the previous attempt failed
        reason: String,
    },

    /// Backend expired the session
    SessionExpired,

    /// An inbound frame was malformed, unmatched, or refused
    ProtocolAnomaly {
        /// What was wrong
        detail: String,
    },

    /// Backend error not tied to any pending request
    ServerError {
        /// Machine-readable code, when present
        code: Option<String>,
        /// Human-readable message
        message: String,
    },
}
