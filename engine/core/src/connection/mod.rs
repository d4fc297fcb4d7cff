//! Connection Manager
//!
//! Owns the raw duplex link to the backend: connect, disconnect, liveness, and
//! reconnect with backoff. It knows nothing about sessions or correlation.
//!
//! # State Machine
//!
//! ```text
//!  Disconnected ──connect()──► Connecting ──ok──► Connected
//!        ▲                         │                  │
//!        │                       fail            link lost
//!   disconnect()                   ▼                  ▼
//!        └──────────────────── Error ◄──────── Backoff{attempt}
//!                                 └──retry──►  Connecting
//! ```
//!
//! Every transition runs under the engine lock through [`ConnectionCore`];
//! the async driver lives in `manager`.

mod backoff;
pub(crate) mod manager;

use std::fmt;

use tokio::sync::mpsc;

pub use backoff::{BackoffConfig, BackoffPolicy};

use crate::error::EngineError;
use crate::transport::{LinkId, OutboundFrame};

/// State of the underlying connection
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// No link and nothing scheduled
    Disconnected,
    /// A connect attempt is running
    Connecting,
    /// A link is up
    Connected,
    /// Waiting before reconnect attempt `attempt`
    Backoff {
        /// 1-based attempt number
        attempt: u32,
    },
    /// The link failed; a retry may follow
    Error,
}

impl ConnectionState {
    /// Check if a link is up
    #[must_use]
    pub fn is_connected(self) -> bool {
        matches!(self, Self::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::Backoff { attempt } => write!(f, "Backoff (attempt {attempt})"),
            Self::Error => write!(f, "Error"),
        }
    }
}

/// Connection state guarded by the engine lock
///
/// `generation` increases every time a link is installed or torn down, so
/// events from a previous link can be recognised and dropped.
#[derive(Debug)]
pub(crate) struct ConnectionCore {
    state: ConnectionState,
    generation: u64,
    link_id: Option<LinkId>,
    outbound: Option<mpsc::Sender<OutboundFrame>>,
    exhausted: Option<u32>,
}

impl ConnectionCore {
    pub(crate) fn new() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            generation: 0,
            link_id: None,
            outbound: None,
            exhausted: None,
        }
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.state
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn link_id(&self) -> Option<&LinkId> {
        self.link_id.as_ref()
    }

    /// Attempts made before reconnecting was abandoned, if it was
    pub(crate) fn exhausted(&self) -> Option<u32> {
        self.exhausted
    }

    pub(crate) fn begin_connect(&mut self) {
        self.exhausted = None;
        self.state = ConnectionState::Connecting;
    }

    /// Install a fresh link, returning its generation
    pub(crate) fn established(&mut self, link_id: LinkId, outbound: mpsc::Sender<OutboundFrame>) -> u64 {
        self.generation += 1;
        self.link_id = Some(link_id);
        self.outbound = Some(outbound);
        self.exhausted = None;
        self.state = ConnectionState::Connected;
        self.generation
    }

    /// A connect attempt failed; inert if a disconnect overtook it
    pub(crate) fn connect_failed(&mut self) {
        if self.state == ConnectionState::Connecting {
            self.state = ConnectionState::Error;
        }
    }

    /// Mark the link of `generation` as lost
    ///
    /// Returns `false` if that link was already replaced or closed.
    pub(crate) fn lost(&mut self, generation: u64) -> bool {
        if generation != self.generation || !self.state.is_connected() {
            return false;
        }
        self.drop_link();
        self.state = ConnectionState::Error;
        true
    }

    pub(crate) fn enter_backoff(&mut self, attempt: u32) {
        self.state = ConnectionState::Backoff { attempt };
    }

    pub(crate) fn exhaust(&mut self, attempts: u32) {
        self.state = ConnectionState::Error;
        self.exhausted = Some(attempts);
    }

    /// Close unconditionally
    pub(crate) fn close(&mut self) {
        self.drop_link();
        self.exhausted = None;
        self.state = ConnectionState::Disconnected;
    }

    /// Hand a text frame to the link without waiting
    pub(crate) fn send(&self, text: String) -> Result<(), EngineError> {
        if !self.state.is_connected() {
            return Err(EngineError::NotConnected);
        }
        let outbound = self.outbound.as_ref().ok_or(EngineError::NotConnected)?;
        outbound.try_send(OutboundFrame::Text(text)).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                EngineError::Connection("Outbound queue full".to_string())
            }
            mpsc::error::TrySendError::Closed(_) => EngineError::NotConnected,
        })
    }

    fn drop_link(&mut self) {
        // Dropping the sender lets the writer close the socket
        self.outbound = None;
        self.link_id = None;
        self.generation += 1;
    }
}
