//! Transport Layer
//!
//! A [`Connector`] establishes one duplex [`Link`] per call. A link is a pair of
//! channels: text frames go out through `outbound`, frames and the final close
//! notice come back through `inbound`. Links carry no session or correlation
//! semantics; the connection manager owns their lifecycle.
//!
//! # Implementations
//!
//! - [`InProcessConnector`]: channel pair for embedding and tests, with fault
//!   injection for refused connects and dropped links
//! - `WebSocketConnector`: the realtime backend over `wss://` (feature
//!   `websocket`)

pub mod in_process;
pub mod liveness;
#[cfg(feature = "websocket")]
pub mod websocket;

use std::fmt;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::TransportError;

pub use in_process::{InProcessConnector, InProcessServer, PeerConnection};
pub use liveness::{LinkHealth, LivenessCheck, LivenessConfig, LivenessMonitor};
#[cfg(feature = "websocket")]
pub use websocket::WebSocketConnector;

/// Unique identifier for one established link
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct LinkId(pub String);

impl LinkId {
    /// Generate a new unique link ID using a random 128-bit value
    #[must_use]
    pub fn new() -> Self {
        use rand::Rng;
        let bytes: [u8; 16] = rand::thread_rng().gen();
        Self(format!("link_{}", hex::encode(bytes)))
    }
}

impl Default for LinkId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A frame handed to the link for sending
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OutboundFrame {
    /// JSON text frame
    Text(String),
    /// Protocol-level ping with an opaque payload
    Ping(Vec<u8>),
}

/// Something that arrived on a link
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LinkEvent {
    /// JSON text frame
    Frame(String),
    /// Answer to a ping, echoing its payload
    Pong(Vec<u8>),
    /// The link is gone; nothing follows
    Closed {
        /// Why it closed
        reason: String,
    },
}

/// One established duplex link
#[derive(Debug)]
pub struct Link {
    /// Identifier for logging
    pub id: LinkId,
    /// Frames to send; dropping every sender closes the link
    pub outbound: mpsc::Sender<OutboundFrame>,
    /// Frames received, terminated by [`LinkEvent::Closed`]
    pub inbound: mpsc::Receiver<LinkEvent>,
}

/// Establishes links to the backend
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Open a new link
    async fn connect(&self) -> Result<Link, TransportError>;

    /// Human-readable target, for logs
    fn describe(&self) -> String;
}
