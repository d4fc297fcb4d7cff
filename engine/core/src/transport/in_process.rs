//! In-Process Transport
//!
//! Channel-based links for embedding the engine next to an in-process backend,
//! and for driving the engine from tests.
//!
//! # Usage
//!
//! ```ignore
//! let (connector, mut server) = InProcessConnector::new_pair();
//! let client = RealtimeClient::new(EngineConfig::for_testing(), connector);
//!
//! client.connect().await?;
//! let mut peer = server.accept().await.unwrap();
//!
//! // Read what the engine sent, answer as the backend would
//! let update = peer.recv_event().await.unwrap();
//! peer.send_json(json!({"type": "session.created", ...})).await;
//! ```

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use super::{Connector, Link, LinkEvent, LinkId, OutboundFrame};
use crate::error::TransportError;
use crate::protocol::ClientEvent;

/// Default channel capacity for in-process links
const DEFAULT_CAPACITY: usize = 100;

#[derive(Debug, Default)]
struct Faults {
    refuse_next: AtomicU32,
    refuse_all: AtomicBool,
    attempts: AtomicU32,
}

/// Client side of an in-process transport
///
/// Every successful `connect()` hands the backend half of the new link to the
/// paired [`InProcessServer`].
#[derive(Debug)]
pub struct InProcessConnector {
    accept_tx: mpsc::UnboundedSender<PeerConnection>,
    faults: Arc<Faults>,
    capacity: usize,
}

impl InProcessConnector {
    /// Create a connector and the server handle that receives its links
    #[must_use]
    pub fn new_pair() -> (Self, InProcessServer) {
        Self::new_pair_with_capacity(DEFAULT_CAPACITY)
    }

    /// Create with custom channel capacity
    #[must_use]
    pub fn new_pair_with_capacity(capacity: usize) -> (Self, InProcessServer) {
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        let faults = Arc::new(Faults::default());

        let connector = Self {
            accept_tx,
            faults: Arc::clone(&faults),
            capacity,
        };
        let server = InProcessServer { accept_rx, faults };

        (connector, server)
    }
}

#[async_trait]
impl Connector for InProcessConnector {
    async fn connect(&self) -> Result<Link, TransportError> {
        self.faults.attempts.fetch_add(1, Ordering::SeqCst);

        if self.faults.refuse_all.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionFailed(
                "Connection refused".to_string(),
            ));
        }
        let refused = self
            .faults
            .refuse_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(TransportError::ConnectionFailed(
                "Connection refused".to_string(),
            ));
        }

        let (out_tx, out_rx) = mpsc::channel(self.capacity);
        let (in_tx, in_rx) = mpsc::channel(self.capacity);
        let id = LinkId::new();

        let peer = PeerConnection {
            link_id: id.clone(),
            from_client: out_rx,
            to_client: in_tx,
            auto_pong: true,
        };
        self.accept_tx
            .send(peer)
            .map_err(|_| TransportError::ConnectionFailed("Server handle dropped".to_string()))?;

        tracing::debug!(link_id = %id, "In-process link established");

        Ok(Link {
            id,
            outbound: out_tx,
            inbound: in_rx,
        })
    }

    fn describe(&self) -> String {
        "in-process".to_string()
    }
}

/// Backend side of an in-process transport
#[derive(Debug)]
pub struct InProcessServer {
    accept_rx: mpsc::UnboundedReceiver<PeerConnection>,
    faults: Arc<Faults>,
}

impl InProcessServer {
    /// Wait for the next link the engine opens
    pub async fn accept(&mut self) -> Option<PeerConnection> {
        self.accept_rx.recv().await
    }

    /// Take an already-opened link without waiting
    pub fn try_accept(&mut self) -> Option<PeerConnection> {
        self.accept_rx.try_recv().ok()
    }

    /// Refuse the next `n` connect attempts
    pub fn refuse_next(&self, n: u32) {
        self.faults.refuse_next.store(n, Ordering::SeqCst);
    }

    /// Refuse every connect attempt until turned off
    pub fn set_refuse_all(&self, refuse: bool) {
        self.faults.refuse_all.store(refuse, Ordering::SeqCst);
    }

    /// Connect attempts seen so far, refused ones included
    #[must_use]
    pub fn connect_attempts(&self) -> u32 {
        self.faults.attempts.load(Ordering::SeqCst)
    }
}

/// Backend half of one in-process link
#[derive(Debug)]
pub struct PeerConnection {
    link_id: LinkId,
    from_client: mpsc::Receiver<OutboundFrame>,
    to_client: mpsc::Sender<LinkEvent>,
    auto_pong: bool,
}

impl PeerConnection {
    /// Link identifier
    #[must_use]
    pub fn link_id(&self) -> &LinkId {
        &self.link_id
    }

    /// Answer pings automatically (on by default)
    pub fn set_auto_pong(&mut self, enabled: bool) {
        self.auto_pong = enabled;
    }

    /// Next outbound frame from the engine, pings included
    pub async fn recv_frame(&mut self) -> Option<OutboundFrame> {
        self.from_client.recv().await
    }

    /// Next text frame from the engine
    ///
    /// Pings received on the way are answered when auto-pong is on. Returns
    /// `None` once the engine side of the link is closed.
    pub async fn recv_text(&mut self) -> Option<String> {
        loop {
            match self.from_client.recv().await? {
                OutboundFrame::Text(text) => return Some(text),
                OutboundFrame::Ping(payload) => {
                    if self.auto_pong {
                        let _ = self.to_client.send(LinkEvent::Pong(payload)).await;
                    }
                }
            }
        }
    }

    /// Next text frame from the engine, decoded
    pub async fn recv_event(&mut self) -> Option<ClientEvent> {
        let text = self.recv_text().await?;
        match serde_json::from_str(&text) {
            Ok(event) => Some(event),
            Err(e) => {
                tracing::warn!(link_id = %self.link_id, error = %e, "Undecodable client frame");
                None
            }
        }
    }

    /// Send a JSON frame to the engine
    pub async fn send_json(&self, value: Value) -> bool {
        self.send_text(value.to_string()).await
    }

    /// Send a raw text frame to the engine
    pub async fn send_text(&self, text: impl Into<String>) -> bool {
        self.to_client.send(LinkEvent::Frame(text.into())).await.is_ok()
    }

    /// Answer a ping
    pub async fn send_pong(&self, payload: Vec<u8>) -> bool {
        self.to_client.send(LinkEvent::Pong(payload)).await.is_ok()
    }

    /// Close the link from the backend side
    pub async fn close(self, reason: &str) {
        let _ = self
            .to_client
            .send(LinkEvent::Closed {
                reason: reason.to_string(),
            })
            .await;
    }

    /// Check if the engine has closed its side of the link
    #[must_use]
    pub fn is_closed_by_client(&self) -> bool {
        self.from_client.is_closed()
    }
}
