//! Realtime Engine - Client-Side Protocol Engine for Realtime Conversations
//!
//! This crate drives one conversation with a realtime conversational AI
//! backend over a long-lived duplex link. It owns the connection, negotiates
//! the session, correlates every request with the server's replies, and
//! assembles streamed text into complete responses. It has no UI of its own.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                          Application                              │
//! │     submit() / send_message()          EngineEvent stream         │
//! └───────────────┬───────────────────────────────▲──────────────────┘
//!                 │ ResponseHandle (Future)        │
//! ┌───────────────┼────────────────────────────────┼──────────────────┐
//! │               ▼          RealtimeClient        │                  │
//! │  ┌──────────────────────────────────────────────────────────────┐ │
//! │  │                     engine lock (Core)                        │ │
//! │  │  ┌────────────┐ ┌────────────┐ ┌────────────┐ ┌────────────┐ │ │
//! │  │  │ Connection │ │  Session   │ │   Event    │ │  Response  │ │ │
//! │  │  │   State    │ │ Negotiator │ │ Correlator │ │ Aggregator │ │ │
//! │  │  └────────────┘ └────────────┘ └────────────┘ └────────────┘ │ │
//! │  └──────────────────────────▲───────────────────────────────────┘ │
//! │                    Guard ───┘ (every action, every frame)          │
//! │  ┌──────────────────────────────────────────────────────────────┐ │
//! │  │   Connection driver: connect, pump, liveness, backoff         │ │
//! │  └──────────────────────────────┬───────────────────────────────┘ │
//! └─────────────────────────────────┼─────────────────────────────────┘
//!                                   │ Link (Connector)
//!                      WebSocket / in-process transport
//! ```
//!
//! # Key Types
//!
//! - [`RealtimeClient`]: owns the engine and exposes every operation
//! - [`ResponseHandle`]: future for one request, cancellable
//! - [`EngineConfig`]: layered configuration (file, env, CLI)
//! - [`EngineError`]: every failure a caller can observe
//! - [`EngineEvent`]: notifications about what the engine did on its own
//! - [`Connector`]: transport seam ([`InProcessConnector`], `WebSocketConnector`)
//!
//! # Quick Start
//!
//! ```ignore
//! use realtime_engine::{EngineConfig, RealtimeClient, WebSocketConnector};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = realtime_engine::config::load_config()?;
//!     let connector = WebSocketConnector::from_settings(&config.connection);
//!     let client = RealtimeClient::new(config, connector);
//!
//!     client.connect().await?;
//!     client.initialize_session(client.default_session())?.await?;
//!
//!     let reply = client.send_message("Hello!").await?;
//!     println!("{}", reply.text);
//!
//!     client.disconnect();
//!     Ok(())
//! }
//! ```
//!
//! # Module Overview
//!
//! - [`aggregator`]: assembles streamed deltas into complete responses
//! - [`client`]: the engine facade and frame dispatch
//! - [`config`]: configuration loading and validation
//! - [`connection`]: connection state machine, backoff, and driver
//! - [`correlator`]: pending requests, deadlines, and matching
//! - [`error`]: error types
//! - [`events`]: engine notifications
//! - [`guard`]: stateless precondition checks
//! - [`history`]: conversation memory for replay
//! - [`protocol`]: wire frames
//! - [`session`]: session handshake state machine
//! - [`transport`]: link abstraction and implementations

#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod aggregator;
pub mod client;
pub mod config;
pub mod connection;
pub mod correlator;
pub mod error;
pub mod events;
pub mod guard;
pub mod history;
pub mod protocol;
pub mod session;
pub mod transport;

// Re-exports for convenience
pub use aggregator::{CompletedResponse, ResponseAggregator, StreamState, StreamingResponse};
pub use client::{Canceller, EngineStats, RealtimeClient, Request, ResponseHandle};
pub use config::{
    load_config, load_config_from_path, ConfigError, ConfigOverrides, ConfigSource,
    EngineConfig,
};
pub use connection::{BackoffConfig, BackoffPolicy, ConnectionState};
pub use correlator::{Completion, CorrelatorConfig, PendingKind};
pub use error::{EngineError, TransportError};
pub use events::EngineEvent;
pub use guard::{Action, Denial, GuardContext, GuardLimits, Verdict};
pub use history::{ConversationMemory, HistoryConfig, Turn};
pub use protocol::{
    ClientEvent, ConversationItem, EventId, Modality, ResponseParams, Role, ServerEvent,
    SessionConfig, SessionInfo,
};
pub use session::SessionState;
pub use transport::{
    Connector, InProcessConnector, InProcessServer, LinkHealth, LivenessConfig, PeerConnection,
};
#[cfg(feature = "websocket")]
pub use transport::WebSocketConnector;
