//! WebSocket Connector
//!
//! Connects to the realtime backend over `wss://` using tokio-tungstenite.
//! Each link runs two tasks: a writer draining the outbound queue into the
//! socket, and a reader forwarding text frames and pongs into the inbound queue
//! until the socket closes.
//!
//! The handshake request carries:
//! - `Authorization: Bearer <api key>`
//! - `OpenAI-Beta: realtime=v1`
//! - the model as a `?model=` query parameter

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;

use super::{Connector, Link, LinkEvent, LinkId, OutboundFrame};
use crate::config::ConnectionSettings;
use crate::error::TransportError;

/// Connector for the realtime WebSocket endpoint
#[derive(Clone)]
pub struct WebSocketConnector {
    url: String,
    model: String,
    api_key: Option<String>,
    capacity: usize,
}

impl WebSocketConnector {
    /// Create a connector for an explicit endpoint
    pub fn new(url: impl Into<String>, model: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            url: url.into(),
            model: model.into(),
            api_key,
            capacity: 64,
        }
    }

    /// Create a connector from connection settings
    #[must_use]
    pub fn from_settings(settings: &ConnectionSettings) -> Self {
        Self {
            url: settings.url.clone(),
            model: settings.model.clone(),
            api_key: settings.api_key.clone(),
            capacity: settings.outbound_capacity,
        }
    }

    /// Full endpoint URL including the model query
    #[must_use]
    pub fn endpoint(&self) -> String {
        let separator = if self.url.contains('?') { '&' } else { '?' };
        format!("{}{separator}model={}", self.url, self.model)
    }

    fn request(&self) -> Result<Request, TransportError> {
        let mut request = self
            .endpoint()
            .into_client_request()
            .map_err(|e| TransportError::InvalidRequest(e.to_string()))?;

        let headers = request.headers_mut();
        if let Some(ref key) = self.api_key {
            let value = HeaderValue::from_str(&format!("Bearer {key}"))
                .map_err(|e| TransportError::InvalidRequest(format!("Bad API key: {e}")))?;
            headers.insert("Authorization", value);
        }
        headers.insert("OpenAI-Beta", HeaderValue::from_static("realtime=v1"));

        Ok(request)
    }
}

impl std::fmt::Debug for WebSocketConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketConnector")
            .field("url", &self.url)
            .field("model", &self.model)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self) -> Result<Link, TransportError> {
        let request = self.request()?;

        let (stream, response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        let id = LinkId::new();
        tracing::info!(
            link_id = %id,
            url = %self.url,
            status = %response.status(),
            "WebSocket connected"
        );

        let (mut sink, mut source) = stream.split();
        let (out_tx, mut out_rx) = mpsc::channel::<OutboundFrame>(self.capacity);
        let (in_tx, in_rx) = mpsc::channel::<LinkEvent>(self.capacity);

        // Writer: ends when every outbound sender is dropped
        let writer_id = id.clone();
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                let message = match frame {
                    OutboundFrame::Text(text) => Message::Text(text),
                    OutboundFrame::Ping(payload) => Message::Ping(payload),
                };
                if let Err(e) = sink.send(message).await {
                    tracing::warn!(link_id = %writer_id, error = %e, "WebSocket send failed");
                    break;
                }
            }
            let _ = sink.close().await;
            tracing::debug!(link_id = %writer_id, "WebSocket writer stopped");
        });

        // Reader: always finishes with a Closed event
        let reader_id = id.clone();
        tokio::spawn(async move {
            let reason = loop {
                match source.next().await {
                    Some(Ok(Message::Text(text))) => {
                        if in_tx.send(LinkEvent::Frame(text)).await.is_err() {
                            return;
                        }
                    }
                    Some(Ok(Message::Pong(payload))) => {
                        if in_tx.send(LinkEvent::Pong(payload)).await.is_err() {
                            return;
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        break frame
                            .map(|f| format!("closed by server ({}): {}", f.code, f.reason))
                            .unwrap_or_else(|| "closed by server".to_string());
                    }
                    Some(Ok(Message::Binary(data))) => {
                        tracing::debug!(link_id = %reader_id, len = data.len(), "Ignoring binary frame");
                    }
                    // Pings are answered by tungstenite itself
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break format!("read error: {e}"),
                    None => break "stream ended".to_string(),
                }
            };
            tracing::debug!(link_id = %reader_id, %reason, "WebSocket reader stopped");
            let _ = in_tx.send(LinkEvent::Closed { reason }).await;
        });

        Ok(Link {
            id,
            outbound: out_tx,
            inbound: in_rx,
        })
    }

    fn describe(&self) -> String {
        self.url.clone()
    }
}
