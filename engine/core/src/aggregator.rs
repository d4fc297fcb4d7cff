//! Response Aggregator
//!
//! Assembles the ordered text deltas of one `response.create` exchange into a
//! single completed response. One [`StreamingResponse`] exists per in-flight
//! response request, keyed by the request's correlation id, and never outlives
//! the request's terminal resolution.

use std::collections::HashMap;
use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;

use crate::error::EngineError;
use crate::protocol::EventId;

// ============================================================================
// Streaming Response
// ============================================================================

/// Lifecycle of a streaming response
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamState {
    /// `response.created` seen, no text yet
    Created,
    /// At least one delta received
    Streaming,
    /// `response.done` handled
    Completed,
    /// Failed; fragments discarded
    Errored,
}

impl StreamState {
    /// Whether a terminal call has already happened
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Errored)
    }
}

/// Statistics for a streaming response
#[derive(Clone, Debug, Default)]
pub struct StreamStats {
    /// Deltas received
    pub deltas_received: u32,
    /// Bytes of text received
    pub bytes_received: usize,
    /// When `response.created` arrived
    pub started_at: Option<Instant>,
    /// When the last delta arrived
    pub last_delta_at: Option<Instant>,
}

/// The final result of a response request
#[derive(Clone, Debug, PartialEq)]
pub struct CompletedResponse {
    /// Correlation id of the originating request
    pub correlation_id: EventId,
    /// Server-assigned response id
    pub response_id: String,
    /// Full response text
    pub text: String,
    /// Final status reported by the server
    pub status: Option<String>,
    /// Token usage, passed through untouched
    pub usage: Option<Value>,
    /// Number of deltas that made up the text
    pub delta_count: u32,
    /// Time from `response.created` to `response.done`
    pub duration: Duration,
}

/// Accumulates the deltas of one response
#[derive(Debug)]
pub struct StreamingResponse {
    correlation_id: EventId,
    response_id: String,
    fragments: Vec<String>,
    final_text: Option<String>,
    state: StreamState,
    stats: StreamStats,
}

impl StreamingResponse {
    /// Start a response after `response.created`
    #[must_use]
    pub fn new(correlation_id: EventId, response_id: impl Into<String>) -> Self {
        Self {
            correlation_id,
            response_id: response_id.into(),
            fragments: Vec::new(),
            final_text: None,
            state: StreamState::Created,
            stats: StreamStats {
                started_at: Some(Instant::now()),
                ..Default::default()
            },
        }
    }

    /// Correlation id of the originating request
    #[must_use]
    pub fn correlation_id(&self) -> &EventId {
        &self.correlation_id
    }

    /// Server-assigned response id
    #[must_use]
    pub fn response_id(&self) -> &str {
        &self.response_id
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> StreamState {
        self.state
    }

    /// Stream statistics
    #[must_use]
    pub fn stats(&self) -> &StreamStats {
        &self.stats
    }

    /// Text assembled so far
    #[must_use]
    pub fn content(&self) -> String {
        self.fragments.concat()
    }

    /// Append a delta in arrival order
    ///
    /// # Errors
    ///
    /// Returns `ProtocolAnomaly` if the response already terminated.
    pub fn on_delta(&mut self, text: &str) -> Result<(), EngineError> {
        self.ensure_open("delta")?;
        self.fragments.push(text.to_string());
        self.state = StreamState::Streaming;
        self.stats.deltas_received += 1;
        self.stats.bytes_received += text.len();
        self.stats.last_delta_at = Some(Instant::now());
        Ok(())
    }

    /// Record the server's final text for the content part
    ///
    /// # Errors
    ///
    /// Returns `ProtocolAnomaly` if the response already terminated.
    pub fn on_text_done(&mut self, text: &str) -> Result<(), EngineError> {
        self.ensure_open("text.done")?;
        let joined = self.content();
        if joined != text {
            tracing::warn!(
                event_id = %self.correlation_id,
                response_id = %self.response_id,
                joined_len = joined.len(),
                final_len = text.len(),
                "Final text differs from joined deltas, using server text"
            );
        }
        self.final_text = Some(text.to_string());
        Ok(())
    }

    /// Finalise the response
    ///
    /// # Errors
    ///
    /// Returns `ProtocolAnomaly` on a second terminal call.
    pub fn on_done(
        &mut self,
        status: Option<String>,
        usage: Option<Value>,
    ) -> Result<CompletedResponse, EngineError> {
        self.ensure_open("done")?;
        self.state = StreamState::Completed;

        let text = match self.final_text.take() {
            Some(text) => text,
            None => self.fragments.concat(),
        };
        self.fragments.clear();

        let duration = self
            .stats
            .started_at
            .map(|s| s.elapsed())
            .unwrap_or_default();

        Ok(CompletedResponse {
            correlation_id: self.correlation_id.clone(),
            response_id: self.response_id.clone(),
            text,
            status,
            usage,
            delta_count: self.stats.deltas_received,
            duration,
        })
    }

    /// Discard fragments after an error
    ///
    /// Returns the partial content that was dropped.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolAnomaly` on a second terminal call.
    pub fn on_error(&mut self, reason: &str) -> Result<String, EngineError> {
        self.ensure_open("error")?;
        self.state = StreamState::Errored;
        let partial = self.fragments.concat();
        self.fragments.clear();
        self.final_text = None;
        tracing::debug!(
            event_id = %self.correlation_id,
            partial_len = partial.len(),
            reason,
            "Discarded partial response"
        );
        Ok(partial)
    }

    fn ensure_open(&self, call: &str) -> Result<(), EngineError> {
        if self.state.is_terminal() {
            return Err(EngineError::ProtocolAnomaly(format!(
                "{call} for response {} after it terminated ({:?})",
                self.response_id, self.state
            )));
        }
        Ok(())
    }
}

// ============================================================================
// Aggregator
// ============================================================================

/// All in-flight streaming responses, keyed by correlation id
#[derive(Debug, Default)]
pub struct ResponseAggregator {
    streams: HashMap<EventId, StreamingResponse>,
    total_completed: u64,
    total_deltas: u64,
}

impl ResponseAggregator {
    /// Create an empty aggregator
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of in-flight responses
    #[must_use]
    pub fn len(&self) -> usize {
        self.streams.len()
    }

    /// Check if nothing is streaming
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    /// Check if a response exists for this request
    #[must_use]
    pub fn contains(&self, id: &EventId) -> bool {
        self.streams.contains_key(id)
    }

    /// Responses completed since creation
    #[must_use]
    pub fn total_completed(&self) -> u64 {
        self.total_completed
    }

    /// Deltas appended since creation
    #[must_use]
    pub fn total_deltas(&self) -> u64 {
        self.total_deltas
    }

    /// Begin a response
    ///
    /// # Errors
    ///
    /// Returns `ProtocolAnomaly` if a response already exists for this request.
    pub fn on_created(&mut self, id: &EventId, response_id: &str) -> Result<(), EngineError> {
        if let Some(existing) = self.streams.get(id) {
            return Err(EngineError::ProtocolAnomaly(format!(
                "Duplicate response.created for {id} (existing response {})",
                existing.response_id()
            )));
        }
        self.streams
            .insert(id.clone(), StreamingResponse::new(id.clone(), response_id));
        Ok(())
    }

    /// Append a delta
    ///
    /// # Errors
    ///
    /// Returns `ProtocolAnomaly` if no response exists for this request.
    pub fn on_delta(&mut self, id: &EventId, text: &str) -> Result<(), EngineError> {
        self.stream_mut(id, "response.text.delta")?.on_delta(text)?;
        self.total_deltas += 1;
        tracing::trace!(event_id = %id, len = text.len(), "Delta appended");
        Ok(())
    }

    /// Record the final text of the content part
    ///
    /// # Errors
    ///
    /// Returns `ProtocolAnomaly` if no response exists for this request.
    pub fn on_text_done(&mut self, id: &EventId, text: &str) -> Result<(), EngineError> {
        self.stream_mut(id, "response.text.done")?.on_text_done(text)
    }

    /// Finalise and remove a response
    ///
    /// # Errors
    ///
    /// Returns `ProtocolAnomaly` if no response exists for this request.
    pub fn on_done(
        &mut self,
        id: &EventId,
        status: Option<String>,
        usage: Option<Value>,
    ) -> Result<CompletedResponse, EngineError> {
        let mut stream = self.streams.remove(id).ok_or_else(|| {
            EngineError::ProtocolAnomaly(format!("response.done for {id} without response.created"))
        })?;
        let completed = stream.on_done(status, usage)?;
        self.total_completed += 1;
        Ok(completed)
    }

    /// Fail and remove a response, if one exists
    pub fn on_error(&mut self, id: &EventId, reason: &str) {
        if let Some(mut stream) = self.streams.remove(id) {
            // Freshly removed streams are never terminal
            let _ = stream.on_error(reason);
        }
    }

    /// Drop a response without a terminal call (cancel, timeout)
    pub fn discard(&mut self, id: &EventId) -> bool {
        self.streams.remove(id).is_some()
    }

    /// Drop every response (session teardown)
    pub fn clear(&mut self) -> usize {
        let count = self.streams.len();
        self.streams.clear();
        count
    }

    fn stream_mut(&mut self, id: &EventId, kind: &str) -> Result<&mut StreamingResponse, EngineError> {
        self.streams.get_mut(id).ok_or_else(|| {
            EngineError::ProtocolAnomaly(format!("{kind} for {id} without response.created"))
        })
    }
}
