//! Event Correlator
//!
//! Tracks every request the engine has sent and not yet seen answered. Each
//! entry carries its deadline, the sink its result is delivered to, and the
//! handle of the timer task that expires it.
//!
//! Inbound frames are matched by their echoed `event_id` first and by the
//! server `response_id` second, so response frames that only carry the
//! response id still reach the right request. An entry leaves the set exactly
//! once: by [`EventCorrelator::take`] (answer, cancel, failure, teardown) or by
//! [`EventCorrelator::expire`] (deadline), never both.

use std::collections::HashMap;
use std::fmt;

use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tokio::time::Instant;

use crate::aggregator::CompletedResponse;
use crate::error::EngineError;
use crate::guard::DEFAULT_MAX_MESSAGE_BYTES;
use crate::protocol::{Correlation, EventId, SessionInfo};

/// Kind of outstanding request
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PendingKind {
    /// `session.update`
    SessionUpdate,
    /// `conversation.item.create`
    ItemCreate,
    /// `response.create`
    ResponseCreate,
}

impl fmt::Display for PendingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::SessionUpdate => "session.update",
            Self::ItemCreate => "conversation.item.create",
            Self::ResponseCreate => "response.create",
        };
        f.write_str(name)
    }
}

/// Pending-set limits and deadlines, in time units
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CorrelatorConfig {
    /// Cap on outstanding requests (default: 32)
    pub max_pending: usize,
    /// Deadline for `conversation.item.create` (default: 15)
    pub item_deadline_units: u32,
    /// Deadline for `response.created` after `response.create` (default: 15)
    pub response_ack_units: u32,
    /// Deadline for `response.done`, measured from submission (default: 60)
    pub response_deadline_units: u32,
    /// Cap on in-flight responses (default: 1)
    pub max_concurrent_responses: usize,
    /// Largest accepted message text in bytes (default: 100 KiB)
    pub max_message_bytes: usize,
}

impl Default for CorrelatorConfig {
    fn default() -> Self {
        Self {
            max_pending: 32,
            item_deadline_units: 15,
            response_ack_units: 15,
            response_deadline_units: 60,
            max_concurrent_responses: 1,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
        }
    }
}

/// Successful outcome of a request
#[derive(Clone, Debug, PartialEq)]
pub enum Completion {
    /// Handshake finished
    Session(SessionInfo),
    /// Item appended to the conversation
    Item {
        /// Server-assigned item id
        item_id: String,
    },
    /// Response fully assembled
    Response(CompletedResponse),
}

impl Completion {
    /// Unwrap a response completion
    ///
    /// # Errors
    ///
    /// Returns `ProtocolAnomaly` for any other completion.
    pub fn into_response(self) -> Result<CompletedResponse, EngineError> {
        match self {
            Self::Response(response) => Ok(response),
            other => Err(EngineError::ProtocolAnomaly(format!(
                "expected a response, got {other:?}"
            ))),
        }
    }

    /// Unwrap a session completion
    ///
    /// # Errors
    ///
    /// Returns `ProtocolAnomaly` for any other completion.
    pub fn into_session(self) -> Result<SessionInfo, EngineError> {
        match self {
            Self::Session(info) => Ok(info),
            other => Err(EngineError::ProtocolAnomaly(format!(
                "expected a session, got {other:?}"
            ))),
        }
    }
}

pub(crate) type ResultSink = oneshot::Sender<Result<Completion, EngineError>>;

/// Where a pending request's result goes
#[derive(Debug)]
pub(crate) enum Sink {
    /// A caller is awaiting the result
    Caller(ResultSink),
    /// The negotiator holds the handshake caller
    Session,
    /// Nobody waits (history replay)
    Detached,
}

#[derive(Debug)]
pub(crate) struct PendingEvent {
    pub(crate) id: EventId,
    pub(crate) kind: PendingKind,
    pub(crate) created_at: Instant,
    pub(crate) deadline: Instant,
    pub(crate) response_id: Option<String>,
    sink: Sink,
    timer: Option<AbortHandle>,
    timer_generation: u64,
}

impl PendingEvent {
    /// Deliver the result; returns `false` if nobody was listening
    pub(crate) fn resolve(self, result: Result<Completion, EngineError>) -> bool {
        match self.sink {
            Sink::Caller(tx) => tx.send(result).is_ok(),
            Sink::Session => false,
            Sink::Detached => {
                if let Err(e) = result {
                    tracing::debug!(event_id = %self.id, error = %e, "Detached request failed");
                }
                false
            }
        }
    }
}

#[derive(Debug)]
pub(crate) struct EventCorrelator {
    pending: HashMap<EventId, PendingEvent>,
    by_response: HashMap<String, EventId>,
    timer_seq: u64,
}

impl EventCorrelator {
    pub(crate) fn new() -> Self {
        Self {
            pending: HashMap::new(),
            by_response: HashMap::new(),
            timer_seq: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub(crate) fn count(&self, kind: PendingKind) -> usize {
        self.pending.values().filter(|p| p.kind == kind).count()
    }

    pub(crate) fn get(&self, id: &EventId) -> Option<&PendingEvent> {
        self.pending.get(id)
    }

    /// Add an entry; the caller has already checked capacity
    pub(crate) fn register(
        &mut self,
        id: EventId,
        kind: PendingKind,
        created_at: Instant,
        deadline: Instant,
        sink: Sink,
    ) -> Result<(), EngineError> {
        if self.pending.contains_key(&id) {
            return Err(EngineError::ProtocolAnomaly(format!(
                "duplicate pending id {id}"
            )));
        }
        self.pending.insert(
            id.clone(),
            PendingEvent {
                id,
                kind,
                created_at,
                deadline,
                response_id: None,
                sink,
                timer: None,
                timer_generation: 0,
            },
        );
        Ok(())
    }

    /// Associate a server response id with a pending request
    pub(crate) fn bind_response(&mut self, id: &EventId, response_id: &str) -> Result<(), EngineError> {
        if let Some(owner) = self.by_response.get(response_id) {
            return Err(EngineError::ProtocolAnomaly(format!(
                "response {response_id} already bound to {owner}"
            )));
        }
        let entry = self.pending.get_mut(id).ok_or_else(|| {
            EngineError::ProtocolAnomaly(format!("no pending request {id}"))
        })?;
        if entry.response_id.is_some() {
            return Err(EngineError::ProtocolAnomaly(format!(
                "duplicate response.created for {id}"
            )));
        }
        entry.response_id = Some(response_id.to_string());
        self.by_response.insert(response_id.to_string(), id.clone());
        Ok(())
    }

    /// Find the pending request a frame belongs to
    pub(crate) fn lookup(&self, correlation: &Correlation<'_>) -> Option<EventId> {
        if let Some(id) = correlation.event_id {
            if self.pending.contains_key(id) {
                return Some(id.clone());
            }
        }
        correlation
            .response_id
            .and_then(|rid| self.by_response.get(rid))
            .filter(|id| self.pending.contains_key(*id))
            .cloned()
    }

    /// Move the deadline and hand out a generation for the new timer
    ///
    /// The previous timer, if any, is aborted.
    pub(crate) fn rearm(&mut self, id: &EventId, deadline: Instant) -> Option<u64> {
        let entry = self.pending.get_mut(id)?;
        if let Some(timer) = entry.timer.take() {
            timer.abort();
        }
        self.timer_seq += 1;
        entry.deadline = deadline;
        entry.timer_generation = self.timer_seq;
        Some(self.timer_seq)
    }

    pub(crate) fn attach_timer(&mut self, id: &EventId, generation: u64, handle: AbortHandle) {
        match self.pending.get_mut(id) {
            Some(entry) if entry.timer_generation == generation => entry.timer = Some(handle),
            _ => handle.abort(),
        }
    }

    /// Remove an entry that was answered, cancelled, or failed
    pub(crate) fn take(&mut self, id: &EventId) -> Option<PendingEvent> {
        let mut entry = self.remove(id)?;
        if let Some(timer) = entry.timer.take() {
            timer.abort();
        }
        Some(entry)
    }

    /// Remove an entry whose timer of `generation` fired
    ///
    /// Returns `None` if the entry is gone or its timer was re-armed.
    pub(crate) fn expire(&mut self, id: &EventId, generation: u64) -> Option<PendingEvent> {
        let current = self.pending.get(id)?.timer_generation;
        if current != generation {
            return None;
        }
        let mut entry = self.remove(id)?;
        // The firing task is the one holding this handle
        entry.timer = None;
        Some(entry)
    }

    /// Remove every entry
    pub(crate) fn drain(&mut self) -> Vec<PendingEvent> {
        self.by_response.clear();
        self.pending
            .drain()
            .map(|(_, mut entry)| {
                if let Some(timer) = entry.timer.take() {
                    timer.abort();
                }
                entry
            })
            .collect()
    }

    fn remove(&mut self, id: &EventId) -> Option<PendingEvent> {
        let entry = self.pending.remove(id)?;
        if let Some(ref rid) = entry.response_id {
            self.by_response.remove(rid);
        }
        Some(entry)
    }
}
