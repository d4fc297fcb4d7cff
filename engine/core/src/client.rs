//! Realtime Client
//!
//! The engine's public face. A [`RealtimeClient`] owns one shared block
//! holding the configuration, the engine lock, and the connection driver.
//!
//! # Dispatch
//!
//! ```text
//! link ──► pump task ──► inbound queue ──► dispatch task ──► decode
//!                                                              │
//!                                 guard (Accept) ◄─────────────┘
//!                                       │
//!              ┌────────────────┬───────┴─────────┬──────────────────┐
//!              ▼                ▼                 ▼                  ▼
//!         negotiator        correlator        aggregator       engine events
//! ```
//!
//! Handlers run synchronously under the engine lock and never await. Every
//! mutation goes through `Shared::mutate`, which enforces that no session
//! state survives a connection that is not `Connected` and reports state
//! changes on the event channel.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, error, info, trace, warn};

use crate::aggregator::{CompletedResponse, ResponseAggregator};
use crate::config::EngineConfig;
use crate::connection::manager::{ConnectionManager, Inbound};
use crate::connection::{ConnectionCore, ConnectionState};
use crate::correlator::{Completion, EventCorrelator, PendingKind, Sink};
use crate::error::EngineError;
use crate::events::EngineEvent;
use crate::guard::{self, Action, Denial, GuardContext, GuardLimits, Verdict};
use crate::history::{ConversationMemory, Turn};
use crate::protocol::{
    self, ClientEvent, ConversationItem, ErrorDetail, EventId, InboundKind, ResponseParams,
    ServerEvent, SessionConfig, SessionInfo,
};
use crate::session::{FailureOutcome, SessionNegotiator, SessionState};
use crate::transport::{Connector, LinkHealth};

// ============================================================================
// Requests and handles
// ============================================================================

/// A request the caller can submit
#[derive(Clone, Debug, PartialEq)]
pub enum Request {
    /// Start the session handshake
    SessionUpdate(SessionConfig),
    /// Append an item to the conversation
    ItemCreate(ConversationItem),
    /// Ask the model for a response
    ResponseCreate(ResponseParams),
}

impl Request {
    fn action(&self) -> (Action, PendingKind) {
        match self {
            Self::SessionUpdate(_) => (Action::InitializeSession, PendingKind::SessionUpdate),
            Self::ItemCreate(_) => (Action::SubmitItem, PendingKind::ItemCreate),
            Self::ResponseCreate(_) => (Action::SubmitResponse, PendingKind::ResponseCreate),
        }
    }
}

/// Future resolving to the outcome of one submitted request
///
/// Dropping the handle does not cancel the request; it simply runs to its
/// deadline unobserved.
#[derive(Debug)]
pub struct ResponseHandle {
    id: EventId,
    kind: PendingKind,
    rx: oneshot::Receiver<Result<Completion, EngineError>>,
    shared: Weak<Shared>,
}

impl ResponseHandle {
    /// Correlation id of the request
    #[must_use]
    pub fn id(&self) -> &EventId {
        &self.id
    }

    /// Kind of the request
    #[must_use]
    pub fn kind(&self) -> PendingKind {
        self.kind
    }

    /// Cancel the request; returns `false` if it already finished
    pub fn cancel(&self) -> bool {
        self.canceller().cancel()
    }

    /// Detached cancel handle, usable while the handle is being awaited
    #[must_use]
    pub fn canceller(&self) -> Canceller {
        Canceller {
            id: self.id.clone(),
            shared: self.shared.clone(),
        }
    }
}

impl Future for ResponseHandle {
    type Output = Result<Completion, EngineError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.unwrap_or(Err(EngineError::SessionLost)))
    }
}

/// Cancels one request from anywhere
#[derive(Clone, Debug)]
pub struct Canceller {
    id: EventId,
    shared: Weak<Shared>,
}

impl Canceller {
    /// Cancel the request; returns `false` if it already finished
    pub fn cancel(&self) -> bool {
        self.shared
            .upgrade()
            .is_some_and(|shared| shared.cancel(&self.id))
    }
}

// ============================================================================
// Engine state
// ============================================================================

/// Everything guarded by the engine lock
pub(crate) struct Core {
    pub(crate) connection: ConnectionCore,
    pub(crate) session: SessionNegotiator,
    pub(crate) correlator: EventCorrelator,
    pub(crate) aggregator: ResponseAggregator,
    pub(crate) memory: ConversationMemory,
}

impl Core {
    fn new(config: &EngineConfig) -> Self {
        Self {
            connection: ConnectionCore::new(),
            session: SessionNegotiator::new(config.session.max_handshake_attempts),
            correlator: EventCorrelator::new(),
            aggregator: ResponseAggregator::new(),
            memory: ConversationMemory::new(config.history.max_turns),
        }
    }

    fn guard_context(&self, limits: GuardLimits) -> GuardContext<'_> {
        GuardContext {
            connection: self.connection.state(),
            session: self.session.state(),
            pending: self.correlator.len(),
            responses_in_flight: self.correlator.count(PendingKind::ResponseCreate),
            limits,
        }
    }

    fn denial_error(&self, denial: Denial) -> EngineError {
        match denial {
            Denial::Backpressure { limit } => EngineError::Backpressure { limit },
            Denial::NotConnected { .. } => match self.connection.exhausted() {
                Some(attempts) => EngineError::ConnectionExhausted { attempts },
                None => EngineError::NotConnected,
            },
            other => EngineError::Denied(other),
        }
    }

    fn holds_session_state(&self) -> bool {
        !self.session.is_reset() || !self.correlator.is_empty() || !self.aggregator.is_empty()
    }

    /// Resolve every pending request with `SessionLost`
    fn discard_pending(&mut self) -> usize {
        let drained = self.correlator.drain();
        let count = drained.len();
        for entry in drained {
            entry.resolve(Err(EngineError::SessionLost));
        }
        self.aggregator.clear();
        count
    }

    fn teardown(&mut self) -> usize {
        self.session.reset();
        self.discard_pending()
    }
}

/// State shared between the client, its background tasks, and handles
pub(crate) struct Shared {
    pub(crate) config: EngineConfig,
    pub(crate) core: Mutex<Core>,
    pub(crate) connection: ConnectionManager,
    pub(crate) inbound_tx: mpsc::UnboundedSender<Inbound>,
    events: Option<mpsc::UnboundedSender<EngineEvent>>,
}

impl std::fmt::Debug for Shared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shared")
            .field("connection", &self.connection)
            .finish_non_exhaustive()
    }
}

impl Shared {
    pub(crate) fn emit(&self, event: EngineEvent) {
        if let Some(ref tx) = self.events {
            let _ = tx.send(event);
        }
    }

    /// Run `f` against the core, then restore the connection/session
    /// pairing (no session unless connected) and report any state change
    pub(crate) fn mutate<R>(&self, core: &mut Core, f: impl FnOnce(&mut Core) -> R) -> R {
        let connection_before = core.connection.state();
        let session_before = core.session.state().clone();

        let result = f(core);

        if !core.connection.state().is_connected() && core.holds_session_state() {
            let discarded = core.teardown();
            info!(
                connection = %core.connection.state(),
                discarded,
                "Session torn down"
            );
        }

        let connection_after = core.connection.state();
        if connection_after != connection_before {
            debug!(from = %connection_before, to = %connection_after, "Connection state changed");
            self.emit(EngineEvent::ConnectionStateChanged {
                from: connection_before,
                to: connection_after,
            });
        }
        if core.session.state() != &session_before {
            let to = core.session.state().clone();
            debug!(from = %session_before, to = %to, "Session state changed");
            self.emit(EngineEvent::SessionStateChanged {
                from: session_before,
                to,
            });
        }

        result
    }

    fn limits(&self) -> GuardLimits {
        GuardLimits {
            max_pending: self.config.correlator.max_pending,
            max_concurrent_responses: self.config.correlator.max_concurrent_responses,
        }
    }

    fn check(&self, core: &Core, action: Action) -> Result<(), EngineError> {
        match guard::check(action, &core.guard_context(self.limits())) {
            Verdict::Allowed => Ok(()),
            Verdict::Denied(denial) => {
                debug!(?action, %denial, "Action denied");
                Err(core.denial_error(denial))
            }
        }
    }

    fn report_anomaly(&self, err: &EngineError) {
        warn!(error = %err, "Protocol anomaly");
        self.emit(EngineEvent::ProtocolAnomaly {
            detail: err.to_string(),
        });
    }

    // ------------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------------

    fn submit(self: &Arc<Self>, request: Request) -> Result<ResponseHandle, EngineError> {
        let (action, kind) = request.action();
        if let Request::ItemCreate(ref item) = request {
            guard::validate_text(&item.text(), self.config.correlator.max_message_bytes)
                .map_err(EngineError::InvalidInput)?;
        }

        let mut core = self.core.lock();
        self.check(&core, action)?;

        let id = EventId::new();
        let (tx, rx) = oneshot::channel();
        self.mutate(&mut core, |c| match request {
            Request::SessionUpdate(params) => {
                let event = ClientEvent::SessionUpdate {
                    event_id: id.clone(),
                    session: params.clone(),
                };
                self.transmit(c, &event, kind, Sink::Session, self.config.session_deadline())?;
                c.session.begin(id.clone(), params, tx);
                info!(event_id = %id, "Session handshake started");
                Ok(())
            }
            Request::ItemCreate(item) => {
                let event = ClientEvent::ItemCreate {
                    event_id: id.clone(),
                    item,
                };
                let deadline = self.config.units(self.config.correlator.item_deadline_units);
                self.transmit(c, &event, kind, Sink::Caller(tx), deadline)
            }
            Request::ResponseCreate(response) => {
                let event = ClientEvent::ResponseCreate {
                    event_id: id.clone(),
                    response,
                };
                let deadline = self.config.units(self.config.correlator.response_ack_units);
                self.transmit(c, &event, kind, Sink::Caller(tx), deadline)
            }
        })?;

        Ok(ResponseHandle {
            id,
            kind,
            rx,
            shared: Arc::downgrade(self),
        })
    }

    /// Send a request frame and track it until `timeout` elapses
    fn transmit(
        self: &Arc<Self>,
        c: &mut Core,
        event: &ClientEvent,
        kind: PendingKind,
        sink: Sink,
        timeout: Duration,
    ) -> Result<(), EngineError> {
        let text = protocol::encode(event)?;
        c.connection.send(text)?;

        let id = event.event_id().clone();
        let now = Instant::now();
        c.correlator.register(id.clone(), kind, now, now + timeout, sink)?;
        self.arm_timer(c, &id, now + timeout);
        debug!(event_id = %id, %kind, pending = c.correlator.len(), "Request sent");
        Ok(())
    }

    fn arm_timer(self: &Arc<Self>, c: &mut Core, id: &EventId, deadline: Instant) {
        let Some(generation) = c.correlator.rearm(id, deadline) else {
            return;
        };
        let weak = Arc::downgrade(self);
        let timer_id = id.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(shared) = weak.upgrade() {
                shared.on_deadline(&timer_id, generation);
            }
        });
        c.correlator.attach_timer(id, generation, timer.abort_handle());
    }

    fn cancel(&self, id: &EventId) -> bool {
        let mut core = self.core.lock();
        self.mutate(&mut core, |c| {
            let Some(entry) = c.correlator.take(id) else {
                return false;
            };
            let kind = entry.kind;
            match kind {
                PendingKind::SessionUpdate => c.session.abort(EngineError::Cancelled),
                PendingKind::ItemCreate => {
                    entry.resolve(Err(EngineError::Cancelled));
                }
                PendingKind::ResponseCreate => {
                    c.aggregator.discard(id);
                    let notice = ClientEvent::ResponseCancel {
                        event_id: EventId::new(),
                        response_id: entry.response_id.clone(),
                    };
                    // Best effort: the request is cancelled either way
                    if let Err(e) = protocol::encode(&notice).and_then(|text| c.connection.send(text)) {
                        debug!(event_id = %id, error = %e, "response.cancel not sent");
                    }
                    entry.resolve(Err(EngineError::Cancelled));
                }
            }
            info!(event_id = %id, %kind, "Request cancelled");
            true
        })
    }

    fn replay_history(self: &Arc<Self>, c: &mut Core) {
        if !self.config.history.replay_on_resume || c.memory.is_empty() {
            return;
        }
        let items = c.memory.replay_items();
        info!(items = items.len(), "Replaying conversation history");

        let deadline = self.config.units(self.config.correlator.item_deadline_units);
        for item in items {
            if c.correlator.len() >= self.config.correlator.max_pending {
                warn!("Pending set full, history replay truncated");
                break;
            }
            let event = ClientEvent::ItemCreate {
                event_id: EventId::new(),
                item,
            };
            if let Err(e) = self.transmit(c, &event, PendingKind::ItemCreate, Sink::Detached, deadline) {
                warn!(error = %e, "History replay aborted");
                break;
            }
        }
    }

    // ------------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------------

    fn on_frame(self: &Arc<Self>, generation: u64, text: &str) {
        let event = match protocol::decode(text) {
            Ok(event) => event,
            Err(e) => {
                self.report_anomaly(&e);
                return;
            }
        };
        if let ServerEvent::Unrecognized { ref kind } = event {
            debug!(%kind, "Ignoring frame");
            return;
        }

        let kind = event.kind();
        let mut core = self.core.lock();
        if generation != core.connection.generation() {
            debug!(generation, %kind, "Dropping frame from a replaced link");
            return;
        }

        let matched = core.correlator.lookup(&event.correlation());
        let verdict = guard::check(Action::Accept(kind), &core.guard_context(self.limits()));
        if let Verdict::Denied(denial) = verdict {
            drop(core);
            self.report_anomaly(&EngineError::Denied(denial));
            return;
        }

        debug!(%kind, event_id = ?matched, "Routing frame");
        let outcome = self.mutate(&mut core, |c| self.route(c, event, matched));
        drop(core);
        if let Err(e) = outcome {
            self.report_anomaly(&e);
        }
    }

    fn route(
        self: &Arc<Self>,
        c: &mut Core,
        event: ServerEvent,
        matched: Option<EventId>,
    ) -> Result<(), EngineError> {
        let kind = event.kind();
        match event {
            ServerEvent::SessionCreated(frame) => {
                let info = SessionInfo::from(&frame.session);
                match matched {
                    Some(id) if c.session.expected() == Some(&id) => {
                        c.session.on_created(&id, info)?;
                        self.arm_timer(c, &id, Instant::now() + self.config.session_deadline());
                        debug!(event_id = %id, "Session created, awaiting update");
                        Ok(())
                    }
                    Some(id) => Err(EngineError::ProtocolAnomaly(format!(
                        "session.created echoes {id}, which is not the current session.update"
                    ))),
                    // Only the first attempt may overlap the server's announcement
                    None if matches!(
                        c.session.state(),
                        SessionState::WaitingCreated | SessionState::WaitingUpdated
                    ) =>
                    {
                        Err(EngineError::ProtocolAnomaly(format!(
                            "session.created {} answers no current session.update",
                            frame.event_id
                        )))
                    }
                    None => {
                        c.session.announce(info);
                        Ok(())
                    }
                }
            }

            ServerEvent::SessionUpdated(frame) => {
                let Some(id) = matched.filter(|id| c.session.expected() == Some(id)) else {
                    return Err(EngineError::ProtocolAnomaly(
                        "session.updated matches no pending session.update".to_string(),
                    ));
                };
                c.session.on_updated(&id, SessionInfo::from(&frame.session))?;
                c.correlator.take(&id);
                self.replay_history(c);
                Ok(())
            }

            ServerEvent::ItemCreated(frame) => {
                let id = expect_pending(c, matched, PendingKind::ItemCreate, kind)?;
                if let Some(entry) = c.correlator.take(&id) {
                    debug!(event_id = %id, item_id = %frame.item.id, "Item created");
                    entry.resolve(Ok(Completion::Item {
                        item_id: frame.item.id,
                    }));
                }
                Ok(())
            }

            ServerEvent::ResponseCreated(frame) => {
                let id = expect_pending(c, matched, PendingKind::ResponseCreate, kind)?;
                c.correlator.bind_response(&id, &frame.response.id)?;
                c.aggregator.on_created(&id, &frame.response.id)?;

                // From here the whole stream is bound by the deadline since submission
                if let Some(created_at) = c.correlator.get(&id).map(|p| p.created_at) {
                    let deadline =
                        created_at + self.config.units(self.config.correlator.response_deadline_units);
                    self.arm_timer(c, &id, deadline);
                }
                debug!(event_id = %id, response_id = %frame.response.id, "Response started");
                Ok(())
            }

            ServerEvent::TextDelta(frame) => {
                let id = expect_pending(c, matched, PendingKind::ResponseCreate, kind)?;
                trace!(event_id = %id, len = frame.delta.len(), "Delta");
                c.aggregator.on_delta(&id, &frame.delta)
            }

            ServerEvent::TextDone(frame) => {
                let id = expect_pending(c, matched, PendingKind::ResponseCreate, kind)?;
                c.aggregator.on_text_done(&id, &frame.text)
            }

            ServerEvent::ResponseDone(frame) => {
                let id = expect_pending(c, matched, PendingKind::ResponseCreate, kind)?;
                let response = frame.response;
                let outcome = c
                    .aggregator
                    .on_done(&id, response.status.clone(), response.usage);
                let Some(entry) = c.correlator.take(&id) else {
                    return Ok(());
                };
                match outcome {
                    Ok(done) => {
                        let result = match response.status.as_deref() {
                            Some("cancelled") => Err(EngineError::Cancelled),
                            Some("failed") => Err(EngineError::Server {
                                code: None,
                                message: format!("response {} failed", done.response_id),
                            }),
                            _ => Ok(Completion::Response(done)),
                        };
                        debug!(event_id = %id, status = ?response.status, "Response done");
                        entry.resolve(result);
                        Ok(())
                    }
                    Err(e) => {
                        entry.resolve(Err(e.clone()));
                        Err(e)
                    }
                }
            }

            ServerEvent::Error(frame) => {
                self.on_server_error(c, matched, frame.error);
                Ok(())
            }

            ServerEvent::Unrecognized { .. } => Ok(()),
        }
    }

    fn on_server_error(self: &Arc<Self>, c: &mut Core, matched: Option<EventId>, detail: ErrorDetail) {
        if detail.is_session_expired() {
            warn!(message = %detail.message, "Session expired by server");
            self.emit(EngineEvent::SessionExpired);
            let generation = c.connection.generation();
            if c.connection.lost(generation) {
                self.connection.abandon_link();
                self.connection.schedule_reconnect(self);
            }
            return;
        }

        let Some(id) = matched else {
            warn!(code = ?detail.code, message = %detail.message, "Server error");
            self.emit(EngineEvent::ServerError {
                code: detail.code,
                message: detail.message,
            });
            return;
        };

        let kind = c.correlator.get(&id).map(|p| p.kind);
        if kind == Some(PendingKind::SessionUpdate) {
            self.handshake_failed(c, &id, format!("rejected by server: {}", detail.message));
        } else if let Some(entry) = c.correlator.take(&id) {
            c.aggregator.on_error(&id, &detail.message);
            warn!(event_id = %id, kind = %entry.kind, code = ?detail.code, message = %detail.message, "Request failed");
            entry.resolve(Err(EngineError::Server {
                code: detail.code,
                message: detail.message,
            }));
        }
    }

    fn handshake_failed(self: &Arc<Self>, c: &mut Core, id: &EventId, reason: String) {
        c.correlator.take(id);
        match c.session.fail(reason.clone()) {
            FailureOutcome::Retry { attempt } => {
                let Some(params) = c.session.params().cloned() else {
                    c.session.give_up(reason);
                    return;
                };
                let retry_id = EventId::new();
                let event = ClientEvent::SessionUpdate {
                    event_id: retry_id.clone(),
                    session: params,
                };
                let deadline = self.config.session_deadline();
                match self.transmit(c, &event, PendingKind::SessionUpdate, Sink::Session, deadline) {
                    Ok(()) => {
                        c.session.retry(retry_id);
                        warn!(attempt, %reason, "Retrying session handshake");
                        self.emit(EngineEvent::HandshakeRetry { attempt, reason });
                    }
                    Err(e) => c.session.give_up(format!("{reason}; retry not sent: {e}")),
                }
            }
            FailureOutcome::Fatal => error!(%reason, "Session handshake failed"),
        }
    }

    fn on_deadline(self: &Arc<Self>, id: &EventId, generation: u64) {
        let mut core = self.core.lock();
        self.mutate(&mut core, |c| {
            let Some(entry) = c.correlator.expire(id, generation) else {
                return;
            };
            let kind = entry.kind;
            let after = entry.deadline.saturating_duration_since(entry.created_at);

            if kind == PendingKind::SessionUpdate {
                let reason = format!("no reply within {:?}", self.config.session_deadline());
                self.handshake_failed(c, id, reason);
                return;
            }

            warn!(event_id = %id, %kind, ?after, "Request timed out");
            c.aggregator.discard(id);
            entry.resolve(Err(EngineError::Timeout { kind, after }));
        });
    }

    fn on_link_closed(self: &Arc<Self>, generation: u64, reason: &str) {
        let mut core = self.core.lock();
        if !self.mutate(&mut core, |c| c.connection.lost(generation)) {
            debug!(generation, %reason, "Ignoring close of a replaced link");
            return;
        }
        drop(core);
        warn!(generation, %reason, "Connection lost");
        self.connection.schedule_reconnect(self);
    }
}

/// The pending request a frame belongs to, which must be of `kind`
fn expect_pending(
    c: &Core,
    matched: Option<EventId>,
    kind: PendingKind,
    frame: InboundKind,
) -> Result<EventId, EngineError> {
    let Some(id) = matched else {
        return Err(EngineError::ProtocolAnomaly(format!(
            "{frame} matches no pending request"
        )));
    };
    match c.correlator.get(&id).map(|p| p.kind) {
        Some(found) if found == kind => Ok(id),
        Some(found) => Err(EngineError::ProtocolAnomaly(format!(
            "{frame} for {id}, which is a {found}"
        ))),
        None => Err(EngineError::ProtocolAnomaly(format!(
            "{frame} for {id}, which is no longer pending"
        ))),
    }
}

async fn dispatch(shared: Weak<Shared>, mut rx: mpsc::UnboundedReceiver<Inbound>) {
    while let Some(item) = rx.recv().await {
        let Some(engine) = shared.upgrade() else { break };
        match item {
            Inbound::Frame { generation, text } => engine.on_frame(generation, &text),
            Inbound::Closed { generation, reason } => engine.on_link_closed(generation, &reason),
        }
    }
    debug!("Dispatch loop stopped");
}

// ============================================================================
// Client
// ============================================================================

/// Counters over the lifetime of a client
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EngineStats {
    /// Responses assembled through `response.done`
    pub responses_completed: u64,
    /// Text deltas appended across all responses
    pub deltas_received: u64,
    /// Ping/pong counters of the current link, while connected
    pub link: Option<LinkHealth>,
}

/// Client-side engine for one realtime conversation
///
/// Must be created inside a Tokio runtime; it spawns its dispatch task on
/// construction. Dropping the client stops every background task.
pub struct RealtimeClient {
    shared: Arc<Shared>,
    dispatcher: AbortHandle,
}

impl RealtimeClient {
    /// Create a client without an event channel
    pub fn new<C: Connector>(config: EngineConfig, connector: C) -> Self {
        Self::build(config, Arc::new(connector), None)
    }

    /// Create a client and the stream of its [`EngineEvent`]s
    pub fn with_events<C: Connector>(
        config: EngineConfig,
        connector: C,
    ) -> (Self, UnboundedReceiverStream<EngineEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let client = Self::build(config, Arc::new(connector), Some(tx));
        (client, UnboundedReceiverStream::new(rx))
    }

    fn build(
        config: EngineConfig,
        connector: Arc<dyn Connector>,
        events: Option<mpsc::UnboundedSender<EngineEvent>>,
    ) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            core: Mutex::new(Core::new(&config)),
            connection: ConnectionManager::new(connector, &config),
            config,
            inbound_tx,
            events,
        });
        let dispatcher = tokio::spawn(dispatch(Arc::downgrade(&shared), inbound_rx)).abort_handle();

        Self { shared, dispatcher }
    }

    /// Establish the connection
    ///
    /// Returns at once if already connected. A connect during backoff cancels
    /// the pending retry and tries immediately.
    ///
    /// # Errors
    ///
    /// Returns `Connection` if the transport could not be opened in time.
    pub async fn connect(&self) -> Result<(), EngineError> {
        self.shared.connection.connect(&self.shared).await
    }

    /// Close the connection and stop reconnecting
    ///
    /// Pending requests resolve with `SessionLost`.
    pub fn disconnect(&self) {
        self.shared.connection.disconnect(&self.shared);
    }

    /// Session parameters built from the configuration
    #[must_use]
    pub fn default_session(&self) -> SessionConfig {
        SessionConfig::from(&self.shared.config.session)
    }

    /// Start the session handshake
    ///
    /// # Errors
    ///
    /// Fails fast if the connection is down or a session already exists.
    pub fn initialize_session(&self, params: SessionConfig) -> Result<ResponseHandle, EngineError> {
        self.shared.submit(Request::SessionUpdate(params))
    }

    /// Submit a request
    ///
    /// The guard decides synchronously; a denied request leaves no trace.
    ///
    /// # Errors
    ///
    /// `NotConnected`, `ConnectionExhausted`, `Backpressure`, `Denied`, or
    /// `InvalidInput` when the request cannot be sent now.
    pub fn submit(&self, request: Request) -> Result<ResponseHandle, EngineError> {
        self.shared.submit(request)
    }

    /// Cancel a pending request; returns `false` if it is not pending
    pub fn cancel(&self, id: &EventId) -> bool {
        self.shared.cancel(id)
    }

    /// Move a ready session to active
    ///
    /// # Errors
    ///
    /// Denied unless the session is `Ready`.
    pub fn start_session(&self) -> Result<(), EngineError> {
        let mut core = self.shared.core.lock();
        self.shared.check(&core, Action::StartSession)?;
        self.shared.mutate(&mut core, |c| c.session.start());
        info!("Session active");
        Ok(())
    }

    /// End an active session, keeping the connection
    ///
    /// Pending requests resolve with `SessionLost` and conversation memory is
    /// cleared.
    ///
    /// # Errors
    ///
    /// Denied unless the session is `Active`.
    pub fn end_session(&self) -> Result<(), EngineError> {
        let mut core = self.shared.core.lock();
        self.shared.check(&core, Action::EndSession)?;
        let discarded = self.shared.mutate(&mut core, |c| {
            let discarded = c.discard_pending();
            c.session.end();
            c.memory.clear();
            discarded
        });
        info!(discarded, "Session ended");
        Ok(())
    }

    /// Send a user message and wait for the full reply
    ///
    /// The exchange is remembered for replay after a reconnect.
    ///
    /// # Errors
    ///
    /// Any failure of the item or the response request.
    pub async fn send_message(&self, text: &str) -> Result<CompletedResponse, EngineError> {
        self.submit(Request::ItemCreate(ConversationItem::user_text(text)))?
            .await?;
        let response = self
            .submit(Request::ResponseCreate(ResponseParams::text()))?
            .await?
            .into_response()?;

        self.shared
            .core
            .lock()
            .memory
            .record(text, response.text.clone());
        Ok(response)
    }

    /// Current connection state
    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        self.shared.core.lock().connection.state()
    }

    /// Current session state
    #[must_use]
    pub fn session_state(&self) -> SessionState {
        self.shared.core.lock().session.state().clone()
    }

    /// Details of the ready session, if any
    #[must_use]
    pub fn session_info(&self) -> Option<SessionInfo> {
        self.shared.core.lock().session.info().cloned()
    }

    /// Number of requests awaiting a reply
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.shared.core.lock().correlator.len()
    }

    /// Ping/pong counters of the current link
    ///
    /// `None` while disconnected or before the link has been installed.
    #[must_use]
    pub fn link_health(&self) -> Option<LinkHealth> {
        if !self.connection_state().is_connected() {
            return None;
        }
        self.shared.connection.link_health()
    }

    /// Response and link counters
    #[must_use]
    pub fn stats(&self) -> EngineStats {
        let (responses_completed, deltas_received) = {
            let core = self.shared.core.lock();
            (
                core.aggregator.total_completed(),
                core.aggregator.total_deltas(),
            )
        };
        EngineStats {
            responses_completed,
            deltas_received,
            link: self.link_health(),
        }
    }

    /// Remembered turns, oldest first
    #[must_use]
    pub fn history(&self) -> Vec<Turn> {
        self.shared.core.lock().memory.turns().cloned().collect()
    }

    /// The configuration in force
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }
}

impl Drop for RealtimeClient {
    fn drop(&mut self) {
        self.dispatcher.abort();
        self.shared.connection.shutdown();
    }
}
