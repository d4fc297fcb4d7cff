//! Session Negotiator
//!
//! Drives the handshake that turns a live connection into a ready session:
//!
//! ```text
//! NotInitialized ──initialize──► Initializing ──created──► WaitingUpdated ──updated──► Ready
//!       ▲                             │                        │                        │
//!       │                         timeout/error            timeout/error             start()
//!       │                             ▼                        ▼                        ▼
//!       │                        SessionError ──retry──► WaitingCreated ──created──►  Active
//!       └──────────────────────────────────────── end() ────────────────────────────────┘
//! ```
//!
//! Any loss of the connection forces `NotInitialized` from every state. The
//! negotiator holds the caller's result sink for the handshake; per-phase
//! deadlines are tracked by the correlator.

use std::fmt;

use tokio::sync::oneshot;

use crate::correlator::Completion;
use crate::error::EngineError;
use crate::protocol::{EventId, SessionConfig, SessionInfo};

/// Sink for the handshake result
pub(crate) type HandshakeSink = oneshot::Sender<Result<Completion, EngineError>>;

/// Logical session state
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// No session
    NotInitialized,
    /// `session.update` sent, waiting for `session.created`
    Initializing,
    /// Retry attempt sent, waiting for `session.created`
    WaitingCreated,
    /// `session.created` seen, waiting for `session.updated`
    WaitingUpdated,
    /// Handshake complete
    Ready,
    /// Conversation in progress
    Active,
    /// Handshake failed
    SessionError(String),
}

impl SessionState {
    /// Name of the state without payload
    #[must_use]
    pub fn phase(&self) -> &'static str {
        match self {
            Self::NotInitialized => "NotInitialized",
            Self::Initializing => "Initializing",
            Self::WaitingCreated => "WaitingCreated",
            Self::WaitingUpdated => "WaitingUpdated",
            Self::Ready => "Ready",
            Self::Active => "Active",
            Self::SessionError(_) => "SessionError",
        }
    }

    /// Check if messages may be submitted
    #[must_use]
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready | Self::Active)
    }

    /// Check if a handshake is running
    #[must_use]
    pub fn is_handshaking(&self) -> bool {
        matches!(
            self,
            Self::Initializing | Self::WaitingCreated | Self::WaitingUpdated
        )
    }

    /// Check if no session exists
    #[must_use]
    pub fn is_idle(&self) -> bool {
        matches!(self, Self::NotInitialized)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SessionError(reason) => write!(f, "SessionError ({reason})"),
            other => f.write_str(other.phase()),
        }
    }
}

/// What to do after a handshake phase failed
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum FailureOutcome {
    /// Re-send the update; this will be attempt `attempt`
    Retry {
        /// 1-based attempt number of the retry
        attempt: u32,
    },
    /// Out of attempts; the caller has been told
    Fatal,
}

#[derive(Debug)]
pub(crate) struct SessionNegotiator {
    state: SessionState,
    max_attempts: u32,
    attempt: u32,
    expected: Option<EventId>,
    params: Option<SessionConfig>,
    announced: Option<SessionInfo>,
    info: Option<SessionInfo>,
    waiter: Option<HandshakeSink>,
}

impl SessionNegotiator {
    pub(crate) fn new(max_attempts: u32) -> Self {
        Self {
            state: SessionState::NotInitialized,
            max_attempts: max_attempts.max(1),
            attempt: 0,
            expected: None,
            params: None,
            announced: None,
            info: None,
            waiter: None,
        }
    }

    pub(crate) fn state(&self) -> &SessionState {
        &self.state
    }

    pub(crate) fn info(&self) -> Option<&SessionInfo> {
        self.info.as_ref()
    }

    /// Correlation id of the last `session.update` sent
    pub(crate) fn expected(&self) -> Option<&EventId> {
        self.expected.as_ref()
    }

    pub(crate) fn params(&self) -> Option<&SessionConfig> {
        self.params.as_ref()
    }

    /// Nothing left from a previous connection
    pub(crate) fn is_reset(&self) -> bool {
        self.state.is_idle() && self.announced.is_none() && self.waiter.is_none()
    }

    /// Start a handshake; the guard has already checked the state
    pub(crate) fn begin(&mut self, id: EventId, params: SessionConfig, waiter: HandshakeSink) {
        self.state = SessionState::Initializing;
        self.attempt = 1;
        self.expected = Some(id);
        self.params = Some(params);
        self.info = None;
        self.waiter = Some(waiter);
    }

    /// Record the server's unsolicited session announcement
    pub(crate) fn announce(&mut self, info: SessionInfo) {
        tracing::debug!(session_id = %info.id, model = %info.model, "Session announced by server");
        self.announced = Some(info);
    }

    /// `session.created` echoing `id`
    pub(crate) fn on_created(&mut self, id: &EventId, info: SessionInfo) -> Result<(), EngineError> {
        self.check_expected(id, "session.created")?;
        match self.state {
            SessionState::Initializing | SessionState::WaitingCreated => {
                self.announced = Some(info);
                self.state = SessionState::WaitingUpdated;
                Ok(())
            }
            _ => Err(self.unexpected("session.created")),
        }
    }

    /// `session.updated` echoing `id`; completes the handshake
    pub(crate) fn on_updated(
        &mut self,
        id: &EventId,
        info: SessionInfo,
    ) -> Result<SessionInfo, EngineError> {
        self.check_expected(id, "session.updated")?;
        let accepted = match self.state {
            SessionState::WaitingUpdated => true,
            // Servers announce the session on connect and may skip the echo
            SessionState::Initializing | SessionState::WaitingCreated => self.announced.is_some(),
            _ => false,
        };
        if !accepted {
            return Err(self.unexpected("session.updated"));
        }

        self.state = SessionState::Ready;
        self.expected = None;
        self.info = Some(info.clone());
        if let Some(waiter) = self.waiter.take() {
            let _ = waiter.send(Ok(Completion::Session(info.clone())));
        }
        tracing::info!(
            session_id = %info.id,
            model = %info.model,
            attempt = self.attempt,
            "Session ready"
        );
        Ok(info)
    }

    /// A handshake phase timed out or was rejected
    pub(crate) fn fail(&mut self, reason: String) -> FailureOutcome {
        tracing::warn!(attempt = self.attempt, max = self.max_attempts, %reason, "Handshake failed");
        self.state = SessionState::SessionError(reason.clone());
        self.expected = None;

        if self.attempt < self.max_attempts {
            return FailureOutcome::Retry {
                attempt: self.attempt + 1,
            };
        }

        self.give_up(reason);
        FailureOutcome::Fatal
    }

    /// End the handshake for good, telling the caller why
    pub(crate) fn give_up(&mut self, reason: String) {
        if let Some(waiter) = self.waiter.take() {
            let _ = waiter.send(Err(EngineError::Session {
                reason: reason.clone(),
            }));
        }
        self.state = SessionState::SessionError(reason);
        self.expected = None;
        self.params = None;
    }

    /// Automatic retry sent with a fresh id
    pub(crate) fn retry(&mut self, id: EventId) {
        self.attempt += 1;
        self.expected = Some(id);
        self.state = SessionState::WaitingCreated;
    }

    /// Give up the running handshake with `err`
    pub(crate) fn abort(&mut self, err: EngineError) {
        if let Some(waiter) = self.waiter.take() {
            let _ = waiter.send(Err(err));
        }
        self.state = SessionState::NotInitialized;
        self.expected = None;
        self.params = None;
    }

    pub(crate) fn start(&mut self) {
        self.state = SessionState::Active;
    }

    pub(crate) fn end(&mut self) {
        self.clear();
    }

    /// Connection lost: forget everything
    pub(crate) fn reset(&mut self) {
        if let Some(waiter) = self.waiter.take() {
            let _ = waiter.send(Err(EngineError::SessionLost));
        }
        self.clear();
        self.announced = None;
    }

    fn clear(&mut self) {
        self.state = SessionState::NotInitialized;
        self.attempt = 0;
        self.expected = None;
        self.params = None;
        self.info = None;
    }

    fn check_expected(&self, id: &EventId, kind: &str) -> Result<(), EngineError> {
        if self.expected.as_ref() == Some(id) {
            Ok(())
        } else {
            Err(EngineError::ProtocolAnomaly(format!(
                "{kind} for {id} does not match the last session.update"
            )))
        }
    }

    fn unexpected(&self, kind: &str) -> EngineError {
        EngineError::ProtocolAnomaly(format!("{kind} in state {}", self.state.phase()))
    }
}
