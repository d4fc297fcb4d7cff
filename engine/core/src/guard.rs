//! Guard / Validator
//!
//! Stateless precondition checks consulted before every state-mutating action:
//! emitting a frame, starting a handshake, submitting a request, or accepting
//! an inbound frame. The guard never mutates and never retries; a denial is
//! turned into a typed error by the caller.
//!
//! Content validation for user text lives here too: a size cap and rejection
//! of control characters other than newline, tab, and carriage return.

use std::fmt;

use crate::connection::ConnectionState;
use crate::protocol::InboundKind;
use crate::session::SessionState;

/// Default message size cap (100KB)
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 100 * 1024;

/// Something the engine is about to do
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    /// Put a frame on the wire
    Transmit,
    /// Start a session handshake
    InitializeSession,
    /// Submit a `conversation.item.create`
    SubmitItem,
    /// Submit a `response.create`
    SubmitResponse,
    /// Move a ready session to active
    StartSession,
    /// End an active session
    EndSession,
    /// Accept an inbound frame
    Accept(InboundKind),
}

/// Limits the guard enforces
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GuardLimits {
    /// Cap on the pending set
    pub max_pending: usize,
    /// Cap on in-flight `response.create` requests
    pub max_concurrent_responses: usize,
}

/// Snapshot of engine state the guard decides on
#[derive(Clone, Copy, Debug)]
pub struct GuardContext<'a> {
    /// Current connection state
    pub connection: ConnectionState,
    /// Current session state
    pub session: &'a SessionState,
    /// Number of pending requests
    pub pending: usize,
    /// Number of in-flight `response.create` requests
    pub responses_in_flight: usize,
    /// Limits in force
    pub limits: GuardLimits,
}

/// Why an action was refused
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Denial {
    /// The connection is not up
    NotConnected {
        /// Connection state at the time
        state: ConnectionState,
    },
    /// A message was submitted before the session was ready
    SessionNotReady {
        /// Session phase at the time
        state: &'static str,
    },
    /// A handshake was requested while one is running or a session exists
    SessionAlreadyInitialized {
        /// Session phase at the time
        state: &'static str,
    },
    /// The pending set is full
    Backpressure {
        /// Configured cap
        limit: usize,
    },
    /// Too many responses are in flight
    ResponseInProgress {
        /// Configured cap
        limit: usize,
    },
    /// `start()` outside Ready, or `end()` outside Active
    InvalidTransition {
        /// Requested action
        action: &'static str,
        /// Session phase at the time
        state: &'static str,
    },
    /// An inbound frame arrived in a state that cannot accept it
    UnexpectedFrame {
        /// Frame kind
        kind: InboundKind,
        /// Session phase at the time
        state: &'static str,
    },
}

impl fmt::Display for Denial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotConnected { state } => write!(f, "not connected (state: {state})"),
            Self::SessionNotReady { state } => write!(f, "session not ready (state: {state})"),
            Self::SessionAlreadyInitialized { state } => {
                write!(f, "session already initialized (state: {state})")
            }
            Self::Backpressure { limit } => write!(f, "pending limit reached ({limit})"),
            Self::ResponseInProgress { limit } => {
                write!(f, "response already in progress (limit: {limit})")
            }
            Self::InvalidTransition { action, state } => {
                write!(f, "cannot {action} in state {state}")
            }
            Self::UnexpectedFrame { kind, state } => {
                write!(f, "unexpected {kind} in state {state}")
            }
        }
    }
}

/// Outcome of a guard check
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Verdict {
    /// Go ahead
    Allowed,
    /// Refused
    Denied(Denial),
}

impl Verdict {
    /// Check if the action is allowed
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }

    /// Convert into a `Result`
    ///
    /// # Errors
    ///
    /// Returns the denial when the action was refused.
    pub fn into_result(self) -> Result<(), Denial> {
        match self {
            Self::Allowed => Ok(()),
            Self::Denied(denial) => Err(denial),
        }
    }
}

/// Decide whether `action` may proceed given `ctx`
#[must_use]
pub fn check(action: Action, ctx: &GuardContext<'_>) -> Verdict {
    match decide(action, ctx) {
        Ok(()) => Verdict::Allowed,
        Err(denial) => Verdict::Denied(denial),
    }
}

fn decide(action: Action, ctx: &GuardContext<'_>) -> Result<(), Denial> {
    if !ctx.connection.is_connected() {
        return Err(Denial::NotConnected {
            state: ctx.connection,
        });
    }

    let phase = ctx.session.phase();

    match action {
        Action::Transmit => Ok(()),

        Action::InitializeSession => {
            if !matches!(
                ctx.session,
                SessionState::NotInitialized | SessionState::SessionError(_)
            ) {
                return Err(Denial::SessionAlreadyInitialized { state: phase });
            }
            has_capacity(ctx)
        }

        Action::SubmitItem => {
            require_ready(ctx)?;
            has_capacity(ctx)
        }

        Action::SubmitResponse => {
            require_ready(ctx)?;
            has_capacity(ctx)?;
            if ctx.responses_in_flight >= ctx.limits.max_concurrent_responses {
                return Err(Denial::ResponseInProgress {
                    limit: ctx.limits.max_concurrent_responses,
                });
            }
            Ok(())
        }

        Action::StartSession => match ctx.session {
            SessionState::Ready => Ok(()),
            _ => Err(Denial::InvalidTransition {
                action: "start",
                state: phase,
            }),
        },

        Action::EndSession => match ctx.session {
            SessionState::Active => Ok(()),
            _ => Err(Denial::InvalidTransition {
                action: "end",
                state: phase,
            }),
        },

        Action::Accept(kind) => accept(kind, ctx.session),
    }
}

fn require_ready(ctx: &GuardContext<'_>) -> Result<(), Denial> {
    if ctx.session.is_ready() {
        Ok(())
    } else {
        Err(Denial::SessionNotReady {
            state: ctx.session.phase(),
        })
    }
}

fn has_capacity(ctx: &GuardContext<'_>) -> Result<(), Denial> {
    if ctx.pending >= ctx.limits.max_pending {
        return Err(Denial::Backpressure {
            limit: ctx.limits.max_pending,
        });
    }
    Ok(())
}

fn accept(kind: InboundKind, session: &SessionState) -> Result<(), Denial> {
    let allowed = match kind {
        // Servers announce the session on connect, before any handshake
        InboundKind::SessionCreated | InboundKind::Error | InboundKind::Unrecognized => true,
        InboundKind::SessionUpdated => session.is_handshaking(),
        InboundKind::ItemCreated
        | InboundKind::ResponseCreated
        | InboundKind::TextDelta
        | InboundKind::TextDone
        | InboundKind::ResponseDone => session.is_ready(),
    };

    if allowed {
        Ok(())
    } else {
        Err(Denial::UnexpectedFrame {
            kind,
            state: session.phase(),
        })
    }
}

/// Validate caller-supplied message text
///
/// # Errors
///
/// Returns a description of the problem when the text is too large or
/// contains control characters other than `\n`, `\t`, `\r`.
pub fn validate_text(content: &str, max_bytes: usize) -> Result<(), String> {
    if content.len() > max_bytes {
        return Err(format!(
            "Message too large: {} bytes (max: {max_bytes})",
            content.len()
        ));
    }

    if content
        .chars()
        .any(|c| c.is_control() && c != '\n' && c != '\t' && c != '\r')
    {
        return Err("Message contains invalid control characters".to_string());
    }

    Ok(())
}
