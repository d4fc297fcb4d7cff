//! Wire Protocol
//!
//! JSON text frames exchanged with the realtime backend. Outbound frames are
//! [`ClientEvent`]s; inbound frames decode into [`ServerEvent`]s.
//!
//! Decoding is two-step: the `type` tag selects a payload struct, and the
//! payload is validated by serde. A frame whose payload is missing required
//! fields is a [`EngineError::ProtocolAnomaly`]. Unknown frame types decode to
//! [`ServerEvent::Unrecognized`] because the backend emits many event types the
//! engine has no use for.

mod events;

pub use events::{
    ContentPart, ConversationItem, ErrorDetail, ErrorFrame, ItemCreatedFrame, ItemKind,
    ItemObject, Modality, ResponseCreatedFrame, ResponseDoneFrame, ResponseObject,
    ResponseParams, Role, SessionConfig, SessionFrame, SessionInfo, SessionObject,
    TextDeltaFrame, TextDoneFrame,
};

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::EngineError;

/// Largest inbound frame accepted (bytes)
pub const MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;

// ============================================================================
// Correlation ids
// ============================================================================

/// Correlation token carried in the `event_id` field of a frame
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(pub String);

impl EventId {
    /// Generate a fresh, unique event id
    #[must_use]
    pub fn new() -> Self {
        Self(format!("evt_{}", uuid::Uuid::new_v4().simple()))
    }

    /// Borrow the raw id
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for EventId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// ============================================================================
// Outbound
// ============================================================================

/// Frames the engine sends to the backend
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    /// Configure the session
    #[serde(rename = "session.update")]
    SessionUpdate {
        /// Correlation id
        event_id: EventId,
        /// Requested session parameters
        session: SessionConfig,
    },

    /// Append an item to the conversation
    #[serde(rename = "conversation.item.create")]
    ItemCreate {
        /// Correlation id
        event_id: EventId,
        /// The item to append
        item: ConversationItem,
    },

    /// Ask the backend to produce a response
    #[serde(rename = "response.create")]
    ResponseCreate {
        /// Correlation id
        event_id: EventId,
        /// Response parameters
        response: ResponseParams,
    },

    /// Abort an in-progress response
    #[serde(rename = "response.cancel")]
    ResponseCancel {
        /// Id of this notice
        event_id: EventId,
        /// Server response id, if one was assigned
        #[serde(default, skip_serializing_if = "Option::is_none")]
        response_id: Option<String>,
    },
}

impl ClientEvent {
    /// The correlation id of this frame
    #[must_use]
    pub fn event_id(&self) -> &EventId {
        match self {
            Self::SessionUpdate { event_id, .. }
            | Self::ItemCreate { event_id, .. }
            | Self::ResponseCreate { event_id, .. }
            | Self::ResponseCancel { event_id, .. } => event_id,
        }
    }

    /// Wire name of the frame type
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::SessionUpdate { .. } => "session.update",
            Self::ItemCreate { .. } => "conversation.item.create",
            Self::ResponseCreate { .. } => "response.create",
            Self::ResponseCancel { .. } => "response.cancel",
        }
    }
}

/// Serialize an outbound frame to JSON text
///
/// # Errors
///
/// Returns `InvalidInput` if the frame cannot be serialized.
pub fn encode(event: &ClientEvent) -> Result<String, EngineError> {
    serde_json::to_string(event)
        .map_err(|e| EngineError::InvalidInput(format!("Failed to encode {}: {e}", event.type_name())))
}

// ============================================================================
// Inbound
// ============================================================================

/// Discriminant of an inbound frame, used for guard checks and dispatch
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum InboundKind {
    /// `session.created`
    SessionCreated,
    /// `session.updated`
    SessionUpdated,
    /// `conversation.item.created`
    ItemCreated,
    /// `response.created`
    ResponseCreated,
    /// `response.text.delta`
    TextDelta,
    /// `response.text.done`
    TextDone,
    /// `response.done`
    ResponseDone,
    /// `error`
    Error,
    /// Any type the engine does not handle
    Unrecognized,
}

impl fmt::Display for InboundKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::SessionCreated => "session.created",
            Self::SessionUpdated => "session.updated",
            Self::ItemCreated => "conversation.item.created",
            Self::ResponseCreated => "response.created",
            Self::TextDelta => "response.text.delta",
            Self::TextDone => "response.text.done",
            Self::ResponseDone => "response.done",
            Self::Error => "error",
            Self::Unrecognized => "unrecognized",
        };
        f.write_str(name)
    }
}

/// Frames the backend sends to the engine
#[derive(Clone, Debug, PartialEq)]
pub enum ServerEvent {
    /// Session was created (solicited or announced)
    SessionCreated(SessionFrame),
    /// Session parameters were applied
    SessionUpdated(SessionFrame),
    /// Conversation item was appended
    ItemCreated(ItemCreatedFrame),
    /// Response generation started
    ResponseCreated(ResponseCreatedFrame),
    /// Streamed text fragment
    TextDelta(TextDeltaFrame),
    /// Final text of a content part
    TextDone(TextDoneFrame),
    /// Response generation finished
    ResponseDone(ResponseDoneFrame),
    /// Backend error
    Error(ErrorFrame),
    /// A frame type the engine ignores
    Unrecognized {
        /// The raw `type` tag
        kind: String,
    },
}

/// Ids an inbound frame can be matched on
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Correlation<'a> {
    /// Echoed `event_id`, or `error.event_id`
    pub event_id: Option<&'a EventId>,
    /// Server response id
    pub response_id: Option<&'a str>,
}

impl ServerEvent {
    /// Discriminant for dispatch
    #[must_use]
    pub fn kind(&self) -> InboundKind {
        match self {
            Self::SessionCreated(_) => InboundKind::SessionCreated,
            Self::SessionUpdated(_) => InboundKind::SessionUpdated,
            Self::ItemCreated(_) => InboundKind::ItemCreated,
            Self::ResponseCreated(_) => InboundKind::ResponseCreated,
            Self::TextDelta(_) => InboundKind::TextDelta,
            Self::TextDone(_) => InboundKind::TextDone,
            Self::ResponseDone(_) => InboundKind::ResponseDone,
            Self::Error(_) => InboundKind::Error,
            Self::Unrecognized { .. } => InboundKind::Unrecognized,
        }
    }

    /// Reduce the frame to the ids it can be correlated by
    #[must_use]
    pub fn correlation(&self) -> Correlation<'_> {
        match self {
            Self::SessionCreated(f) | Self::SessionUpdated(f) => Correlation {
                event_id: Some(&f.event_id),
                response_id: None,
            },
            Self::ItemCreated(f) => Correlation {
                event_id: Some(&f.event_id),
                response_id: None,
            },
            Self::ResponseCreated(f) => Correlation {
                event_id: Some(&f.event_id),
                response_id: Some(&f.response.id),
            },
            Self::TextDelta(f) => Correlation {
                event_id: f.event_id.as_ref(),
                response_id: f.response_id.as_deref(),
            },
            Self::TextDone(f) => Correlation {
                event_id: f.event_id.as_ref(),
                response_id: f.response_id.as_deref(),
            },
            Self::ResponseDone(f) => Correlation {
                event_id: f.event_id.as_ref(),
                response_id: Some(&f.response.id),
            },
            Self::Error(f) => Correlation {
                event_id: f.error.event_id.as_ref().or(f.event_id.as_ref()),
                response_id: None,
            },
            Self::Unrecognized { .. } => Correlation::default(),
        }
    }
}

/// Decode one inbound text frame
///
/// # Errors
///
/// Returns `ProtocolAnomaly` for oversized frames, invalid JSON, a missing
/// `type` tag, or a known type whose required fields are absent.
pub fn decode(text: &str) -> Result<ServerEvent, EngineError> {
    if text.len() > MAX_FRAME_SIZE {
        return Err(EngineError::ProtocolAnomaly(format!(
            "Frame too large: {} bytes (max: {MAX_FRAME_SIZE})",
            text.len()
        )));
    }

    let value: Value = serde_json::from_str(text)
        .map_err(|e| EngineError::ProtocolAnomaly(format!("Malformed frame: {e}")))?;

    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| EngineError::ProtocolAnomaly("Frame has no type tag".to_string()))?
        .to_owned();

    let event = match kind.as_str() {
        "session.created" => ServerEvent::SessionCreated(payload(&kind, value)?),
        "session.updated" => ServerEvent::SessionUpdated(payload(&kind, value)?),
        "conversation.item.created" => ServerEvent::ItemCreated(payload(&kind, value)?),
        "response.created" => ServerEvent::ResponseCreated(payload(&kind, value)?),
        "response.text.delta" => {
            let frame: TextDeltaFrame = payload(&kind, value)?;
            require_correlation(&kind, frame.event_id.as_ref(), frame.response_id.as_deref())?;
            ServerEvent::TextDelta(frame)
        }
        "response.text.done" => {
            let frame: TextDoneFrame = payload(&kind, value)?;
            require_correlation(&kind, frame.event_id.as_ref(), frame.response_id.as_deref())?;
            ServerEvent::TextDone(frame)
        }
        "response.done" => ServerEvent::ResponseDone(payload(&kind, value)?),
        "error" => ServerEvent::Error(payload(&kind, value)?),
        _ => ServerEvent::Unrecognized { kind },
    };

    Ok(event)
}

fn payload<T: DeserializeOwned>(kind: &str, value: Value) -> Result<T, EngineError> {
    serde_json::from_value(value)
        .map_err(|e| EngineError::ProtocolAnomaly(format!("Invalid {kind} frame: {e}")))
}

fn require_correlation(
    kind: &str,
    event_id: Option<&EventId>,
    response_id: Option<&str>,
) -> Result<(), EngineError> {
    if event_id.is_none() && response_id.is_none() {
        return Err(EngineError::ProtocolAnomaly(format!(
            "Invalid {kind} frame: neither event_id nor response_id present"
        )));
    }
    Ok(())
}
