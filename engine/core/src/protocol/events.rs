//! Frame payloads
//!
//! Field layout follows the backend's JSON exactly; optional fields default so
//! that only the fields the engine relies on are required.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::EventId;

/// Output modality
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Modality {
    /// Text output
    Text,
    /// Audio output
    Audio,
}

// ============================================================================
// Outbound payloads
// ============================================================================

/// `session` object of a `session.update` frame
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// System instructions
    pub instructions: String,
    /// Requested output modalities
    pub modalities: Vec<Modality>,
    /// Tool definitions, passed through untouched
    #[serde(default)]
    pub tools: Vec<Value>,
    /// Tool selection policy
    pub tool_choice: String,
    /// Voice name for audio output
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            instructions: String::new(),
            modalities: vec![Modality::Text],
            tools: Vec::new(),
            tool_choice: "auto".to_string(),
            voice: None,
        }
    }
}

/// Conversation item type
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemKind {
    /// A chat message
    Message,
}

/// Author of a conversation item
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// End user
    User,
    /// Model output
    Assistant,
    /// System message
    System,
}

/// One content part of a message item
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ContentPart {
    /// User-authored text
    #[serde(rename = "input_text")]
    InputText {
        /// The text
        text: String,
    },
    /// Assistant-authored text
    #[serde(rename = "text")]
    Text {
        /// The text
        text: String,
    },
}

impl ContentPart {
    /// The text of this part
    #[must_use]
    pub fn text(&self) -> &str {
        match self {
            Self::InputText { text } | Self::Text { text } => text,
        }
    }
}

/// `item` object of a `conversation.item.create` frame
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConversationItem {
    /// Item type
    #[serde(rename = "type")]
    pub kind: ItemKind,
    /// Author
    pub role: Role,
    /// Content parts
    pub content: Vec<ContentPart>,
}

impl ConversationItem {
    /// A user message with a single text part
    pub fn user_text(text: impl Into<String>) -> Self {
        Self {
            kind: ItemKind::Message,
            role: Role::User,
            content: vec![ContentPart::InputText { text: text.into() }],
        }
    }

    /// An assistant message with a single text part, used to replay history
    pub fn assistant_text(text: impl Into<String>) -> Self {
        Self {
            kind: ItemKind::Message,
            role: Role::Assistant,
            content: vec![ContentPart::Text { text: text.into() }],
        }
    }

    /// Concatenated text of all parts
    #[must_use]
    pub fn text(&self) -> String {
        self.content.iter().map(ContentPart::text).collect()
    }
}

/// `response` object of a `response.create` frame
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResponseParams {
    /// Requested output modalities
    pub modalities: Vec<Modality>,
    /// Per-response instruction override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

impl ResponseParams {
    /// Text-only response with session instructions
    #[must_use]
    pub fn text() -> Self {
        Self {
            modalities: vec![Modality::Text],
            instructions: None,
        }
    }
}

impl Default for ResponseParams {
    fn default() -> Self {
        Self::text()
    }
}

// ============================================================================
// Inbound payloads
// ============================================================================

/// `session.created` / `session.updated`
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct SessionFrame {
    /// Echoed correlation id
    pub event_id: EventId,
    /// Session description
    pub session: SessionObject,
}

/// Server-side session description
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct SessionObject {
    /// Session id
    pub id: String,
    /// Model serving the session
    pub model: String,
    /// Expiry as unix seconds
    #[serde(default)]
    pub expires_at: Option<i64>,
    /// Active output modalities
    #[serde(default)]
    pub modalities: Vec<Modality>,
    /// Active voice
    #[serde(default)]
    pub voice: Option<String>,
}

/// Negotiated session details handed back to the caller
#[derive(Clone, Debug, PartialEq)]
pub struct SessionInfo {
    /// Session id
    pub id: String,
    /// Model serving the session
    pub model: String,
    /// When the backend will expire the session
    pub expires_at: Option<DateTime<Utc>>,
    /// Active output modalities
    pub modalities: Vec<Modality>,
    /// Active voice
    pub voice: Option<String>,
}

impl From<&SessionObject> for SessionInfo {
    fn from(session: &SessionObject) -> Self {
        Self {
            id: session.id.clone(),
            model: session.model.clone(),
            expires_at: session
                .expires_at
                .and_then(|secs| DateTime::from_timestamp(secs, 0)),
            modalities: session.modalities.clone(),
            voice: session.voice.clone(),
        }
    }
}

/// `conversation.item.created`
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct ItemCreatedFrame {
    /// Echoed correlation id
    pub event_id: EventId,
    /// Created item
    pub item: ItemObject,
}

/// Server-side item description
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct ItemObject {
    /// Item id
    pub id: String,
}

/// `response.created`
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct ResponseCreatedFrame {
    /// Echoed correlation id
    pub event_id: EventId,
    /// Created response
    pub response: ResponseObject,
}

/// Server-side response description
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct ResponseObject {
    /// Response id
    pub id: String,
    /// `in_progress`, `completed`, `cancelled`, `failed`, ...
    #[serde(default)]
    pub status: Option<String>,
    /// Token usage, passed through untouched
    #[serde(default)]
    pub usage: Option<Value>,
}

/// `response.text.delta`
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct TextDeltaFrame {
    /// Echoed correlation id
    #[serde(default)]
    pub event_id: Option<EventId>,
    /// Server response id
    #[serde(default)]
    pub response_id: Option<String>,
    /// Text fragment
    pub delta: String,
}

/// `response.text.done`
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct TextDoneFrame {
    /// Echoed correlation id
    #[serde(default)]
    pub event_id: Option<EventId>,
    /// Server response id
    #[serde(default)]
    pub response_id: Option<String>,
    /// Full text of the content part
    pub text: String,
}

/// `response.done`
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct ResponseDoneFrame {
    /// Echoed correlation id
    #[serde(default)]
    pub event_id: Option<EventId>,
    /// Finished response
    pub response: ResponseObject,
}

/// `error`
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct ErrorFrame {
    /// Id of the error event itself
    #[serde(default)]
    pub event_id: Option<EventId>,
    /// Error details
    pub error: ErrorDetail,
}

/// Error details of an `error` frame
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct ErrorDetail {
    /// Error class, e.g. `invalid_request_error`
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    /// Machine-readable code
    #[serde(default)]
    pub code: Option<String>,
    /// Human-readable message
    pub message: String,
    /// Id of the client event that caused the error
    #[serde(default)]
    pub event_id: Option<EventId>,
}

impl ErrorDetail {
    /// Whether the backend is reporting that the session expired
    #[must_use]
    pub fn is_session_expired(&self) -> bool {
        self.code.as_deref() == Some("session_expired")
            || self.message.to_lowercase().contains("session expired")
    }
}
