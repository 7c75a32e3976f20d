//! Events carried inside channel publications.
//!
//! Publication payloads are JSON objects discriminated by an optional `type`
//! field. They are decoded exactly once, at the transport boundary, into the
//! [`WireEvent`] sum type:
//!
//! | `type`            | Variant                   | Buffered? |
//! |-------------------|---------------------------|-----------|
//! | `ping`            | [`WireEvent::Ping`]       | never (answered with a pong) |
//! | `read_receipt`    | [`WireEvent::ReadReceipt`]| never (logged) |
//! | absent, `message`, `direct_message` | [`WireEvent::Chat`] | yes |
//! | anything else     | [`WireEvent::Unknown`]    | yes, handled as a chat message |
//!
//! Payloads that are not objects (a bare string, a number, `null`) are also
//! chat messages: their text becomes the content and they carry no id.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Heartbeat request sent by the backend.
pub const PING: &str = "ping";
/// Read receipt notification.
pub const READ_RECEIPT: &str = "read_receipt";
/// Room chat message.
pub const CHAT_MESSAGE: &str = "message";
/// Direct (private channel) chat message.
pub const DIRECT_MESSAGE: &str = "direct_message";

/// Errors raised while decoding a publication payload.
#[derive(Debug, thiserror::Error)]
pub enum EventError {
    /// The payload is not valid JSON.
    #[error("malformed event json: {0}")]
    Json(#[from] serde_json::Error),
}

/// A chat message as delivered over a channel or returned by the send endpoint.
///
/// Accepts both the short field names (`from`, `to`) and the long ones used
/// by the REST API (`from_username`, `to_username`). Numeric ids are
/// normalised to strings; an empty id counts as absent. Text fields that are
/// `null` or missing decode as empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Backend-assigned identifier; the deduplication key when present.
    #[serde(
        default,
        deserialize_with = "lenient_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub id: Option<String>,
    /// Message body.
    #[serde(default, deserialize_with = "lenient_text")]
    pub content: String,
    /// Sender identity.
    #[serde(default, alias = "from_username", deserialize_with = "lenient_text")]
    pub from: String,
    /// Recipient identity for direct messages.
    #[serde(
        default,
        alias = "to_username",
        deserialize_with = "lenient_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub to: Option<String>,
    /// Backend timestamp (RFC 3339 in practice, kept verbatim).
    #[serde(
        default,
        deserialize_with = "lenient_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub timestamp: Option<String>,
    /// Raw `type` discriminant, if the payload carried one.
    #[serde(
        rename = "type",
        default,
        deserialize_with = "lenient_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub kind: Option<String>,
}

impl ChatMessage {
    /// Creates a room message from `from` with the given content.
    pub fn new(from: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: None,
            content: content.into(),
            from: from.into(),
            to: None,
            timestamp: None,
            kind: Some(CHAT_MESSAGE.to_string()),
        }
    }

    /// Sets the message id.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Marks the message as a direct message to `recipient`.
    #[must_use]
    pub fn with_recipient(mut self, recipient: impl Into<String>) -> Self {
        self.to = Some(recipient.into());
        self.kind = Some(DIRECT_MESSAGE.to_string());
        self
    }

    /// Sets the timestamp.
    #[must_use]
    pub fn with_timestamp(mut self, timestamp: impl Into<String>) -> Self {
        self.timestamp = Some(timestamp.into());
        self
    }

    /// Returns `true` for direct messages.
    #[must_use]
    pub const fn is_direct(&self) -> bool {
        self.to.is_some()
    }
}

/// A read receipt notification. Never placed in the message buffer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadReceipt {
    /// The message that was read.
    #[serde(default, deserialize_with = "lenient_string")]
    pub message_id: Option<String>,
    /// Who read it.
    #[serde(default, alias = "username", deserialize_with = "lenient_text")]
    pub read_by: String,
    /// When it was read.
    #[serde(default, deserialize_with = "lenient_string")]
    pub timestamp: Option<String>,
}

/// A decoded publication payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireEvent {
    /// Heartbeat from the backend; must be answered with a pong.
    Ping {
        /// Backend timestamp, if provided.
        timestamp: Option<String>,
    },
    /// Read receipt; logged only.
    ReadReceipt(ReadReceipt),
    /// A recognised chat message.
    Chat(ChatMessage),
    /// An unrecognised `type`; handled as a chat message.
    Unknown {
        /// The unrecognised discriminant.
        kind: String,
        /// The payload decoded as a chat message.
        message: ChatMessage,
    },
}

impl WireEvent {
    /// Decodes a publication payload from JSON text.
    ///
    /// # Errors
    ///
    /// Returns [`EventError`] if the text is not valid JSON.
    pub fn decode(text: &str) -> Result<Self, EventError> {
        Self::from_value(serde_json::from_str(text)?)
    }

    /// Decodes an already-parsed publication payload.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::Json`] if a field has an incompatible type.
    pub fn from_value(value: Value) -> Result<Self, EventError> {
        if !value.is_object() {
            let content = match &value {
                Value::Null => String::new(),
                Value::String(s) => s.clone(),
                other => scalar_text(other).unwrap_or_else(|| other.to_string()),
            };
            return Ok(Self::Chat(ChatMessage {
                id: None,
                content,
                from: String::new(),
                to: None,
                timestamp: None,
                kind: None,
            }));
        }
        let kind = value.get("type").and_then(Value::as_str).map(str::to_owned);
        match kind.as_deref() {
            Some(PING) => Ok(Self::Ping {
                timestamp: value.get("timestamp").and_then(scalar_text),
            }),
            Some(READ_RECEIPT) => Ok(Self::ReadReceipt(serde_json::from_value(value)?)),
            None | Some(CHAT_MESSAGE | DIRECT_MESSAGE) => {
                Ok(Self::Chat(serde_json::from_value(value)?))
            }
            Some(other) => {
                let kind = other.to_string();
                Ok(Self::Unknown {
                    kind,
                    message: serde_json::from_value(value)?,
                })
            }
        }
    }

    /// Returns `true` for heartbeat events.
    #[must_use]
    pub const fn is_ping(&self) -> bool {
        matches!(self, Self::Ping { .. })
    }

    /// The chat message carried by this event, if it is buffered.
    #[must_use]
    pub fn into_chat(self) -> Option<ChatMessage> {
        match self {
            Self::Chat(message) | Self::Unknown { message, .. } => Some(message),
            Self::Ping { .. } | Self::ReadReceipt(_) => None,
        }
    }
}

/// Renders a JSON scalar as text; `None` for null, arrays and objects.
fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Like [`lenient_string`], with absent text as the empty string.
fn lenient_text<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(lenient_string(deserializer)?.unwrap_or_default())
}

/// Accepts a string or number and yields it as an optional string.
fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(scalar_text))
}
