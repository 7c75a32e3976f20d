//! Broker frames exchanged over the real-time connection.
//!
//! Every WebSocket text frame is one JSON object tagged by `type`. The client
//! opens with [`ClientFrame::Connect`] and the broker answers with
//! [`ServerFrame::Connected`]; after that subscriptions, publications,
//! presence and heartbeats are multiplexed over the same connection.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::presence::ClientInfo;

/// Frames sent by the client to the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Authenticates the connection. Must be the first frame.
    Connect {
        /// Token from the connection descriptor.
        token: String,
    },
    /// Subscribes to a channel.
    Subscribe {
        /// Channel name.
        channel: String,
    },
    /// Leaves a channel.
    Unsubscribe {
        /// Channel name.
        channel: String,
    },
    /// Requests a presence snapshot for a subscribed channel.
    Presence {
        /// Channel name.
        channel: String,
    },
    /// Heartbeat reply; serializes to exactly `{"type":"pong"}`.
    Pong,
}

/// Frames sent by the broker to the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Handshake accepted.
    Connected {
        /// Transport-level id assigned to this connection.
        client: String,
        /// Identity the token was issued to.
        user: String,
    },
    /// A subscription is active.
    Subscribed {
        /// Channel name.
        channel: String,
    },
    /// A subscription request was refused.
    SubscribeError {
        /// Channel name.
        channel: String,
        /// Broker-provided reason.
        message: String,
    },
    /// A subscription was removed.
    Unsubscribed {
        /// Channel name.
        channel: String,
    },
    /// A payload published to a channel.
    Publication {
        /// Channel name.
        channel: String,
        /// Event payload, decoded with [`crate::event::WireEvent`].
        data: Value,
    },
    /// A client joined a channel.
    Join {
        /// Channel name.
        channel: String,
        /// The joining client.
        info: ClientInfo,
    },
    /// A client left a channel.
    Leave {
        /// Channel name.
        channel: String,
        /// The leaving client.
        info: ClientInfo,
    },
    /// Presence snapshot for a channel.
    Presence {
        /// Channel name.
        channel: String,
        /// Raw snapshot, normalized with [`crate::presence::normalize_snapshot`].
        clients: Value,
    },
    /// Connection-level heartbeat; must be answered with [`ClientFrame::Pong`].
    Ping {
        /// Broker timestamp, if provided.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<String>,
    },
    /// Connection-level error that does not by itself close the link.
    Error {
        /// Human-readable description.
        message: String,
    },
}

impl ServerFrame {
    /// The channel a frame refers to, if any.
    #[must_use]
    pub fn channel(&self) -> Option<&str> {
        match self {
            Self::Subscribed { channel }
            | Self::SubscribeError { channel, .. }
            | Self::Unsubscribed { channel }
            | Self::Publication { channel, .. }
            | Self::Join { channel, .. }
            | Self::Leave { channel, .. }
            | Self::Presence { channel, .. } => Some(channel),
            Self::Connected { .. } | Self::Ping { .. } | Self::Error { .. } => None,
        }
    }
}

/// Error type for frame encode/decode operations.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The text is not a valid frame.
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Encodes a client frame as JSON text.
///
/// # Errors
///
/// Returns [`FrameError::Malformed`] if serialization fails.
pub fn encode_client(frame: &ClientFrame) -> Result<String, FrameError> {
    Ok(serde_json::to_string(frame)?)
}

/// Decodes a client frame from JSON text.
///
/// # Errors
///
/// Returns [`FrameError::Malformed`] for invalid JSON or an unknown `type`.
pub fn decode_client(text: &str) -> Result<ClientFrame, FrameError> {
    Ok(serde_json::from_str(text)?)
}

/// Encodes a server frame as JSON text.
///
/// # Errors
///
/// Returns [`FrameError::Malformed`] if serialization fails.
pub fn encode_server(frame: &ServerFrame) -> Result<String, FrameError> {
    Ok(serde_json::to_string(frame)?)
}

/// Decodes a server frame from JSON text.
///
/// # Errors
///
/// Returns [`FrameError::Malformed`] for invalid JSON or an unknown `type`.
pub fn decode_server(text: &str) -> Result<ServerFrame, FrameError> {
    Ok(serde_json::from_str(text)?)
}
