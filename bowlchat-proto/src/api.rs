//! Request and response bodies for the REST endpoints around the channel.

use serde::{Deserialize, Serialize};

/// Body of `POST /messages`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendRequest {
    /// Message body.
    pub content: String,
    /// Recipient for a direct message; `None` posts to the room.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_username: Option<String>,
}

/// Error body returned by the REST endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Human-readable reason.
    pub detail: String,
}
