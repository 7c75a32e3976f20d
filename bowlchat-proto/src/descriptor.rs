//! Connection descriptors and channel naming.
//!
//! A [`ConnectionDescriptor`] is what the token endpoint hands back: where to
//! connect, which short-lived token to present, and which channels to join.
//! [`ChannelLayout`] captures the naming convention shared by client and
//! broker: one fixed room channel plus one private channel per identity.

use serde::{Deserialize, Serialize};

/// Default name of the shared room channel.
pub const DEFAULT_ROOM_CHANNEL: &str = "room:main";

/// Default prefix for per-identity private channels.
pub const DEFAULT_PRIVATE_PREFIX: &str = "user:";

/// Errors raised when a descriptor cannot be used for a connection attempt.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DescriptorError {
    /// The transport URL is empty.
    #[error("descriptor has an empty transport url")]
    EmptyUrl,
    /// The auth token is empty.
    #[error("descriptor has an empty auth token")]
    EmptyToken,
}

/// Short-lived connection parameters returned by the token endpoint.
///
/// Never cached across reconnects: every connection attempt fetches a fresh
/// one because tokens are single-use.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionDescriptor {
    /// WebSocket URL of the broker (`ws://` or `wss://`).
    pub url: String,
    /// Token presented in the connect handshake.
    pub token: String,
    /// Channels to subscribe, in the order they should be joined.
    #[serde(default)]
    pub channels: Vec<String>,
}

impl ConnectionDescriptor {
    /// Checks that the descriptor carries a URL and a token.
    ///
    /// # Errors
    ///
    /// Returns [`DescriptorError`] naming the first missing field.
    pub fn validate(&self) -> Result<(), DescriptorError> {
        if self.url.trim().is_empty() {
            return Err(DescriptorError::EmptyUrl);
        }
        if self.token.trim().is_empty() {
            return Err(DescriptorError::EmptyToken);
        }
        Ok(())
    }
}

/// Naming convention for the room channel and private channels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelLayout {
    room: String,
    private_prefix: String,
}

impl Default for ChannelLayout {
    fn default() -> Self {
        Self::new(DEFAULT_ROOM_CHANNEL, DEFAULT_PRIVATE_PREFIX)
    }
}

impl ChannelLayout {
    /// Creates a layout with the given room channel and private prefix.
    pub fn new(room: impl Into<String>, private_prefix: impl Into<String>) -> Self {
        Self {
            room: room.into(),
            private_prefix: private_prefix.into(),
        }
    }

    /// Name of the shared room channel.
    #[must_use]
    pub fn room(&self) -> &str {
        &self.room
    }

    /// Prefix used for private channels.
    #[must_use]
    pub fn private_prefix(&self) -> &str {
        &self.private_prefix
    }

    /// Returns `true` if `channel` is the shared room channel.
    #[must_use]
    pub fn is_room(&self, channel: &str) -> bool {
        channel == self.room
    }

    /// Name of the private channel for `identity`.
    #[must_use]
    pub fn private_channel(&self, identity: &str) -> String {
        format!("{}{identity}", self.private_prefix)
    }

    /// Extracts the identity from a private channel name.
    ///
    /// Returns `None` for the room channel or any name outside the prefix.
    #[must_use]
    pub fn owner_of<'a>(&self, channel: &'a str) -> Option<&'a str> {
        channel
            .strip_prefix(self.private_prefix.as_str())
            .filter(|identity| !identity.is_empty())
    }

    /// The channels an identity is entitled to, room first.
    #[must_use]
    pub fn channels_for(&self, identity: &str) -> Vec<String> {
        vec![self.room.clone(), self.private_channel(identity)]
    }
}
