//! Arrival-ordered, id-deduplicated message buffer.
//!
//! Redelivery is normal on a pub/sub channel: a message can arrive on both
//! the room and a private channel, or again after a resubscribe. The buffer
//! keeps the first arrival and silently drops later copies that share an
//! id. Messages without an id are always appended.

use std::collections::HashSet;

use bowlchat_proto::event::ChatMessage;

/// Append-only sequence of chat messages with unique present ids.
#[derive(Debug, Default, Clone)]
pub struct MessageBuffer {
    messages: Vec<ChatMessage>,
    seen: HashSet<String>,
}

impl MessageBuffer {
    /// Creates an empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `message` unless its id is already present.
    ///
    /// Returns `true` when the message was appended.
    pub fn ingest(&mut self, message: ChatMessage) -> bool {
        if let Some(id) = &message.id {
            if !self.seen.insert(id.clone()) {
                tracing::trace!(id = %id, "dropping duplicate message");
                return false;
            }
        }
        self.messages.push(message);
        true
    }

    /// Whether a message with `id` has been buffered.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.seen.contains(id)
    }

    /// Number of buffered messages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Whether the buffer is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Messages in arrival order.
    pub fn iter(&self) -> impl Iterator<Item = &ChatMessage> {
        self.messages.iter()
    }

    /// Messages in arrival order, as a slice.
    #[must_use]
    pub fn as_slice(&self) -> &[ChatMessage] {
        &self.messages
    }

    /// Forgets every message, including the ids used for deduplication.
    pub fn clear(&mut self) {
        self.messages.clear();
        self.seen.clear();
    }
}
