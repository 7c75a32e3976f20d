//! Observable client state.
//!
//! The controller task is the only writer. Everything else reads through a
//! [`ChatView`] or reacts to [`ClientEvent`]s.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{RwLock, RwLockWriteGuard};

use bowlchat_proto::event::ChatMessage;

use crate::buffer::MessageBuffer;
use crate::presence::PresenceTracker;

/// Lifecycle state of the real-time connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// Never connected since creation.
    #[default]
    Idle,
    /// An attempt is in flight or a retry is scheduled.
    Connecting,
    /// The session is open and channels are subscribed.
    Connected,
    /// Was connected, or was asked to stop; no attempt running.
    Disconnected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
        };
        f.write_str(label)
    }
}

/// Snapshot of the reconnection machinery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionStatus {
    /// Current connection state.
    pub state: ConnectionState,
    /// Consecutive failed attempts since the last successful connect.
    pub attempts: u32,
    /// Whether a retry timer is armed.
    pub reconnect_pending: bool,
    /// Whether an attempt is in flight.
    pub attempt_in_flight: bool,
    /// Ceiling of the retry delay.
    pub max_delay: Duration,
}

/// Message buffer and presence set, as owned by the controller.
#[derive(Debug, Default)]
pub struct ChatState {
    /// Deduplicated message history.
    pub messages: MessageBuffer,
    /// Identities online on the room channel.
    pub presence: PresenceTracker,
}

/// Shared read-only view of the [`ChatState`].
#[derive(Debug, Clone, Default)]
pub struct ChatView {
    inner: Arc<RwLock<ChatState>>,
}

impl ChatView {
    /// Creates a view over empty state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffered messages in arrival order.
    #[must_use]
    pub fn messages(&self) -> Vec<ChatMessage> {
        self.inner.read().messages.iter().cloned().collect()
    }

    /// Number of buffered messages.
    #[must_use]
    pub fn message_count(&self) -> usize {
        self.inner.read().messages.len()
    }

    /// Online identities, sorted.
    #[must_use]
    pub fn presence(&self) -> Vec<String> {
        self.inner.read().presence.members().iter().cloned().collect()
    }

    /// Runs `f` against the state under the read lock.
    pub fn with<R>(&self, f: impl FnOnce(&ChatState) -> R) -> R {
        f(&self.inner.read())
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, ChatState> {
        self.inner.write()
    }
}

/// Notifications pushed to the UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// The connection state changed.
    StateChanged(ConnectionState),
    /// A new message was appended to the buffer.
    MessageReceived {
        /// Channel it arrived on.
        channel: String,
        /// The message.
        message: ChatMessage,
    },
    /// The presence set was replaced by a snapshot.
    PresenceSeeded {
        /// Online identities, sorted.
        members: Vec<String>,
    },
    /// An identity came online.
    PresenceJoined(String),
    /// An identity went offline.
    PresenceLeft(String),
    /// A channel subscription failed for a reason other than a duplicate.
    SubscriptionFailed {
        /// Channel name.
        channel: String,
        /// Broker-provided reason.
        message: String,
    },
    /// A retry was scheduled after a failure or an unexpected close.
    ReconnectScheduled {
        /// Number of failures so far, including this one.
        attempt: u32,
        /// Delay before the retry.
        delay: Duration,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn view_reflects_writes() {
        let view = ChatView::new();
        {
            let mut state = view.write();
            state.messages.ingest(ChatMessage::new("alice", "hi").with_id("m1"));
            state.presence.join("alice");
        }
        assert_eq!(view.message_count(), 1);
        assert_eq!(view.presence(), vec!["alice".to_string()]);
        assert!(view.with(|s| s.messages.contains("m1")));
    }

    #[test]
    fn state_labels() {
        assert_eq!(ConnectionState::default(), ConnectionState::Idle);
        assert_eq!(ConnectionState::Connecting.to_string(), "connecting");
    }
}
