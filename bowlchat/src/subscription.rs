//! Channel subscriptions and frame routing for one session epoch.
//!
//! The [`SubscriptionManager`] creates one [`ChannelSubscription`] per
//! descriptor channel, routes incoming [`ServerFrame`]s to the message
//! buffer and presence tracker, answers heartbeats, and tears everything
//! down before the session is released.
//!
//! Only the room channel feeds presence. Frames for channels this epoch
//! never subscribed to are stale leftovers and are ignored.
//!
//! Presence is a set of identities, but one identity may hold several room
//! connections. The manager remembers which client ids it has seen for each
//! identity, so a `leave` from a known client only removes the identity once
//! its last known connection is gone. A `leave` from a client never seen
//! removes the identity outright.

use std::collections::BTreeMap;

use bowlchat_proto::descriptor::ChannelLayout;
use bowlchat_proto::event::WireEvent;
use bowlchat_proto::frame::{ClientFrame, ServerFrame};
use bowlchat_proto::presence::{normalize_snapshot, snapshot_connections};

use crate::state::{ChatState, ClientEvent};
use crate::transport::{Session, TransportError};

/// Broker reason that marks a duplicate subscribe as harmless.
const ALREADY_SUBSCRIBED: &str = "already subscribed";

/// Lifecycle of a single channel subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    /// Subscribe sent, no answer yet.
    Pending,
    /// The broker confirmed the subscription.
    Subscribed,
    /// The broker refused the subscription.
    Error,
}

/// One channel subscription within the current epoch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSubscription {
    name: String,
    state: SubscriptionState,
}

impl ChannelSubscription {
    /// Channel name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current lifecycle state.
    #[must_use]
    pub const fn state(&self) -> SubscriptionState {
        self.state
    }
}

/// Owns the subscriptions of the current session epoch.
#[derive(Debug, Clone)]
pub struct SubscriptionManager {
    layout: ChannelLayout,
    subs: Vec<ChannelSubscription>,
    /// Room connections: client id to identity.
    connections: BTreeMap<String, String>,
}

impl SubscriptionManager {
    /// Creates a manager with no subscriptions.
    #[must_use]
    pub const fn new(layout: ChannelLayout) -> Self {
        Self {
            layout,
            subs: Vec::new(),
            connections: BTreeMap::new(),
        }
    }

    /// The channel naming in use.
    #[must_use]
    pub const fn layout(&self) -> &ChannelLayout {
        &self.layout
    }

    /// Subscriptions of the current epoch, in creation order.
    #[must_use]
    pub fn subscriptions(&self) -> &[ChannelSubscription] {
        &self.subs
    }

    /// State of the subscription to `channel`, if one exists.
    #[must_use]
    pub fn state_of(&self, channel: &str) -> Option<SubscriptionState> {
        self.find(channel).map(|sub| sub.state)
    }

    /// Creates a pending subscription for every channel, in order, and sends
    /// the subscribe frames. Repeated names are subscribed once.
    ///
    /// # Errors
    ///
    /// Returns the transport error if a subscribe frame cannot be sent.
    pub fn subscribe_all<S: Session>(
        &mut self,
        session: &S,
        channels: &[String],
    ) -> Result<(), TransportError> {
        for channel in channels {
            if self.find(channel).is_some() {
                tracing::debug!(channel = %channel, "skipping repeated channel");
                continue;
            }
            self.subs.push(ChannelSubscription {
                name: channel.clone(),
                state: SubscriptionState::Pending,
            });
            session.send(&ClientFrame::Subscribe {
                channel: channel.clone(),
            })?;
            tracing::debug!(channel = %channel, "subscribe sent");
        }
        Ok(())
    }

    /// Routes one broker frame.
    ///
    /// Heartbeats are answered on `session`; chat messages land in
    /// `chat.messages`; room presence updates land in `chat.presence`.
    /// Observable changes are appended to `out`.
    pub fn route<S: Session>(
        &mut self,
        frame: ServerFrame,
        session: &S,
        chat: &mut ChatState,
        out: &mut Vec<ClientEvent>,
    ) {
        match frame {
            ServerFrame::Ping { .. } => reply_pong(session),
            ServerFrame::Error { message } => {
                tracing::warn!(reason = %message, "broker reported an error");
            }
            ServerFrame::Connected { client, .. } => {
                tracing::debug!(client = %client, "ignoring repeated connected frame");
            }
            ServerFrame::Subscribed { channel } => self.on_subscribed(&channel, session),
            ServerFrame::SubscribeError { channel, message } => {
                self.on_subscribe_error(channel, message, session, out);
            }
            ServerFrame::Unsubscribed { channel } => {
                tracing::debug!(channel = %channel, "broker confirmed unsubscribe");
            }
            ServerFrame::Publication { channel, data } => {
                if !self.is_tracked(&channel) {
                    tracing::debug!(channel = %channel, "publication on stale channel");
                    return;
                }
                match WireEvent::from_value(data) {
                    Ok(WireEvent::Ping { .. }) => reply_pong(session),
                    Ok(WireEvent::ReadReceipt(receipt)) => {
                        tracing::debug!(
                            channel = %channel,
                            message_id = ?receipt.message_id,
                            read_by = %receipt.read_by,
                            "read receipt"
                        );
                    }
                    Ok(WireEvent::Chat(message) | WireEvent::Unknown { message, .. }) => {
                        if chat.messages.ingest(message.clone()) {
                            out.push(ClientEvent::MessageReceived { channel, message });
                        }
                    }
                    Err(e) => {
                        tracing::warn!(channel = %channel, err = %e, "undecodable publication, skipping");
                    }
                }
            }
            ServerFrame::Join { channel, info } => {
                if self.feeds_presence(&channel) {
                    let identity = info.user.trim();
                    if identity.is_empty() {
                        return;
                    }
                    if !info.client.is_empty() {
                        self.connections.insert(info.client, identity.to_string());
                    }
                    if chat.presence.join(identity) {
                        out.push(ClientEvent::PresenceJoined(identity.to_string()));
                    }
                }
            }
            ServerFrame::Leave { channel, info } => {
                if self.feeds_presence(&channel) {
                    let identity = info.user.trim();
                    let known = self.connections.remove(&info.client).is_some();
                    if !known {
                        self.connections.retain(|_, other| other.as_str() != identity);
                    } else if self.connections.values().any(|other| other.as_str() == identity) {
                        tracing::debug!(
                            identity = %identity,
                            client = %info.client,
                            "connection left, identity still present"
                        );
                        return;
                    }
                    if chat.presence.leave(identity) {
                        out.push(ClientEvent::PresenceLeft(identity.to_string()));
                    }
                }
            }
            ServerFrame::Presence { channel, clients } => {
                if self.feeds_presence(&channel) {
                    self.connections = snapshot_connections(&clients);
                    chat.presence.seed(normalize_snapshot(&clients));
                    let members = chat.presence.members().iter().cloned().collect();
                    out.push(ClientEvent::PresenceSeeded { members });
                }
            }
        }
    }

    /// Unsubscribes and releases every subscription, then clears presence.
    ///
    /// Pass `None` when the session is already gone; the subscriptions are
    /// still released.
    pub fn teardown<S: Session>(&mut self, session: Option<&S>, chat: &mut ChatState) {
        for sub in self.subs.drain(..) {
            if let Some(session) = session.filter(|s| s.is_open()) {
                if let Err(e) = session.send(&ClientFrame::Unsubscribe {
                    channel: sub.name.clone(),
                }) {
                    tracing::debug!(channel = %sub.name, err = %e, "unsubscribe not sent");
                }
            }
            tracing::trace!(channel = %sub.name, "subscription released");
        }
        self.connections.clear();
        chat.presence.clear();
    }

    fn on_subscribed<S: Session>(&mut self, channel: &str, session: &S) {
        let is_room = self.layout.is_room(channel);
        let Some(sub) = self.find_mut(channel) else {
            tracing::debug!(channel = %channel, "subscribed ack for stale channel");
            return;
        };
        sub.state = SubscriptionState::Subscribed;
        tracing::info!(channel = %channel, "subscribed");
        if is_room {
            if let Err(e) = session.send(&ClientFrame::Presence {
                channel: channel.to_string(),
            }) {
                tracing::warn!(channel = %channel, err = %e, "presence request failed");
            }
        }
    }

    fn on_subscribe_error<S: Session>(
        &mut self,
        channel: String,
        message: String,
        session: &S,
        out: &mut Vec<ClientEvent>,
    ) {
        if message.to_ascii_lowercase().contains(ALREADY_SUBSCRIBED) {
            tracing::debug!(channel = %channel, "already subscribed");
            self.on_subscribed(&channel, session);
            return;
        }
        let Some(sub) = self.find_mut(&channel) else {
            tracing::debug!(channel = %channel, "subscribe error for stale channel");
            return;
        };
        sub.state = SubscriptionState::Error;
        tracing::warn!(channel = %channel, reason = %message, "subscription failed");
        out.push(ClientEvent::SubscriptionFailed { channel, message });
    }

    fn feeds_presence(&self, channel: &str) -> bool {
        self.layout.is_room(channel) && self.is_tracked(channel)
    }

    fn is_tracked(&self, channel: &str) -> bool {
        self.find(channel).is_some()
    }

    fn find(&self, channel: &str) -> Option<&ChannelSubscription> {
        self.subs.iter().find(|sub| sub.name == channel)
    }

    fn find_mut(&mut self, channel: &str) -> Option<&mut ChannelSubscription> {
        self.subs.iter_mut().find(|sub| sub.name == channel)
    }
}

fn reply_pong<S: Session>(session: &S) {
    if let Err(e) = session.send(&ClientFrame::Pong) {
        tracing::warn!(err = %e, "failed to answer ping");
    }
}
