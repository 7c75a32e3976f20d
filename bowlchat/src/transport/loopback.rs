//! Loopback connector for testing.
//!
//! [`LoopbackConnector`] opens in-process sessions backed by
//! [`tokio::sync::mpsc`] channels. Every opened session has a matching
//! [`LoopbackLink`] that plays the broker: it records the frames the client
//! sent, pushes [`ServerFrame`]s, and can drop the link on demand.
//!
//! With [`LoopbackConnector::auto_ack`] enabled the link answers
//! `subscribe` with `subscribed` and `presence` with the configured
//! snapshot, which is enough to drive the controller end to end.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;

use bowlchat_proto::descriptor::ConnectionDescriptor;
use bowlchat_proto::frame::{ClientFrame, ServerFrame};

use super::{Connector, Opened, Session, SessionEvent, TransportError};

#[derive(Default)]
struct Shared {
    failures: VecDeque<String>,
    links: Vec<LoopbackLink>,
    tokens: Vec<String>,
    auto_ack: bool,
    presence: Vec<String>,
}

/// In-process [`Connector`] with scripted failures.
#[derive(Clone)]
pub struct LoopbackConnector {
    shared: Arc<Mutex<Shared>>,
    opens: Arc<AtomicUsize>,
    buffer: usize,
}

impl LoopbackConnector {
    /// Creates a connector whose sessions buffer up to `buffer` events.
    #[must_use]
    pub fn new(buffer: usize) -> Self {
        Self {
            shared: Arc::new(Mutex::new(Shared::default())),
            opens: Arc::new(AtomicUsize::new(0)),
            buffer: buffer.max(1),
        }
    }

    /// Answers `subscribe` and `presence` frames automatically, reporting
    /// `members` as the presence snapshot.
    #[must_use]
    pub fn auto_ack(self, members: &[&str]) -> Self {
        {
            let mut shared = self.shared.lock();
            shared.auto_ack = true;
            shared.presence = members.iter().map(ToString::to_string).collect();
        }
        self
    }

    /// Makes the next open attempt fail as unreachable.
    pub fn fail_next(&self, reason: &str) {
        self.shared.lock().failures.push_back(reason.to_string());
    }

    /// Number of times [`Connector::open`] was called.
    #[must_use]
    pub fn open_calls(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Number of sessions actually constructed.
    #[must_use]
    pub fn sessions_opened(&self) -> usize {
        self.shared.lock().links.len()
    }

    /// Tokens presented by each successful open, in order.
    #[must_use]
    pub fn tokens(&self) -> Vec<String> {
        self.shared.lock().tokens.clone()
    }

    /// Broker-side handle of the most recently opened session.
    #[must_use]
    pub fn last_link(&self) -> Option<LoopbackLink> {
        self.shared.lock().links.last().cloned()
    }

    /// Broker-side handle of the `index`-th opened session.
    #[must_use]
    pub fn link(&self, index: usize) -> Option<LoopbackLink> {
        self.shared.lock().links.get(index).cloned()
    }
}

impl Connector for LoopbackConnector {
    type Session = LoopbackSession;

    async fn open(
        &self,
        descriptor: &ConnectionDescriptor,
    ) -> Result<Opened<LoopbackSession>, TransportError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let mut shared = self.shared.lock();
        if let Some(reason) = shared.failures.pop_front() {
            return Err(TransportError::Unreachable(reason));
        }

        let (tx, rx) = mpsc::channel(self.buffer);
        let link = LoopbackLink {
            events: tx,
            sent: Arc::new(Mutex::new(Vec::new())),
            closed: Arc::new(Mutex::new(None)),
            open: Arc::new(AtomicBool::new(true)),
        };
        let session = LoopbackSession {
            link: link.clone(),
            auto_ack: shared.auto_ack,
            presence: shared.presence.clone(),
        };
        shared.tokens.push(descriptor.token.clone());
        shared.links.push(link);

        Ok(Opened {
            session,
            events: rx,
        })
    }
}

/// Broker side of a loopback session.
#[derive(Clone)]
pub struct LoopbackLink {
    events: mpsc::Sender<SessionEvent>,
    sent: Arc<Mutex<Vec<ClientFrame>>>,
    closed: Arc<Mutex<Option<bool>>>,
    open: Arc<AtomicBool>,
}

impl LoopbackLink {
    /// Delivers a frame to the client. Returns `false` once the client has
    /// stopped listening.
    pub async fn push(&self, frame: ServerFrame) -> bool {
        self.events.send(SessionEvent::Frame(frame)).await.is_ok()
    }

    /// Delivers a transport error notice without closing the link.
    pub async fn push_error(&self, message: &str) -> bool {
        self.events
            .send(SessionEvent::Error(message.to_string()))
            .await
            .is_ok()
    }

    /// Drops the link from the broker side.
    pub async fn drop_link(&self, reason: &str) {
        if self.open.swap(false, Ordering::SeqCst) {
            let _ = self
                .events
                .send(SessionEvent::Disconnected {
                    intentional: false,
                    reason: reason.to_string(),
                })
                .await;
        }
    }

    /// Ends the link with a close the session reports as intentional.
    pub async fn close_cleanly(&self, reason: &str) {
        if self.open.swap(false, Ordering::SeqCst) {
            let _ = self
                .events
                .send(SessionEvent::Disconnected {
                    intentional: true,
                    reason: reason.to_string(),
                })
                .await;
        }
    }

    /// Frames the client has sent so far.
    #[must_use]
    pub fn sent(&self) -> Vec<ClientFrame> {
        self.sent.lock().clone()
    }

    /// `Some(intentional)` once the client closed the session.
    #[must_use]
    pub fn closed(&self) -> Option<bool> {
        *self.closed.lock()
    }

    /// Whether the client is still holding the session open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

/// Client side of a loopback session.
pub struct LoopbackSession {
    link: LoopbackLink,
    auto_ack: bool,
    presence: Vec<String>,
}

impl LoopbackSession {
    fn answer(&self, frame: &ClientFrame) {
        let reply = match frame {
            ClientFrame::Subscribe { channel } => ServerFrame::Subscribed {
                channel: channel.clone(),
            },
            ClientFrame::Presence { channel } => ServerFrame::Presence {
                channel: channel.clone(),
                clients: Value::from(self.presence.clone()),
            },
            _ => return,
        };
        if self.link.events.try_send(SessionEvent::Frame(reply)).is_err() {
            tracing::warn!("loopback event buffer full, dropping auto reply");
        }
    }
}

impl Session for LoopbackSession {
    fn send(&self, frame: &ClientFrame) -> Result<(), TransportError> {
        if !self.link.is_open() {
            return Err(TransportError::ConnectionClosed);
        }
        self.link.sent.lock().push(frame.clone());
        if self.auto_ack {
            self.answer(frame);
        }
        Ok(())
    }

    fn close(&mut self, intentional: bool) {
        {
            let mut closed = self.link.closed.lock();
            if closed.is_none() {
                *closed = Some(intentional);
            }
        }
        if self.link.open.swap(false, Ordering::SeqCst) {
            let _ = self.link.events.try_send(SessionEvent::Disconnected {
                intentional,
                reason: "closed by client".into(),
            });
        }
    }

    fn is_open(&self) -> bool {
        self.link.is_open()
    }
}
