//! Transport session abstraction for `BowlChat`.
//!
//! A [`Connector`] turns a [`ConnectionDescriptor`] into exactly one live
//! [`Session`] plus the stream of [`SessionEvent`]s that session produces.
//! Implementations:
//! - [`ws::WsConnector`] — WebSocket connection to the channel broker
//! - [`loopback::LoopbackConnector`] — in-process connector for testing
//!
//! Sessions never retry. When the link drops they report
//! [`SessionEvent::Disconnected`] once and stop; deciding whether and when
//! to reconnect belongs to the [`crate::controller`].

pub mod loopback;
pub mod ws;

use bowlchat_proto::descriptor::ConnectionDescriptor;
use bowlchat_proto::frame::{ClientFrame, ServerFrame};
use tokio::sync::mpsc;

/// Errors that can occur while opening or using a transport session.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The connection is closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// The connect handshake did not complete in time.
    #[error("transport handshake timed out")]
    Timeout,

    /// The broker could not be reached.
    #[error("broker at {0} is unreachable")]
    Unreachable(String),

    /// The descriptor URL is not a usable WebSocket URL.
    #[error("invalid transport url {url}: {reason}")]
    InvalidUrl {
        /// The offending URL.
        url: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The broker refused the connect handshake.
    #[error("handshake rejected: {0}")]
    Rejected(String),

    /// A frame could not be encoded or decoded.
    #[error("frame error: {0}")]
    Frame(#[from] bowlchat_proto::frame::FrameError),

    /// An underlying I/O or protocol error occurred.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Lifecycle and data events produced by an open session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// A frame arrived from the broker, in transport order.
    Frame(ServerFrame),
    /// A transport error was observed. Does not by itself end the session.
    Error(String),
    /// The link is gone. Emitted exactly once, always last.
    Disconnected {
        /// `true` when the close was requested through [`Session::close`]
        /// with the intentional marker.
        intentional: bool,
        /// Human-readable close reason.
        reason: String,
    },
}

/// A freshly opened session and its event stream.
pub struct Opened<S> {
    /// The session handle used to send frames and close the link.
    pub session: S,
    /// Events from the broker, ending with [`SessionEvent::Disconnected`].
    pub events: mpsc::Receiver<SessionEvent>,
}

/// One live connection to the broker.
pub trait Session: Send + 'static {
    /// Queues a frame for the broker.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ConnectionClosed`] once the link is down.
    fn send(&self, frame: &ClientFrame) -> Result<(), TransportError>;

    /// Tears the link down. With `intentional` set the eventual
    /// [`SessionEvent::Disconnected`] carries `intentional: true`.
    fn close(&mut self, intentional: bool);

    /// Returns `true` while the link is believed to be up.
    fn is_open(&self) -> bool;
}

/// Factory for sessions. One call to [`Connector::open`] constructs at most
/// one session.
pub trait Connector: Send + Sync + 'static {
    /// The session type this connector produces.
    type Session: Session;

    /// Establishes a session for `descriptor`, completing the handshake.
    ///
    /// Resolves to either an open session or an error; never both.
    fn open(
        &self,
        descriptor: &ConnectionDescriptor,
    ) -> impl std::future::Future<Output = Result<Opened<Self::Session>, TransportError>> + Send;
}
