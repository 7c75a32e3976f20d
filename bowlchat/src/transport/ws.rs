//! WebSocket transport to the channel broker.
//!
//! [`WsConnector::open`] dials the descriptor URL, sends the
//! [`ClientFrame::Connect`] handshake and waits for
//! [`ServerFrame::Connected`]. The resulting [`WsSession`] owns two
//! background tasks: a writer draining an unbounded queue into the socket
//! sink and a reader decoding text frames into [`SessionEvent`]s.
//!
//! Malformed frames are logged and skipped; they never tear the link down.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{Message, Utf8Bytes};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use bowlchat_proto::descriptor::ConnectionDescriptor;
use bowlchat_proto::frame::{self, ClientFrame, ServerFrame};

use super::{Connector, Opened, Session, SessionEvent, TransportError};

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;
type WsSink = futures_util::stream::SplitSink<WsStream, Message>;
type WsReader = futures_util::stream::SplitStream<WsStream>;

/// Default timeout for dialing the broker and completing the handshake.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default capacity of the per-session event channel.
pub const DEFAULT_EVENT_BUFFER: usize = 256;

/// Close reason sent when the client hangs up on purpose.
const CLIENT_CLOSE_REASON: &str = "client disconnect";

/// Opens [`WsSession`]s against the URL in a [`ConnectionDescriptor`].
#[derive(Debug, Clone)]
pub struct WsConnector {
    connect_timeout: Duration,
    event_buffer: usize,
}

impl WsConnector {
    /// Creates a connector with explicit limits.
    #[must_use]
    pub const fn new(connect_timeout: Duration, event_buffer: usize) -> Self {
        Self {
            connect_timeout,
            event_buffer,
        }
    }
}

impl Default for WsConnector {
    fn default() -> Self {
        Self::new(DEFAULT_CONNECT_TIMEOUT, DEFAULT_EVENT_BUFFER)
    }
}

impl Connector for WsConnector {
    type Session = WsSession;

    async fn open(
        &self,
        descriptor: &ConnectionDescriptor,
    ) -> Result<Opened<WsSession>, TransportError> {
        let url = parse_ws_url(&descriptor.url)?;

        let (ws_stream, _response) =
            tokio::time::timeout(self.connect_timeout, connect_async(url.as_str()))
                .await
                .map_err(|_| {
                    tracing::warn!(url = %url, "broker WebSocket connect timed out");
                    TransportError::Timeout
                })?
                .map_err(|e| {
                    tracing::warn!(url = %url, err = %e, "broker WebSocket connect failed");
                    map_ws_connect_error(url.as_str(), e)
                })?;

        let (mut sink, mut reader) = ws_stream.split();

        let hello = frame::encode_client(&ClientFrame::Connect {
            token: descriptor.token.clone(),
        })?;
        sink.send(Message::text(hello)).await.map_err(|e| {
            tracing::warn!(err = %e, "failed to send connect frame");
            TransportError::Io(std::io::Error::other(format!(
                "failed to send connect frame: {e}"
            )))
        })?;

        let (client, user) = tokio::time::timeout(self.connect_timeout, await_connected(&mut reader))
            .await
            .map_err(|_| {
                tracing::warn!(url = %url, "broker handshake timed out");
                TransportError::Timeout
            })??;
        tracing::info!(client = %client, user = %user, url = %url, "connected to broker");

        let (events_tx, events_rx) = mpsc::channel(self.event_buffer.max(1));
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        let open = Arc::new(AtomicBool::new(true));
        let intentional = Arc::new(AtomicBool::new(false));

        tokio::spawn(writer_loop(sink, writer_rx));
        let reader_handle = tokio::spawn(reader_loop(
            reader,
            events_tx,
            Arc::clone(&open),
            Arc::clone(&intentional),
        ));

        Ok(Opened {
            session: WsSession {
                client_id: client,
                writer: writer_tx,
                open,
                intentional,
                reader_handle,
            },
            events: events_rx,
        })
    }
}

enum WriterCmd {
    Frame(String),
    Close,
}

/// A live WebSocket connection to the broker.
///
/// Dropping the session aborts its reader and lets the writer send a close
/// frame on its way out.
pub struct WsSession {
    client_id: String,
    writer: mpsc::UnboundedSender<WriterCmd>,
    open: Arc<AtomicBool>,
    intentional: Arc<AtomicBool>,
    reader_handle: tokio::task::JoinHandle<()>,
}

impl WsSession {
    /// Transport-level id the broker assigned to this connection.
    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }
}

impl Session for WsSession {
    fn send(&self, frame: &ClientFrame) -> Result<(), TransportError> {
        if !self.open.load(Ordering::Acquire) {
            return Err(TransportError::ConnectionClosed);
        }
        let text = frame::encode_client(frame)?;
        self.writer
            .send(WriterCmd::Frame(text))
            .map_err(|_| TransportError::ConnectionClosed)
    }

    fn close(&mut self, intentional: bool) {
        if intentional {
            self.intentional.store(true, Ordering::Release);
        }
        if self.open.swap(false, Ordering::AcqRel) {
            tracing::debug!(client = %self.client_id, intentional, "closing broker session");
        }
        let _ = self.writer.send(WriterCmd::Close);
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }
}

impl Drop for WsSession {
    fn drop(&mut self) {
        self.reader_handle.abort();
    }
}

/// Waits for the broker's answer to the connect frame.
async fn await_connected(reader: &mut WsReader) -> Result<(String, String), TransportError> {
    while let Some(msg) = reader.next().await {
        match msg {
            Ok(Message::Text(text)) => match frame::decode_server(text.as_str()) {
                Ok(ServerFrame::Connected { client, user }) => return Ok((client, user)),
                Ok(ServerFrame::Error { message }) => {
                    tracing::warn!(reason = %message, "broker rejected connect");
                    return Err(TransportError::Rejected(message));
                }
                Ok(other) => {
                    tracing::warn!(?other, "unexpected frame during handshake");
                    return Err(TransportError::Rejected(
                        "unexpected frame during handshake".into(),
                    ));
                }
                Err(e) => {
                    tracing::warn!(err = %e, "malformed handshake frame");
                    return Err(e.into());
                }
            },
            Ok(Message::Close(reason)) => {
                let reason = describe_close(reason.as_ref());
                tracing::warn!(reason = %reason, "broker closed connection during handshake");
                return Err(TransportError::Rejected(reason));
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(err = %e, "WebSocket error during handshake");
                return Err(TransportError::Io(std::io::Error::other(format!(
                    "WebSocket error during handshake: {e}"
                ))));
            }
        }
    }
    Err(TransportError::ConnectionClosed)
}

async fn writer_loop(mut sink: WsSink, mut rx: mpsc::UnboundedReceiver<WriterCmd>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WriterCmd::Frame(text) => {
                if let Err(e) = sink.send(Message::text(text)).await {
                    tracing::warn!(err = %e, "broker send failed");
                    return;
                }
            }
            WriterCmd::Close => break,
        }
    }
    let close = CloseFrame {
        code: CloseCode::Normal,
        reason: Utf8Bytes::from_static(CLIENT_CLOSE_REASON),
    };
    let _ = sink.send(Message::Close(Some(close))).await;
    let _ = sink.close().await;
}

async fn reader_loop(
    mut reader: WsReader,
    tx: mpsc::Sender<SessionEvent>,
    open: Arc<AtomicBool>,
    intentional: Arc<AtomicBool>,
) {
    let mut reason = String::from("stream ended");
    while let Some(msg) = reader.next().await {
        match msg {
            Ok(Message::Text(text)) => match frame::decode_server(text.as_str()) {
                Ok(frame) => {
                    tracing::trace!(channel = frame.channel().unwrap_or("-"), "broker frame");
                    if tx.send(SessionEvent::Frame(frame)).await.is_err() {
                        return;
                    }
                }
                Err(e) => {
                    tracing::warn!(err = %e, "malformed broker frame, skipping");
                }
            },
            Ok(Message::Close(frame)) => {
                reason = describe_close(frame.as_ref());
                tracing::info!(reason = %reason, "broker WebSocket closed");
                break;
            }
            Ok(Message::Binary(_)) => {
                tracing::debug!("ignoring binary frame from broker");
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(err = %e, "broker WebSocket read error");
                reason = e.to_string();
                let _ = tx.send(SessionEvent::Error(reason.clone())).await;
                break;
            }
        }
    }
    open.store(false, Ordering::Release);
    let intentional = intentional.load(Ordering::Acquire);
    let _ = tx
        .send(SessionEvent::Disconnected {
            intentional,
            reason,
        })
        .await;
    tracing::debug!(intentional, "broker reader task exiting");
}

fn describe_close(frame: Option<&CloseFrame>) -> String {
    frame.map_or_else(
        || "closed by broker".to_string(),
        |f| format!("{} {}", u16::from(f.code), f.reason.as_str()),
    )
}

fn parse_ws_url(raw: &str) -> Result<url::Url, TransportError> {
    let url = url::Url::parse(raw).map_err(|e| TransportError::InvalidUrl {
        url: raw.to_string(),
        reason: e.to_string(),
    })?;
    match url.scheme() {
        "ws" | "wss" => Ok(url),
        other => Err(TransportError::InvalidUrl {
            url: raw.to_string(),
            reason: format!("unsupported scheme {other}"),
        }),
    }
}

/// Map a `tokio_tungstenite` connection error to a [`TransportError`].
fn map_ws_connect_error(url: &str, err: tokio_tungstenite::tungstenite::Error) -> TransportError {
    use tokio_tungstenite::tungstenite::Error as WsError;
    match err {
        WsError::Io(io_err) => {
            if io_err.kind() == std::io::ErrorKind::ConnectionRefused
                || io_err.kind() == std::io::ErrorKind::AddrNotAvailable
            {
                TransportError::Unreachable(url.to_string())
            } else {
                TransportError::Io(io_err)
            }
        }
        WsError::Tls(_) => TransportError::Io(std::io::Error::other(format!("TLS error: {err}"))),
        WsError::Http(response) => TransportError::Io(std::io::Error::other(format!(
            "broker HTTP error: status {}",
            response.status()
        ))),
        other => TransportError::Io(std::io::Error::other(format!(
            "broker connection error: {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    fn descriptor(url: String) -> ConnectionDescriptor {
        ConnectionDescriptor {
            url,
            token: "tok".into(),
            channels: Vec::new(),
        }
    }

    /// What the scripted broker saw from the client after the handshake.
    #[derive(Debug, Default)]
    struct Observed {
        texts: Vec<String>,
        close_code: Option<u16>,
    }

    /// Accepts one connection, answers the handshake, pushes `script`, then
    /// either closes (when `hang_up`) or records traffic until the client
    /// goes away.
    async fn scripted_broker(
        script: Vec<String>,
        hang_up: bool,
    ) -> (String, oneshot::Receiver<Observed>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/connection/websocket", listener.local_addr().unwrap());
        let (done_tx, done_rx) = oneshot::channel();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let mut observed = Observed::default();

            if let Some(Ok(Message::Text(text))) = ws.next().await {
                let hello = frame::decode_client(text.as_str()).unwrap();
                assert_eq!(hello, ClientFrame::Connect { token: "tok".into() });
                let ack = frame::encode_server(&ServerFrame::Connected {
                    client: "c1".into(),
                    user: "alice".into(),
                })
                .unwrap();
                ws.send(Message::text(ack)).await.unwrap();
            }
            for text in script {
                ws.send(Message::text(text)).await.unwrap();
            }
            if hang_up {
                let _ = ws.close(None).await;
            } else {
                while let Some(Ok(msg)) = ws.next().await {
                    match msg {
                        Message::Text(text) => observed.texts.push(text.as_str().to_string()),
                        Message::Close(frame) => {
                            observed.close_code = frame.map(|f| u16::from(f.code));
                            break;
                        }
                        _ => {}
                    }
                }
            }
            let _ = done_tx.send(observed);
        });

        (url, done_rx)
    }

    async fn next_event(events: &mut mpsc::Receiver<SessionEvent>) -> SessionEvent {
        tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("event timed out")
            .expect("event stream ended")
    }

    #[tokio::test]
    async fn handshake_yields_open_session() {
        let (url, _done) = scripted_broker(Vec::new(), false).await;
        let opened = WsConnector::default().open(&descriptor(url)).await.unwrap();
        assert!(opened.session.is_open());
        assert_eq!(opened.session.client_id(), "c1");
    }

    #[tokio::test]
    async fn frames_arrive_in_order_and_malformed_ones_are_skipped() {
        let script = vec![
            r#"{"type":"subscribed","channel":"room:main"}"#.to_string(),
            "{not json".to_string(),
            r#"{"type":"ping"}"#.to_string(),
        ];
        let (url, _done) = scripted_broker(script, false).await;
        let mut opened = WsConnector::default().open(&descriptor(url)).await.unwrap();

        assert_eq!(
            next_event(&mut opened.events).await,
            SessionEvent::Frame(ServerFrame::Subscribed {
                channel: "room:main".into()
            })
        );
        assert_eq!(
            next_event(&mut opened.events).await,
            SessionEvent::Frame(ServerFrame::Ping { timestamp: None })
        );
        assert!(opened.session.is_open());
    }

    #[tokio::test]
    async fn broker_hang_up_reports_unintentional_disconnect_once() {
        let (url, _done) = scripted_broker(Vec::new(), true).await;
        let mut opened = WsConnector::default().open(&descriptor(url)).await.unwrap();

        let event = next_event(&mut opened.events).await;
        assert!(
            matches!(event, SessionEvent::Disconnected { intentional: false, .. }),
            "got {event:?}"
        );
        assert!(opened.events.recv().await.is_none());
        assert!(!opened.session.is_open());
        assert!(matches!(
            opened.session.send(&ClientFrame::Pong),
            Err(TransportError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn sent_frames_reach_broker_and_close_is_normal() {
        let (url, done) = scripted_broker(Vec::new(), false).await;
        let mut opened = WsConnector::default().open(&descriptor(url)).await.unwrap();

        opened
            .session
            .send(&ClientFrame::Subscribe {
                channel: "room:main".into(),
            })
            .unwrap();
        opened.session.send(&ClientFrame::Pong).unwrap();
        opened.session.close(true);
        assert!(!opened.session.is_open());

        let observed = tokio::time::timeout(Duration::from_secs(5), done)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            observed.texts,
            vec![
                r#"{"type":"subscribe","channel":"room:main"}"#.to_string(),
                r#"{"type":"pong"}"#.to_string(),
            ]
        );
        assert_eq!(observed.close_code, Some(1000));
    }

    #[tokio::test]
    async fn rejected_handshake_is_an_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/ws", listener.local_addr().unwrap());
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let _ = ws.next().await;
            let err = frame::encode_server(&ServerFrame::Error {
                message: "invalid token".into(),
            })
            .unwrap();
            let _ = ws.send(Message::text(err)).await;
        });

        let result = WsConnector::default().open(&descriptor(url)).await;
        assert!(
            matches!(&result, Err(TransportError::Rejected(reason)) if reason == "invalid token"),
            "unexpected result: {:?}",
            result.err()
        );
    }

    #[tokio::test]
    async fn non_websocket_scheme_is_rejected() {
        let result = WsConnector::default()
            .open(&descriptor("http://127.0.0.1:1/ws".into()))
            .await;
        assert!(matches!(result, Err(TransportError::InvalidUrl { .. })));
    }

    #[tokio::test]
    async fn connect_to_nonexistent_broker_fails() {
        let result = WsConnector::default()
            .open(&descriptor("ws://127.0.0.1:1/ws".into()))
            .await;
        assert!(result.is_err());
    }
}
