//! Broker core: shared state, WebSocket handler, subscriptions and fan-out.
//!
//! A connection authenticates with a single-use token issued by the token
//! endpoint, then subscribes to the room channel and its own private
//! channel. Publications go to every connection subscribed to the channel;
//! room joins and leaves are broadcast to the other room subscribers.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use bowlchat_proto::descriptor::ChannelLayout;
use bowlchat_proto::frame::{self, ClientFrame, ServerFrame};
use bowlchat_proto::presence::ClientInfo;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde_json::{Map, Value};
use tokio::sync::{Mutex, RwLock, mpsc};

/// Default interval between heartbeat pings.
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(25);

/// One authenticated connection.
struct ClientEntry {
    user: String,
    sender: mpsc::UnboundedSender<Message>,
    channels: HashSet<String>,
}

/// Shared broker state: connections, subscriptions and pending tokens.
pub struct BrokerState {
    /// Maps transport-level client id to the connection.
    clients: RwLock<HashMap<String, ClientEntry>>,
    /// Unredeemed connection tokens and the identity they were issued to.
    grants: Mutex<HashMap<String, String>>,
    layout: ChannelLayout,
    heartbeat: Option<Duration>,
    /// WebSocket URL handed out in connection descriptors.
    public_url: RwLock<String>,
    pongs: AtomicU64,
}

impl Default for BrokerState {
    fn default() -> Self {
        Self::new(ChannelLayout::default())
    }
}

impl BrokerState {
    /// Creates broker state with the default heartbeat.
    #[must_use]
    pub fn new(layout: ChannelLayout) -> Self {
        Self::with_config(layout, Some(DEFAULT_HEARTBEAT))
    }

    /// Creates broker state with a custom heartbeat; `None` disables pings.
    #[must_use]
    pub fn with_config(layout: ChannelLayout, heartbeat: Option<Duration>) -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            grants: Mutex::new(HashMap::new()),
            layout,
            heartbeat,
            public_url: RwLock::new(String::new()),
            pongs: AtomicU64::new(0),
        }
    }

    /// Channel naming used for permission checks.
    #[must_use]
    pub const fn layout(&self) -> &ChannelLayout {
        &self.layout
    }

    /// WebSocket URL advertised to clients. Empty until the server binds.
    pub async fn public_url(&self) -> String {
        self.public_url.read().await.clone()
    }

    /// Overrides the advertised WebSocket URL (e.g. to route through a proxy).
    pub async fn set_public_url(&self, url: impl Into<String>) {
        *self.public_url.write().await = url.into();
    }

    /// Issues a single-use connection token for `user`.
    pub async fn issue_token(&self, user: &str) -> String {
        let token = uuid::Uuid::now_v7().to_string();
        self.grants
            .lock()
            .await
            .insert(token.clone(), user.to_string());
        token
    }

    /// Consumes a token, returning the identity it was issued to.
    pub async fn redeem(&self, token: &str) -> Option<String> {
        self.grants.lock().await.remove(token)
    }

    /// Delivers `data` to every connection subscribed to `channel`.
    ///
    /// Returns the number of connections the publication was queued for.
    pub async fn publish(&self, channel: &str, data: &Value) -> usize {
        let publication = ServerFrame::Publication {
            channel: channel.to_string(),
            data: data.clone(),
        };
        let Some(text) = encode(&publication) else {
            return 0;
        };
        let clients = self.clients.read().await;
        let delivered = clients
            .values()
            .filter(|entry| entry.channels.contains(channel))
            .filter(|entry| entry.sender.send(Message::Text(text.clone().into())).is_ok())
            .count();
        tracing::debug!(channel = %channel, delivered, "publication fanned out");
        delivered
    }

    /// Sends a WebSocket Close frame to every connection.
    ///
    /// Clients see a remote close, which they treat as an unexpected drop.
    pub async fn close_all_connections(&self) {
        let clients = self.clients.read().await;
        for (client_id, entry) in clients.iter() {
            tracing::info!(client = %client_id, "sending close frame");
            let _ = entry.sender.send(Message::Close(None));
        }
    }

    /// Number of authenticated connections.
    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Identities currently subscribed to `channel`.
    pub async fn subscribers(&self, channel: &str) -> BTreeSet<String> {
        self.clients
            .read()
            .await
            .values()
            .filter(|entry| entry.channels.contains(channel))
            .map(|entry| entry.user.clone())
            .collect()
    }

    /// Total heartbeat replies received across all connections.
    #[must_use]
    pub fn pong_count(&self) -> u64 {
        self.pongs.load(Ordering::Relaxed)
    }

    /// A user may join the room and their own private channel only.
    fn may_subscribe(&self, user: &str, channel: &str) -> bool {
        self.layout.is_room(channel) || self.layout.owner_of(channel) == Some(user)
    }

    async fn register(&self, client_id: &str, user: &str, sender: mpsc::UnboundedSender<Message>) {
        self.clients.write().await.insert(
            client_id.to_string(),
            ClientEntry {
                user: user.to_string(),
                sender,
                channels: HashSet::new(),
            },
        );
    }

    /// Removes a connection and announces its departure from the room.
    async fn unregister(&self, client_id: &str) {
        let mut clients = self.clients.write().await;
        let Some(entry) = clients.remove(client_id) else {
            return;
        };
        for channel in entry.channels.iter().filter(|c| self.layout.is_room(c)) {
            let leave = ServerFrame::Leave {
                channel: channel.clone(),
                info: ClientInfo {
                    client: client_id.to_string(),
                    user: entry.user.clone(),
                },
            };
            broadcast(&clients, channel, client_id, &leave);
        }
    }

    async fn subscribe(&self, client_id: &str, channel: &str) {
        let mut clients = self.clients.write().await;
        let Some(entry) = clients.get_mut(client_id) else {
            return;
        };
        let reply = if !self.may_subscribe(&entry.user, channel) {
            tracing::warn!(client = %client_id, channel = %channel, "subscription refused");
            ServerFrame::SubscribeError {
                channel: channel.to_string(),
                message: "permission denied".into(),
            }
        } else if entry.channels.insert(channel.to_string()) {
            ServerFrame::Subscribed {
                channel: channel.to_string(),
            }
        } else {
            ServerFrame::SubscribeError {
                channel: channel.to_string(),
                message: "already subscribed".into(),
            }
        };
        let joined = matches!(reply, ServerFrame::Subscribed { .. }) && self.layout.is_room(channel);
        let user = entry.user.clone();
        send_frame(&entry.sender, &reply);

        if joined {
            let join = ServerFrame::Join {
                channel: channel.to_string(),
                info: ClientInfo {
                    client: client_id.to_string(),
                    user,
                },
            };
            broadcast(&clients, channel, client_id, &join);
        }
    }

    async fn unsubscribe(&self, client_id: &str, channel: &str) {
        let mut clients = self.clients.write().await;
        let Some(entry) = clients.get_mut(client_id) else {
            return;
        };
        let removed = entry.channels.remove(channel);
        let user = entry.user.clone();
        send_frame(
            &entry.sender,
            &ServerFrame::Unsubscribed {
                channel: channel.to_string(),
            },
        );

        if removed && self.layout.is_room(channel) {
            let leave = ServerFrame::Leave {
                channel: channel.to_string(),
                info: ClientInfo {
                    client: client_id.to_string(),
                    user,
                },
            };
            broadcast(&clients, channel, client_id, &leave);
        }
    }

    /// Answers a presence request with a map of client id to client info.
    async fn presence(&self, client_id: &str, channel: &str) {
        let clients = self.clients.read().await;
        let Some(entry) = clients.get(client_id) else {
            return;
        };
        if !entry.channels.contains(channel) {
            send_frame(
                &entry.sender,
                &ServerFrame::Error {
                    message: format!("not subscribed to {channel}"),
                },
            );
            return;
        }

        let snapshot: Map<String, Value> = clients
            .iter()
            .filter(|(_, other)| other.channels.contains(channel))
            .map(|(id, other)| {
                (
                    id.clone(),
                    serde_json::json!({ "client": id, "user": other.user }),
                )
            })
            .collect();
        send_frame(
            &entry.sender,
            &ServerFrame::Presence {
                channel: channel.to_string(),
                clients: Value::Object(snapshot),
            },
        );
    }
}

/// Outcome of the connect handshake.
enum Handshake {
    Accepted(String),
    Refused(String),
    Gone,
}

/// Handles an upgraded WebSocket connection for a single client.
///
/// The connection lifecycle:
/// 1. Wait for a `connect` frame and redeem its token.
/// 2. Register the client and answer `connected`.
/// 3. Process subscribe, unsubscribe, presence and pong frames, pinging
///    on the heartbeat interval.
/// 4. On disconnect, unregister and broadcast the room leave.
pub async fn handle_socket(socket: WebSocket, state: Arc<BrokerState>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let user = match wait_for_connect(&mut ws_receiver, &state).await {
        Handshake::Accepted(user) => user,
        Handshake::Refused(reason) => {
            tracing::warn!(reason = %reason, "connection refused");
            let _ = send_direct(&mut ws_sender, &ServerFrame::Error { message: reason }).await;
            let _ = ws_sender.send(Message::Close(None)).await;
            return;
        }
        Handshake::Gone => {
            tracing::warn!("connection closed before handshake");
            return;
        }
    };

    let client_id = uuid::Uuid::now_v7().to_string();
    let connected = ServerFrame::Connected {
        client: client_id.clone(),
        user: user.clone(),
    };
    if let Err(e) = send_direct(&mut ws_sender, &connected).await {
        tracing::error!(client = %client_id, error = %e, "failed to send connected ack");
        return;
    }

    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let heartbeat = state
        .heartbeat
        .map(|period| tokio::spawn(heartbeat_loop(period, tx.clone())));
    state.register(&client_id, &user, tx).await;
    tracing::info!(client = %client_id, user = %user, "client connected");

    let writer_client = client_id.clone();
    let mut write_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if ws_sender.send(msg).await.is_err() {
                tracing::warn!(client = %writer_client, "WebSocket write failed");
                break;
            }
            if closing {
                break;
            }
        }
    });

    let reader_client = client_id.clone();
    let reader_state = Arc::clone(&state);
    let mut read_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            match msg {
                Message::Text(text) => {
                    handle_text(&reader_client, text.as_str(), &reader_state).await;
                }
                Message::Close(_) => {
                    tracing::info!(client = %reader_client, "received close frame");
                    break;
                }
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut read_task => {
            write_task.abort();
        }
        _ = &mut write_task => {
            read_task.abort();
        }
    }
    if let Some(heartbeat) = heartbeat {
        heartbeat.abort();
    }

    state.unregister(&client_id).await;
    tracing::info!(client = %client_id, user = %user, "client disconnected");
}

/// Waits for the `connect` frame and redeems its token.
async fn wait_for_connect(
    receiver: &mut (impl Stream<Item = Result<Message, axum::Error>> + Unpin),
    state: &BrokerState,
) -> Handshake {
    while let Some(Ok(msg)) = receiver.next().await {
        match msg {
            Message::Text(text) => {
                return match frame::decode_client(text.as_str()) {
                    Ok(ClientFrame::Connect { token }) => match state.redeem(&token).await {
                        Some(user) => Handshake::Accepted(user),
                        None => Handshake::Refused("invalid or expired token".into()),
                    },
                    Ok(other) => Handshake::Refused(format!("expected connect, got {other:?}")),
                    Err(e) => Handshake::Refused(e.to_string()),
                };
            }
            Message::Close(_) => return Handshake::Gone,
            _ => {}
        }
    }
    Handshake::Gone
}

/// Handles a text frame from an authenticated client.
async fn handle_text(client_id: &str, text: &str, state: &Arc<BrokerState>) {
    let frame = match frame::decode_client(text) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::warn!(client = %client_id, error = %e, "failed to decode client frame");
            return;
        }
    };

    match frame {
        ClientFrame::Subscribe { channel } => state.subscribe(client_id, &channel).await,
        ClientFrame::Unsubscribe { channel } => state.unsubscribe(client_id, &channel).await,
        ClientFrame::Presence { channel } => state.presence(client_id, &channel).await,
        ClientFrame::Pong => {
            state.pongs.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(client = %client_id, "pong");
        }
        ClientFrame::Connect { .. } => {
            tracing::warn!(client = %client_id, "duplicate connect from authenticated client");
        }
    }
}

/// Pings the client until its outbound channel closes.
async fn heartbeat_loop(period: Duration, sender: mpsc::UnboundedSender<Message>) {
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let ping = ServerFrame::Ping {
            timestamp: Some(chrono::Utc::now().to_rfc3339()),
        };
        if !send_frame(&sender, &ping) {
            break;
        }
    }
}

fn encode(frame: &ServerFrame) -> Option<String> {
    frame::encode_server(frame)
        .map_err(|e| tracing::error!(error = %e, "failed to encode broker frame"))
        .ok()
}

/// Queues a frame on a client's outbound channel. Returns `false` if the
/// client is gone.
fn send_frame(sender: &mpsc::UnboundedSender<Message>, frame: &ServerFrame) -> bool {
    encode(frame).is_some_and(|text| sender.send(Message::Text(text.into())).is_ok())
}

/// Queues a frame for every subscriber of `channel` except `except`.
fn broadcast(
    clients: &HashMap<String, ClientEntry>,
    channel: &str,
    except: &str,
    frame: &ServerFrame,
) {
    let Some(text) = encode(frame) else {
        return;
    };
    for (client_id, entry) in clients {
        if client_id != except && entry.channels.contains(channel) {
            let _ = entry.sender.send(Message::Text(text.clone().into()));
        }
    }
}

/// Encodes and sends a frame directly on a WebSocket sender.
async fn send_direct(
    ws_sender: &mut (impl Sink<Message, Error = axum::Error> + Unpin),
    frame: &ServerFrame,
) -> Result<(), String> {
    let text = frame::encode_server(frame).map_err(|e| e.to_string())?;
    ws_sender
        .send(Message::Text(text.into()))
        .await
        .map_err(|e| format!("WebSocket send error: {e}"))
}
