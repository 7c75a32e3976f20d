// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::doc_markdown,
    clippy::future_not_send,
    clippy::missing_panics_doc
)]

//! Reconnection against the in-process broker.
//!
//! Covers:
//! - a severed link is detected and a fresh session is opened with a new
//!   single-use token
//! - presence is cleared while disconnected and rebuilt from the next
//!   snapshot
//! - a broker-initiated close is retried like any unexpected drop
//! - `disconnect()` closes on purpose and suppresses every retry
//! - concurrent `connect()` calls share one broker connection
//!
//! ## Disconnect simulation
//!
//! A **TCP proxy** sits between the client's WebSocket and the broker; the
//! broker advertises the proxy address in its connection descriptors.
//! [`TcpProxy::sever`] aborts every proxied connection task, dropping both
//! streams, while the acceptor keeps running so reconnects get through.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bowlchat::api::{Credential, HttpApi};
use bowlchat::backoff::Backoff;
use bowlchat::client::ChatClient;
use bowlchat::controller::ControllerOptions;
use bowlchat::state::{ClientEvent, ConnectionState};
use bowlchat::transport::ws::WsConnector;
use bowlchat_broker::broker::BrokerState;
use bowlchat_broker::http::{WS_PATH, start_server_with_state};
use bowlchat_proto::descriptor::ChannelLayout;
use parking_lot::Mutex;
use tokio::sync::mpsc;

// =============================================================================
// TCP Proxy helper
// =============================================================================

/// Forwards TCP traffic from a local port to the broker.
struct TcpProxy {
    addr: SocketAddr,
    accept_handle: tokio::task::JoinHandle<()>,
    /// Per-connection tasks. Aborting these kills the TCP streams.
    conn_handles: Arc<Mutex<Vec<tokio::task::JoinHandle<()>>>>,
}

impl TcpProxy {
    async fn start(backend: SocketAddr) -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let conn_handles: Arc<Mutex<Vec<tokio::task::JoinHandle<()>>>> =
            Arc::new(Mutex::new(Vec::new()));
        let tracked = Arc::clone(&conn_handles);

        let accept_handle = tokio::spawn(async move {
            while let Ok((mut client_stream, _)) = listener.accept().await {
                let conn_handle = tokio::spawn(async move {
                    let Ok(mut backend_stream) = tokio::net::TcpStream::connect(backend).await
                    else {
                        return;
                    };
                    let _ = tokio::io::copy_bidirectional(&mut client_stream, &mut backend_stream)
                        .await;
                });
                tracked.lock().push(conn_handle);
            }
        });

        Self {
            addr,
            accept_handle,
            conn_handles,
        }
    }

    /// Severs every live connection; new connections are still accepted.
    fn sever(&self) {
        for handle in self.conn_handles.lock().drain(..) {
            handle.abort();
        }
    }
}

impl Drop for TcpProxy {
    fn drop(&mut self) {
        self.accept_handle.abort();
        self.sever();
    }
}

// =============================================================================
// Helpers
// =============================================================================

struct Harness {
    state: Arc<BrokerState>,
    api_url: String,
    proxy: TcpProxy,
}

/// Starts a broker whose descriptors point at a proxy in front of it.
async fn start_harness() -> Harness {
    let state = Arc::new(BrokerState::with_config(ChannelLayout::default(), None));
    let (addr, _handle) = start_server_with_state("127.0.0.1:0", Arc::clone(&state))
        .await
        .expect("failed to start broker");
    let proxy = TcpProxy::start(addr).await;
    state
        .set_public_url(format!("ws://{}{WS_PATH}", proxy.addr))
        .await;
    Harness {
        state,
        api_url: format!("http://{addr}"),
        proxy,
    }
}

fn client_for(harness: &Harness, user: &str) -> (ChatClient, mpsc::Receiver<ClientEvent>) {
    let api = HttpApi::new(&harness.api_url, Credential::SessionToken(user.into())).unwrap();
    ChatClient::spawn(
        api.clone(),
        WsConnector::default(),
        api,
        ControllerOptions {
            backoff: Backoff::new(Duration::from_millis(250), Duration::from_secs(1)),
            health_check: None,
            ..ControllerOptions::default()
        },
    )
}

/// Waits for an event matching `pred`, skipping others.
async fn wait_for_event<F>(
    rx: &mut mpsc::Receiver<ClientEvent>,
    description: &str,
    pred: F,
) -> ClientEvent
where
    F: Fn(&ClientEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match rx.recv().await {
                Some(event) if pred(&event) => return event,
                Some(_) => {}
                None => panic!("event stream closed while waiting for {description}"),
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timeout waiting for {description}"))
}

/// Polls `check` until it holds.
async fn eventually(description: &str, mut check: impl AsyncFnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timeout waiting for {description}"));
}

async fn wait_connected(client: &ChatClient) {
    tokio::time::timeout(
        Duration::from_secs(10),
        client.controller().wait_for_state(ConnectionState::Connected),
    )
    .await
    .expect("timeout waiting for Connected")
    .unwrap();
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn reconnects_after_link_is_severed() {
    let harness = start_harness().await;
    let (alice, mut events) = client_for(&harness, "alice");
    alice.connect().await.unwrap();
    eventually("alice in room", async || {
        harness.state.subscribers("room:main").await.contains("alice")
    })
    .await;

    harness.proxy.sever();

    let scheduled = wait_for_event(&mut events, "ReconnectScheduled", |e| {
        matches!(e, ClientEvent::ReconnectScheduled { .. })
    })
    .await;
    assert!(matches!(
        scheduled,
        ClientEvent::ReconnectScheduled {
            attempt: 1,
            delay
        } if delay == Duration::from_millis(250)
    ));

    wait_connected(&alice).await;
    eventually("alice back in room", async || {
        harness.state.subscribers("room:main").await.contains("alice")
    })
    .await;

    // The fresh session delivers publications again.
    let data = serde_json::json!({"id": "after", "content": "welcome back", "from": "bob"});
    harness.state.publish("room:main", &data).await;
    eventually("message after reconnect", async || {
        alice.view().message_count() == 1
    })
    .await;

    let status = alice.status().await.unwrap();
    assert_eq!(status.state, ConnectionState::Connected);
    assert_eq!(status.attempts, 0);
    assert!(!status.reconnect_pending);
    alice.shutdown().await;
}

#[tokio::test]
async fn presence_is_rebuilt_after_reconnect() {
    let harness = start_harness().await;
    let (alice, mut events) = client_for(&harness, "alice");
    let (bob, _bob_events) = client_for(&harness, "bob");
    alice.connect().await.unwrap();
    bob.connect().await.unwrap();
    eventually("alice sees bob", async || {
        alice.view().presence() == ["alice", "bob"]
    })
    .await;

    harness.proxy.sever();
    wait_for_event(&mut events, "ReconnectScheduled", |e| {
        matches!(e, ClientEvent::ReconnectScheduled { .. })
    })
    .await;
    // Stale presence is gone until the next snapshot.
    assert!(alice.view().presence().is_empty());

    wait_for_event(&mut events, "PresenceSeeded", |e| {
        matches!(e, ClientEvent::PresenceSeeded { .. })
    })
    .await;
    eventually("presence rebuilt", async || {
        alice.view().presence() == ["alice", "bob"]
    })
    .await;

    alice.shutdown().await;
    bob.shutdown().await;
}

#[tokio::test]
async fn broker_close_is_retried() {
    let harness = start_harness().await;
    let (alice, mut events) = client_for(&harness, "alice");
    alice.connect().await.unwrap();

    harness.state.close_all_connections().await;

    wait_for_event(&mut events, "ReconnectScheduled", |e| {
        matches!(e, ClientEvent::ReconnectScheduled { .. })
    })
    .await;
    wait_connected(&alice).await;
    alice.shutdown().await;
}

#[tokio::test]
async fn disconnect_suppresses_retry() {
    let harness = start_harness().await;
    let (alice, mut events) = client_for(&harness, "alice");
    alice.connect().await.unwrap();
    eventually("alice connected to broker", async || {
        harness.state.client_count().await == 1
    })
    .await;

    alice.disconnect().await;
    assert_eq!(alice.state(), ConnectionState::Disconnected);
    eventually("broker sees the close", async || {
        harness.state.client_count().await == 0
    })
    .await;

    // Several base delays pass without any retry.
    tokio::time::sleep(Duration::from_secs(1)).await;
    let status = alice.status().await.unwrap();
    assert_eq!(status.state, ConnectionState::Disconnected);
    assert!(!status.reconnect_pending);
    assert!(!status.attempt_in_flight);
    assert_eq!(harness.state.client_count().await, 0);
    while let Ok(event) = events.try_recv() {
        assert!(
            !matches!(event, ClientEvent::ReconnectScheduled { .. }),
            "retry scheduled after intentional disconnect"
        );
    }
    alice.shutdown().await;
}

#[tokio::test]
async fn concurrent_connects_share_one_session() {
    let harness = start_harness().await;
    let (alice, _events) = client_for(&harness, "alice");

    let (a, b, c) = tokio::join!(alice.connect(), alice.connect(), alice.connect());
    assert!(a.is_ok() && b.is_ok() && c.is_ok());

    eventually("subscriptions settle", async || {
        harness.state.subscribers("user:alice").await.contains("alice")
    })
    .await;
    assert_eq!(harness.state.client_count().await, 1);
    alice.shutdown().await;
}
