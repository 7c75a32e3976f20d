// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::doc_markdown,
    clippy::future_not_send,
    clippy::missing_panics_doc
)]

//! The client against the in-process broker over real HTTP and WebSocket.
//!
//! Covers:
//! - presence seeded from the snapshot and kept current by joins and leaves
//! - room sends fan out to every connected client, the sender included
//! - direct messages reach only the two private channels involved
//! - duplicate publications are buffered once, in arrival order
//! - heartbeats and read receipts are answered or logged, never buffered

use std::sync::Arc;
use std::time::Duration;

use bowlchat::api::{Credential, HttpApi};
use bowlchat::client::ChatClient;
use bowlchat::controller::ControllerOptions;
use bowlchat::state::ClientEvent;
use bowlchat::transport::ws::WsConnector;
use bowlchat_broker::broker::BrokerState;
use bowlchat_broker::http::start_server_with_state;
use bowlchat_proto::descriptor::ChannelLayout;
use serde_json::json;
use tokio::sync::mpsc;

// =============================================================================
// Helpers
// =============================================================================

async fn start_broker(heartbeat: Option<Duration>) -> (Arc<BrokerState>, String) {
    let state = Arc::new(BrokerState::with_config(ChannelLayout::default(), heartbeat));
    let (addr, _handle) = start_server_with_state("127.0.0.1:0", Arc::clone(&state))
        .await
        .expect("failed to start broker");
    (state, format!("http://{addr}"))
}

fn client_for(api_url: &str, user: &str) -> (ChatClient, mpsc::Receiver<ClientEvent>) {
    let api = HttpApi::new(api_url, Credential::SessionToken(user.into())).unwrap();
    ChatClient::spawn(
        api.clone(),
        WsConnector::default(),
        api,
        ControllerOptions {
            health_check: None,
            ..ControllerOptions::default()
        },
    )
}

/// Connects `user` and waits until both of its channels are live on the
/// broker.
async fn connected(
    state: &BrokerState,
    api_url: &str,
    user: &str,
) -> (ChatClient, mpsc::Receiver<ClientEvent>) {
    let (client, events) = client_for(api_url, user);
    client.connect().await.unwrap();
    let private = format!("user:{user}");
    eventually("subscriptions settle", async || {
        state.subscribers("room:main").await.contains(user)
            && state.subscribers(&private).await.contains(user)
    })
    .await;
    (client, events)
}

/// Polls `check` until it holds.
async fn eventually(description: &str, mut check: impl AsyncFnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timeout waiting for {description}"));
}

fn ids(client: &ChatClient) -> Vec<String> {
    client
        .view()
        .messages()
        .into_iter()
        .filter_map(|m| m.id)
        .collect()
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn presence_follows_joins_and_leaves() {
    let (state, api_url) = start_broker(None).await;
    let (alice, _a) = connected(&state, &api_url, "alice").await;
    eventually("alice sees herself", async || {
        alice.view().presence() == ["alice"]
    })
    .await;

    let (bob, _b) = connected(&state, &api_url, "bob").await;
    eventually("alice sees bob join", async || {
        alice.view().presence() == ["alice", "bob"]
    })
    .await;
    eventually("bob's snapshot", async || {
        bob.view().presence() == ["alice", "bob"]
    })
    .await;

    let (carol, _c) = connected(&state, &api_url, "carol").await;
    eventually("carol joins", async || {
        alice.view().presence() == ["alice", "bob", "carol"]
    })
    .await;

    bob.shutdown().await;
    eventually("bob leaves", async || {
        alice.view().presence() == ["alice", "carol"]
    })
    .await;

    alice.shutdown().await;
    carol.shutdown().await;
}

#[tokio::test]
async fn room_message_fans_out_to_everyone() {
    let (state, api_url) = start_broker(None).await;
    let (alice, mut alice_events) = connected(&state, &api_url, "alice").await;
    let (bob, _b) = connected(&state, &api_url, "bob").await;

    let stored = alice.send("hello room").await.unwrap();
    let id = stored.id.clone().unwrap();
    assert_eq!(stored.from, "alice");
    assert!(!stored.is_direct());

    eventually("bob receives", async || ids(&bob) == [id.as_str()]).await;
    eventually("alice receives her own message", async || {
        ids(&alice) == [id.as_str()]
    })
    .await;

    let received = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match alice_events.recv().await {
                Some(ClientEvent::MessageReceived { channel, message }) => {
                    return (channel, message);
                }
                Some(_) => {}
                None => panic!("event stream closed"),
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(received.0, "room:main");
    assert_eq!(received.1.content, "hello room");

    alice.shutdown().await;
    bob.shutdown().await;
}

#[tokio::test]
async fn direct_message_reaches_only_the_two_parties() {
    let (state, api_url) = start_broker(None).await;
    let (alice, _a) = connected(&state, &api_url, "alice").await;
    let (bob, _b) = connected(&state, &api_url, "bob").await;
    let (carol, _c) = connected(&state, &api_url, "carol").await;

    let dm = alice.send_direct("bob", "just between us").await.unwrap();
    assert_eq!(dm.to.as_deref(), Some("bob"));
    let dm_id = dm.id.unwrap();

    eventually("bob gets the dm", async || ids(&bob) == [dm_id.as_str()]).await;
    eventually("alice gets her copy", async || {
        ids(&alice) == [dm_id.as_str()]
    })
    .await;

    // A later room message reaches carol; the dm never did.
    let room = bob.send("hi all").await.unwrap();
    let room_id = room.id.unwrap();
    eventually("carol gets the room message", async || {
        ids(&carol) == [room_id.as_str()]
    })
    .await;

    alice.shutdown().await;
    bob.shutdown().await;
    carol.shutdown().await;
}

#[tokio::test]
async fn duplicate_publications_are_buffered_once() {
    let (state, api_url) = start_broker(None).await;
    let (alice, _a) = connected(&state, &api_url, "alice").await;

    let m1 = json!({"id": "m1", "content": "first", "from": "bob"});
    let m2 = json!({"id": "m2", "content": "second", "from": "bob"});
    state.publish("room:main", &m1).await;
    state.publish("room:main", &m1).await;
    state.publish("room:main", &m2).await;
    // Same id over the private channel is still a duplicate.
    state.publish("user:alice", &m2).await;

    eventually("both messages", async || ids(&alice) == ["m1", "m2"]).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(alice.view().message_count(), 2);

    alice.shutdown().await;
}

#[tokio::test]
async fn heartbeats_and_receipts_are_never_buffered() {
    let (state, api_url) = start_broker(Some(Duration::from_millis(50))).await;
    let (alice, _a) = connected(&state, &api_url, "alice").await;

    state
        .publish("room:main", &json!({"type": "ping", "timestamp": "2024-01-20T15:30:45Z"}))
        .await;
    state
        .publish(
            "room:main",
            &json!({"type": "read_receipt", "message_id": "m0", "read_by": "bob"}),
        )
        .await;
    state
        .publish("room:main", &json!({"id": "m1", "content": "real", "from": "bob"}))
        .await;

    eventually("chat message arrives", async || ids(&alice) == ["m1"]).await;
    eventually("connection pings answered", async || state.pong_count() >= 2).await;
    assert_eq!(alice.view().message_count(), 1);

    alice.shutdown().await;
}

#[tokio::test]
async fn send_failures_reach_the_caller() {
    let (state, api_url) = start_broker(None).await;
    let (alice, _a) = connected(&state, &api_url, "alice").await;

    let err = alice.send("   ").await.unwrap_err();
    assert!(matches!(err, bowlchat::client::SendError::EmptyContent));

    // Unreachable backend surfaces as an API error, not a panic.
    let (offline, _o) = client_for("http://127.0.0.1:9", "alice");
    assert!(matches!(
        offline.send("hello").await,
        Err(bowlchat::client::SendError::Api(_))
    ));

    alice.shutdown().await;
    offline.shutdown().await;
}
