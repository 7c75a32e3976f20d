//! REST endpoints and server startup.
//!
//! - `POST /ws/token` issues a connection descriptor.
//! - `POST /messages` stores a message and publishes it to the room, or to
//!   both private channels for a direct message.
//! - `GET /ws` upgrades to the broker WebSocket.
//!
//! This is a development backend: the bearer token or API key presented is
//! taken verbatim as the caller's identity.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::extract::ws::WebSocketUpgrade;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bowlchat_proto::api::{ErrorBody, SendRequest};
use bowlchat_proto::descriptor::ConnectionDescriptor;
use bowlchat_proto::event::ChatMessage;
use tokio::task::JoinHandle;

use crate::broker::{self, BrokerState};

/// Path of the WebSocket endpoint.
pub const WS_PATH: &str = "/ws";

/// Header carrying an API key.
pub const API_KEY_HEADER: &str = "x-api-key";

/// Errors returned by the REST endpoints as `{"detail": ...}` bodies.
#[derive(Debug, thiserror::Error)]
pub enum ApiFailure {
    /// No bearer token or API key was presented.
    #[error("missing credentials")]
    Unauthorized,

    /// The request body is unusable.
    #[error("{0}")]
    BadRequest(String),

    /// The message could not be encoded for publication.
    #[error("internal error: {0}")]
    Internal(String),
}

impl IntoResponse for ApiFailure {
    fn into_response(self) -> Response {
        let status = match self {
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = ErrorBody {
            detail: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

/// Builds the broker router over `state`.
pub fn router(state: Arc<BrokerState>) -> Router {
    Router::new()
        .route(WS_PATH, get(ws_handler))
        .route("/ws/token", post(issue_token))
        .route("/messages", post(send_message))
        .route("/health", get(|| async { "ok" }))
        .with_state(state)
}

/// Starts the broker on the given address with default state and returns
/// the bound address and a join handle.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server(
    addr: &str,
) -> Result<(SocketAddr, JoinHandle<()>), Box<dyn std::error::Error + Send + Sync>> {
    start_server_with_state(addr, Arc::new(BrokerState::default())).await
}

/// Starts the broker with a pre-configured [`BrokerState`].
///
/// If the state has no public URL yet, it is set to the bound address.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server_with_state(
    addr: &str,
    state: Arc<BrokerState>,
) -> Result<(SocketAddr, JoinHandle<()>), Box<dyn std::error::Error + Send + Sync>> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;
    if state.public_url().await.is_empty() {
        state
            .set_public_url(format!("ws://{bound_addr}{WS_PATH}"))
            .await;
    }

    let app = router(state);
    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "broker server error");
        }
    });

    Ok((bound_addr, handle))
}

/// axum handler that upgrades an HTTP request to a WebSocket connection.
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<BrokerState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| broker::handle_socket(socket, state))
}

/// The caller's identity: the bearer token, else the API key.
fn identity(headers: &HeaderMap) -> Result<String, ApiFailure> {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    let api_key = headers.get(API_KEY_HEADER).and_then(|v| v.to_str().ok());
    bearer
        .or(api_key)
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or(ApiFailure::Unauthorized)
}

async fn issue_token(
    State(state): State<Arc<BrokerState>>,
    headers: HeaderMap,
) -> Result<Json<ConnectionDescriptor>, ApiFailure> {
    let user = identity(&headers)?;
    let descriptor = ConnectionDescriptor {
        url: state.public_url().await,
        token: state.issue_token(&user).await,
        channels: state.layout().channels_for(&user),
    };
    tracing::info!(user = %user, "connection token issued");
    Ok(Json(descriptor))
}

async fn send_message(
    State(state): State<Arc<BrokerState>>,
    headers: HeaderMap,
    Json(request): Json<SendRequest>,
) -> Result<Json<ChatMessage>, ApiFailure> {
    let from = identity(&headers)?;
    let content = request.content.trim();
    if content.is_empty() {
        return Err(ApiFailure::BadRequest("content must not be empty".into()));
    }

    let mut message = ChatMessage::new(from.as_str(), content)
        .with_id(uuid::Uuid::now_v7().to_string())
        .with_timestamp(chrono::Utc::now().to_rfc3339());
    let layout = state.layout();
    let recipient = request
        .to_username
        .as_deref()
        .map(str::trim)
        .filter(|to| !to.is_empty());
    let channels = match recipient {
        Some(to) => {
            message = message.with_recipient(to);
            let mut channels = vec![layout.private_channel(to)];
            if to != from {
                channels.push(layout.private_channel(&from));
            }
            channels
        }
        None => vec![layout.room().to_string()],
    };

    let data = serde_json::to_value(&message).map_err(|e| ApiFailure::Internal(e.to_string()))?;
    for channel in &channels {
        state.publish(channel, &data).await;
    }
    tracing::info!(from = %from, to = ?message.to, id = ?message.id, "message published");
    Ok(Json(message))
}
