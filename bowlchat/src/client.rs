//! High-level chat client.
//!
//! [`ChatClient`] pairs a running reconnection controller with the send
//! endpoint. Outgoing messages go over HTTP; the backend fans them back out
//! over the channel, where they land in the buffer like any other message.
//!
//! ```text
//! UI ── send() ──▶ MessageSender ──▶ backend ──▶ broker
//!  ▲                                               │
//!  └── ClientEvent / ChatView ◀── controller ◀─────┘
//! ```

use tokio::sync::mpsc;

use bowlchat_proto::api::SendRequest;
use bowlchat_proto::event::ChatMessage;

use crate::api::{ApiError, HttpApi, MessageSender, TokenProvider};
use crate::config::{ClientConfig, ConfigError};
use crate::controller::{self, ConnectError, ControllerHandle, ControllerOptions};
use crate::state::{ChatView, ClientEvent, ConnectionState, ConnectionStatus};
use crate::transport::Connector;

/// Errors from sending a message.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    /// The message body is empty after trimming.
    #[error("message content is empty")]
    EmptyContent,

    /// A direct message named no recipient.
    #[error("direct message recipient is empty")]
    EmptyRecipient,

    /// The send endpoint failed.
    #[error(transparent)]
    Api(#[from] ApiError),
}

/// Errors from building a client out of configuration.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The configuration is incomplete.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The API client could not be built.
    #[error(transparent)]
    Api(#[from] ApiError),
}

/// A chat client: reconnection controller plus send endpoint.
pub struct ChatClient<S = HttpApi> {
    controller: ControllerHandle,
    sender: S,
}

impl ChatClient<HttpApi> {
    /// Builds a client that talks to the backend named in `config` and
    /// starts its controller. Does not connect yet.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError`] if the API URL or credential is missing or
    /// the API URL is unusable.
    pub fn from_config(
        config: &ClientConfig,
    ) -> Result<(Self, mpsc::Receiver<ClientEvent>), ClientError> {
        let api_url = config
            .api_url
            .as_deref()
            .ok_or(ConfigError::Missing("api_url"))?;
        let credential = config
            .credential()
            .ok_or(ConfigError::Missing("session_token or api_key"))?;
        let api = HttpApi::new(api_url, credential)?;

        Ok(Self::spawn(
            api.clone(),
            config.connector(),
            api,
            config.controller_options(),
        ))
    }
}

impl<S: MessageSender> ChatClient<S> {
    /// Starts a controller over `provider` and `connector` and pairs it
    /// with `sender`.
    pub fn spawn<P, C>(
        provider: P,
        connector: C,
        sender: S,
        options: ControllerOptions,
    ) -> (Self, mpsc::Receiver<ClientEvent>)
    where
        P: TokenProvider,
        C: Connector,
    {
        let (controller, events) = controller::spawn(provider, connector, options);
        (Self { controller, sender }, events)
    }

    /// Posts a message to the room.
    ///
    /// # Errors
    ///
    /// Returns [`SendError::EmptyContent`] for blank input, otherwise the
    /// send endpoint's error.
    pub async fn send(&self, content: &str) -> Result<ChatMessage, SendError> {
        self.post(content, None).await
    }

    /// Posts a direct message to `recipient`.
    ///
    /// # Errors
    ///
    /// Returns [`SendError::EmptyRecipient`] or [`SendError::EmptyContent`]
    /// for blank input, otherwise the send endpoint's error.
    pub async fn send_direct(
        &self,
        recipient: &str,
        content: &str,
    ) -> Result<ChatMessage, SendError> {
        let recipient = recipient.trim();
        if recipient.is_empty() {
            return Err(SendError::EmptyRecipient);
        }
        self.post(content, Some(recipient.to_string())).await
    }

    async fn post(
        &self,
        content: &str,
        to_username: Option<String>,
    ) -> Result<ChatMessage, SendError> {
        if content.trim().is_empty() {
            return Err(SendError::EmptyContent);
        }
        let request = SendRequest {
            content: content.to_string(),
            to_username,
        };
        let stored = self.sender.send_message(&request).await.map_err(|e| {
            tracing::warn!(err = %e, "send failed");
            e
        })?;
        tracing::debug!(id = ?stored.id, "message accepted");
        Ok(stored)
    }

    /// The underlying controller handle.
    #[must_use]
    pub const fn controller(&self) -> &ControllerHandle {
        &self.controller
    }

    /// See [`ControllerHandle::connect`].
    ///
    /// # Errors
    ///
    /// Returns the connect attempt's failure.
    pub async fn connect(&self) -> Result<(), ConnectError> {
        self.controller.connect().await
    }

    /// See [`ControllerHandle::disconnect`].
    pub async fn disconnect(&self) {
        self.controller.disconnect().await;
    }

    /// See [`ControllerHandle::status`].
    ///
    /// # Errors
    ///
    /// Returns [`ConnectError::Stopped`] if the controller is gone.
    pub async fn status(&self) -> Result<ConnectionStatus, ConnectError> {
        self.controller.status().await
    }

    /// Latest published connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.controller.state()
    }

    /// Read-only view of the message buffer and presence set.
    #[must_use]
    pub const fn view(&self) -> &ChatView {
        self.controller.view()
    }

    /// Disconnects and stops the controller.
    pub async fn shutdown(&self) {
        self.controller.shutdown().await;
    }
}
