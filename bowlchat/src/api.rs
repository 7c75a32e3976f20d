//! HTTP collaborators: the token endpoint and the send endpoint.
//!
//! The controller only sees the [`TokenProvider`] trait, so tests can
//! substitute a scripted provider. [`HttpApi`] implements both traits with
//! `reqwest` against the backend REST API.

use std::future::Future;

use bowlchat_proto::api::{ErrorBody, SendRequest};
use bowlchat_proto::descriptor::ConnectionDescriptor;
use bowlchat_proto::event::ChatMessage;

/// Path of the connection token endpoint, relative to the API base.
pub const TOKEN_PATH: &str = "ws/token";

/// Path of the send endpoint, relative to the API base.
pub const MESSAGES_PATH: &str = "messages";

/// Errors from the REST collaborators.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApiError {
    /// The API base URL cannot be used.
    #[error("invalid api url {url}: {reason}")]
    InvalidUrl {
        /// The offending URL.
        url: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The request never produced a response.
    #[error("network error: {0}")]
    Network(String),

    /// The backend answered with a non-success status.
    #[error("http {status}: {detail}")]
    Http {
        /// HTTP status code.
        status: u16,
        /// Backend-provided reason, or the raw body.
        detail: String,
    },

    /// The response body did not have the expected shape.
    #[error("unexpected response body: {0}")]
    Decode(String),

    /// The token endpoint returned an unusable descriptor.
    #[error("invalid connection descriptor: {0}")]
    InvalidDescriptor(String),
}

/// Opaque credential presented to the REST API.
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    /// Sent as `Authorization: Bearer <token>`.
    SessionToken(String),
    /// Sent as `X-API-Key: <key>`.
    ApiKey(String),
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SessionToken(_) => f.write_str("SessionToken(..)"),
            Self::ApiKey(_) => f.write_str("ApiKey(..)"),
        }
    }
}

impl Credential {
    fn apply(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self {
            Self::SessionToken(token) => request.bearer_auth(token),
            Self::ApiKey(key) => request.header("X-API-Key", key),
        }
    }
}

/// Issues a fresh [`ConnectionDescriptor`] for every connect attempt.
pub trait TokenProvider: Send + Sync + 'static {
    /// Fetches a new descriptor.
    fn fetch_descriptor(
        &self,
    ) -> impl Future<Output = Result<ConnectionDescriptor, ApiError>> + Send;
}

/// Posts outgoing messages. The backend fans them back out over the channel.
pub trait MessageSender: Send + Sync + 'static {
    /// Sends one message and returns the stored copy.
    fn send_message(
        &self,
        request: &SendRequest,
    ) -> impl Future<Output = Result<ChatMessage, ApiError>> + Send;
}

/// `reqwest`-backed client for the backend REST API.
#[derive(Debug, Clone)]
pub struct HttpApi {
    client: reqwest::Client,
    base: url::Url,
    credential: Credential,
}

impl HttpApi {
    /// Creates a client for the API rooted at `api_url`.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::InvalidUrl`] if `api_url` is not an absolute
    /// http(s) URL.
    pub fn new(api_url: &str, credential: Credential) -> Result<Self, ApiError> {
        let invalid = |reason: String| ApiError::InvalidUrl {
            url: api_url.to_string(),
            reason,
        };
        let mut base = url::Url::parse(api_url).map_err(|e| invalid(e.to_string()))?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(invalid(format!("unsupported scheme {}", base.scheme())));
        }
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Ok(Self {
            client: reqwest::Client::new(),
            base,
            credential,
        })
    }

    /// The API base URL, always ending in `/`.
    #[must_use]
    pub const fn base_url(&self) -> &url::Url {
        &self.base
    }

    fn endpoint(&self, path: &str) -> Result<url::Url, ApiError> {
        self.base.join(path).map_err(|e| ApiError::InvalidUrl {
            url: format!("{}{path}", self.base),
            reason: e.to_string(),
        })
    }

    async fn post<B, R>(&self, path: &str, body: Option<&B>) -> Result<R, ApiError>
    where
        B: serde::Serialize + Sync,
        R: serde::de::DeserializeOwned,
    {
        let url = self.endpoint(path)?;
        let mut request = self.credential.apply(self.client.post(url.clone()));
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request.send().await.map_err(|e| {
            tracing::warn!(url = %url, err = %e, "api request failed");
            ApiError::Network(e.to_string())
        })?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| ApiError::Network(format!("failed to read body: {e}")))?;
        if !status.is_success() {
            let detail = serde_json::from_str::<ErrorBody>(&text).map_or(text, |body| body.detail);
            tracing::warn!(url = %url, status = status.as_u16(), detail = %detail, "api error response");
            return Err(ApiError::Http {
                status: status.as_u16(),
                detail,
            });
        }
        serde_json::from_str(&text).map_err(|e| ApiError::Decode(e.to_string()))
    }
}

impl TokenProvider for HttpApi {
    async fn fetch_descriptor(&self) -> Result<ConnectionDescriptor, ApiError> {
        let descriptor: ConnectionDescriptor = self.post::<(), _>(TOKEN_PATH, None).await?;
        descriptor
            .validate()
            .map_err(|e| ApiError::InvalidDescriptor(e.to_string()))?;
        tracing::debug!(url = %descriptor.url, channels = ?descriptor.channels, "connection token issued");
        Ok(descriptor)
    }
}

impl MessageSender for HttpApi {
    async fn send_message(&self, request: &SendRequest) -> Result<ChatMessage, ApiError> {
        self.post(MESSAGES_PATH, Some(request)).await
    }
}
