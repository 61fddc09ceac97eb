use std::time::Duration;

use reqwest::{Client, Method, StatusCode, Url};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::{ConfigError, ServerConfig};
use crate::models::{GatewayStatus, MessageList, SendMessageRequest, SessionList, SessionSummary};
use crate::retry::{retry_async, RetryPolicy};

const ERROR_BODY_SNIPPET_LEN: usize = 220;
pub const LOCAL_HTTP_BASE_URL: &str = "http://127.0.0.1:18789";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct HttpApiDefaults;

impl HttpApiDefaults {
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
    pub const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(15);
    pub const MAX_ATTEMPTS: usize = 3;
    pub const BACKOFF: Duration = Duration::from_millis(100);
    pub const MAX_BACKOFF: Duration = Duration::from_millis(800);
    pub const JITTER: Duration = Duration::from_millis(50);
    pub const HISTORY_LIMIT: u32 = 50;
}

#[derive(Clone, Debug)]
pub struct HttpApiClientOptions {
    pub connect_timeout: Duration,
    pub attempt_timeout: Duration,
    /// Applied to GET requests only.
    pub retry_policy: RetryPolicy,
    pub headers: Vec<(String, String)>,
}

impl Default for HttpApiClientOptions {
    fn default() -> Self {
        Self {
            connect_timeout: HttpApiDefaults::CONNECT_TIMEOUT,
            attempt_timeout: HttpApiDefaults::ATTEMPT_TIMEOUT,
            retry_policy: RetryPolicy {
                max_attempts: HttpApiDefaults::MAX_ATTEMPTS,
                initial_backoff: HttpApiDefaults::BACKOFF,
                max_backoff: HttpApiDefaults::MAX_BACKOFF,
                jitter: HttpApiDefaults::JITTER,
            },
            headers: Vec::new(),
        }
    }
}

/// Stateless client for the gateway's `/api` HTTP routes.
#[derive(Clone)]
pub struct GatewayHttpClient {
    http: Client,
    base_url: Url,
    auth_token: Option<SecretString>,
    attempt_timeout: Duration,
    retry_policy: RetryPolicy,
    headers: Vec<(String, String)>,
}

impl GatewayHttpClient {
    /// Unauthenticated client with default options.
    pub fn new(base_url: &str) -> Result<Self, HttpApiError> {
        Self::with_options(base_url, None, HttpApiClientOptions::default())
    }

    /// Client that sends `Authorization: Bearer <token>` on every request.
    pub fn with_auth_token(base_url: &str, auth_token: SecretString) -> Result<Self, HttpApiError> {
        Self::with_options(base_url, Some(auth_token), HttpApiClientOptions::default())
    }

    /// Builds a client from persisted settings, reusing its token and headers.
    pub fn from_server_config(config: &ServerConfig) -> Result<Self, HttpApiError> {
        let options = HttpApiClientOptions {
            headers: config
                .custom_headers
                .iter()
                .map(|(name, value)| (name.clone(), value.clone()))
                .collect(),
            ..HttpApiClientOptions::default()
        };
        Self::with_options(&config.http_base_url()?, config.auth_token.clone(), options)
    }

    /// Client with explicit timeouts, retry policy and extra headers.
    pub fn with_options(
        base_url: &str,
        auth_token: Option<SecretString>,
        options: HttpApiClientOptions,
    ) -> Result<Self, HttpApiError> {
        let base_url = Url::parse(base_url.trim().trim_end_matches('/'))
            .map_err(|err| HttpApiError::InvalidUrl(format!("{base_url}: {err}")))?;
        if base_url.cannot_be_a_base() {
            return Err(HttpApiError::InvalidUrl(base_url.to_string()));
        }

        let http = Client::builder()
            .connect_timeout(options.connect_timeout)
            .build()
            .map_err(HttpApiError::Transport)?;

        Ok(Self {
            http,
            base_url,
            auth_token,
            attempt_timeout: options.attempt_timeout,
            retry_policy: options.retry_policy,
            headers: options.headers,
        })
    }

    /// Base URL every endpoint is joined onto.
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// `GET /api/status`.
    pub async fn status(&self) -> Result<GatewayStatus, HttpApiError> {
        self.get(self.endpoint(&["api", "status"])).await
    }

    /// Accepts both a bare array and a `{"sessions": [...]}` body.
    pub async fn sessions(&self) -> Result<Vec<SessionSummary>, HttpApiError> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum SessionsBody {
            Bare(Vec<SessionSummary>),
            Wrapped(SessionList),
        }

        let body: SessionsBody = self.get(self.endpoint(&["api", "sessions"])).await?;
        Ok(match body {
            SessionsBody::Bare(sessions) => sessions,
            SessionsBody::Wrapped(list) => list.sessions,
        })
    }

    /// Transcript of `session_key`. `limit` defaults to 50.
    pub async fn messages(
        &self,
        session_key: &str,
        limit: Option<u32>,
    ) -> Result<MessageList, HttpApiError> {
        let mut url = self.endpoint(&["api", "sessions", session_key, "messages"]);
        url.query_pairs_mut().append_pair(
            "limit",
            &limit.unwrap_or(HttpApiDefaults::HISTORY_LIMIT).to_string(),
        );
        self.get(url).await
    }

    /// `POST /api/message`. Never retried.
    pub async fn send_message(&self, request: &SendMessageRequest) -> Result<(), HttpApiError> {
        let url = self.endpoint(&["api", "message"]);
        self.send_attempt(Method::POST, &url, Some(request)).await?;
        Ok(())
    }

    /// Whether the gateway answers `/api/status`.
    pub async fn test_connection(&self) -> bool {
        match self.status().await {
            Ok(_) => true,
            Err(err) => {
                warn!(event = "http_api_unreachable", base_url = %self.base_url, error = %err);
                false
            }
        }
    }

    async fn get<R: DeserializeOwned>(&self, url: Url) -> Result<R, HttpApiError> {
        let policy = self.retry_policy.clone();
        let body = retry_async(
            &policy,
            |_| {
                let url = url.clone();
                async move { self.send_attempt::<()>(Method::GET, &url, None).await }
            },
            HttpApiError::is_retryable,
        )
        .await?;

        serde_json::from_str(&body).map_err(|err| HttpApiError::Parse(err.to_string()))
    }

    async fn send_attempt<T: Serialize + ?Sized>(
        &self,
        method: Method,
        url: &Url,
        body: Option<&T>,
    ) -> Result<String, HttpApiError> {
        let mut builder = self
            .http
            .request(method.clone(), url.clone())
            .timeout(self.attempt_timeout);
        if let Some(body) = body {
            builder = builder.json(body);
        }
        if let Some(token) = self.auth_token.as_ref() {
            builder = builder.bearer_auth(token.expose_secret());
        }
        for (name, value) in &self.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder.send().await.map_err(HttpApiError::Transport)?;
        let status = response.status();
        let body = response.text().await.map_err(HttpApiError::Transport)?;
        debug!(event = "http_api_response", %method, path = url.path(), status = status.as_u16());

        if !status.is_success() {
            return Err(HttpApiError::HttpStatus {
                status,
                body: summarize_error_body(&body),
            });
        }
        Ok(body)
    }

    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }
}

#[derive(Debug, Error)]
pub enum HttpApiError {
    #[error("request failed: {0}")]
    Transport(reqwest::Error),

    #[error("http status {status}: {body}")]
    HttpStatus { status: StatusCode, body: String },

    #[error("failed to parse response: {0}")]
    Parse(String),

    #[error("invalid base url: {0}")]
    InvalidUrl(String),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl HttpApiError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(err) => err.is_timeout() || err.is_connect(),
            Self::HttpStatus { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            Self::Parse(_) | Self::InvalidUrl(_) | Self::Config(_) => false,
        }
    }
}

fn summarize_error_body(body: &str) -> String {
    #[derive(Debug, Deserialize)]
    struct ErrorBody {
        #[serde(default)]
        error: Option<String>,
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        reason: Option<String>,
    }

    if let Ok(parsed) = serde_json::from_str::<ErrorBody>(body) {
        if let Some(message) = parsed.error.or(parsed.message).or(parsed.reason) {
            return message;
        }
    }

    body.chars().take(ERROR_BODY_SNIPPET_LEN).collect()
}
