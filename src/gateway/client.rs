//! Public gateway client.
//!
//! [`GatewayClient`] is a cheap, cloneable handle. All clones share one
//! connection, one correlation table and one set of event subscriptions.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::gateway::connection::{
    self, Command, ConnectionSetup, ConnectionState, LinkOptions, Shared,
};
use crate::gateway::error::{CallError, CloseReason, ConnectError};
use crate::gateway::events::{
    EventHandler, EventPredicate, SubscriptionId, SubscriptionScope,
};
use crate::gateway::proto::{
    AuthParams, ClientInfo, ConnectParams, Envelope, GatewayEvent, RequestFrame, ServerHello,
    PROTOCOL_VERSION,
};
use crate::gateway::transport::{ConnectTarget, Connector, WebSocketConnector};
use crate::retry::{with_timeout, RetryPolicy};

/// Default values used by [`GatewayClientOptions`] and [`ConnectConfig`].
#[derive(Clone, Copy, Debug)]
pub struct GatewayDefaults;

impl GatewayDefaults {
    pub const URL: &'static str = "ws://127.0.0.1:18789";
    pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
    pub const ROLE: &'static str = "operator";
    pub const SCOPE: &'static str = "operator.admin";
}

/// Tuning for a [`GatewayClient`]. Every extension is off by default except
/// the handshake timeout.
#[derive(Clone, Debug)]
pub struct GatewayClientOptions {
    /// Upper bound for the handshake ack. `None` waits forever.
    pub handshake_timeout: Option<Duration>,
    /// Upper bound for a single call. `None` waits until the call is retired.
    pub call_timeout: Option<Duration>,
    /// Re-establish a lost connection with this backoff policy.
    pub reconnect: Option<RetryPolicy>,
    /// Consecutive undecodable frames tolerated before the connection fails.
    pub decode_error_limit: Option<u32>,
}

impl Default for GatewayClientOptions {
    fn default() -> Self {
        Self {
            handshake_timeout: Some(GatewayDefaults::HANDSHAKE_TIMEOUT),
            call_timeout: None,
            reconnect: None,
            decode_error_limit: None,
        }
    }
}

impl GatewayClientOptions {
    /// Limit for the handshake ack. `None` waits indefinitely.
    pub fn with_handshake_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Fails calls with `CallError::Timeout` when no response arrives in time.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }

    /// Re-establishes a dropped connection using `policy` backoff.
    pub fn with_reconnect(mut self, policy: RetryPolicy) -> Self {
        self.reconnect = Some(policy);
        self
    }

    /// Fails the connection after `limit` consecutive undecodable frames.
    pub fn with_decode_error_limit(mut self, limit: u32) -> Self {
        self.decode_error_limit = Some(limit.max(1));
        self
    }

    fn link_options(&self) -> LinkOptions {
        LinkOptions {
            handshake_timeout: self.handshake_timeout,
            reconnect: self.reconnect.clone(),
            decode_error_limit: self.decode_error_limit,
        }
    }
}

/// Where to connect and how to identify.
#[derive(Clone, Debug)]
pub struct ConnectConfig {
    pub url: String,
    pub auth_token: Option<SecretString>,
    /// Extra headers sent on the upgrade request.
    pub headers: BTreeMap<String, String>,
    pub client: ClientInfo,
    pub role: String,
    pub scopes: Vec<String>,
    pub min_protocol: u32,
    pub max_protocol: u32,
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            url: GatewayDefaults::URL.to_string(),
            auth_token: None,
            headers: BTreeMap::new(),
            client: ClientInfo::default(),
            role: GatewayDefaults::ROLE.to_string(),
            scopes: vec![GatewayDefaults::SCOPE.to_string()],
            min_protocol: PROTOCOL_VERSION,
            max_protocol: PROTOCOL_VERSION,
        }
    }
}

impl ConnectConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into().trim().to_string(),
            ..Self::default()
        }
    }

    pub fn with_auth_token(mut self, token: SecretString) -> Self {
        self.auth_token = Some(token);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_client(mut self, client: ClientInfo) -> Self {
        self.client = client;
        self
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = role.into();
        self
    }

    pub fn with_scopes<I, S>(mut self, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scopes = scopes.into_iter().map(Into::into).collect();
        self
    }

    /// Handshake params sent as the first request of every connection.
    pub fn connect_params(&self) -> ConnectParams {
        ConnectParams {
            min_protocol: self.min_protocol,
            max_protocol: self.max_protocol,
            client: self.client.clone(),
            role: self.role.clone(),
            scopes: self.scopes.clone(),
            auth: self.auth_token.as_ref().map(|token| AuthParams {
                token: token.expose_secret().to_string(),
            }),
        }
    }

    fn setup(&self) -> ConnectionSetup {
        ConnectionSetup {
            target: ConnectTarget {
                url: self.url.clone(),
                auth_token: self.auth_token.clone(),
                headers: self.headers.clone(),
            },
            params: self.connect_params(),
        }
    }
}

struct Inner {
    shared: Arc<Shared>,
    connector: Arc<dyn Connector>,
    options: GatewayClientOptions,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(link) = self.shared.current_link() {
            let _ = link.commands.send(Command::Close(CloseReason::ClientDropped));
        }
    }
}

/// Request/response and event client for one gateway connection.
#[derive(Clone)]
pub struct GatewayClient {
    inner: Arc<Inner>,
}

impl Default for GatewayClient {
    fn default() -> Self {
        Self::new()
    }
}

impl GatewayClient {
    /// Creates a client that connects over WebSocket with default options.
    pub fn new() -> Self {
        Self::with_options(GatewayClientOptions::default())
    }

    pub fn with_options(options: GatewayClientOptions) -> Self {
        Self::with_connector(Arc::new(WebSocketConnector), options)
    }

    /// Creates a client over a custom transport.
    pub fn with_connector(connector: Arc<dyn Connector>, options: GatewayClientOptions) -> Self {
        Self {
            inner: Arc::new(Inner {
                shared: Arc::new(Shared::new()),
                connector,
                options,
            }),
        }
    }

    /// Opens the connection and completes the handshake.
    ///
    /// Returns the existing handshake result when already connected, and
    /// joins the attempt in flight when one is running, so concurrent callers
    /// never open more than one transport. `config` is only read when a new
    /// attempt is started.
    pub async fn connect(&self, config: ConnectConfig) -> Result<ServerHello, ConnectError> {
        let mut outcome = connection::start_or_join(
            &self.inner.shared,
            &self.inner.connector,
            config.setup(),
            self.inner.options.link_options(),
        );

        let result = match outcome.wait_for(Option::is_some).await {
            Ok(settled) => settled.clone(),
            Err(_) => None,
        };
        result.unwrap_or(Err(ConnectError::Aborted(CloseReason::ClientDropped)))
    }

    /// Sends one request and waits for its response payload.
    ///
    /// Fails immediately with [`CallError::NotConnected`] unless the client
    /// is `Ready`.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, CallError> {
        let shared = &self.inner.shared;
        if !shared.state().is_ready() {
            return Err(CallError::NotConnected);
        }
        let link = shared.current_link().ok_or(CallError::NotConnected)?;

        let id = shared.next_request_id();
        let frame = Envelope::Request(RequestFrame {
            id: id.clone(),
            method: method.to_string(),
            params,
        })
        .to_text()
        .map_err(|err| CallError::Encode(err.to_string()))?;

        let reply = shared.pending.register(&id, method)?;
        debug!(event = "gateway_call_started", id = reply.id(), method);
        link.commands
            .send(Command::Send {
                epoch: reply.epoch(),
                id,
                frame,
            })
            .map_err(|_| CallError::NotConnected)?;

        let limit = self.inner.options.call_timeout;
        with_timeout(limit, reply.wait())
            .await
            .map_err(|_| CallError::Timeout(limit.unwrap_or_default()))?
    }

    /// Typed variant of [`call`](Self::call).
    pub async fn request<P, R>(&self, method: &str, params: &P) -> Result<R, CallError>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let params =
            serde_json::to_value(params).map_err(|err| CallError::Encode(err.to_string()))?;
        let payload = self.call(method, params).await?;
        serde_json::from_value(payload).map_err(CallError::Decode)
    }

    /// Closes the connection and fails outstanding calls with
    /// `ConnectionClosed(UserRequested)`. Also aborts a connect attempt or
    /// reconnect backoff in progress. Calling it while disconnected is a
    /// no-op.
    pub async fn disconnect(&self) {
        let Some(link) = self.inner.shared.current_link() else {
            return;
        };
        let _ = link.commands.send(Command::Close(CloseReason::UserRequested));
        link.commands.closed().await;
    }

    /// Subscribes to every event for the lifetime of the current connection.
    pub fn on_event<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&GatewayEvent) + Send + Sync + 'static,
    {
        self.subscribe(SubscriptionScope::Connection, None, Arc::new(handler))
    }

    /// Subscribes to events accepted by `predicate`.
    pub fn on_event_filtered<P, F>(&self, predicate: P, handler: F) -> SubscriptionId
    where
        P: Fn(&GatewayEvent) -> bool + Send + Sync + 'static,
        F: Fn(&GatewayEvent) + Send + Sync + 'static,
    {
        self.subscribe(
            SubscriptionScope::Connection,
            Some(Arc::new(predicate)),
            Arc::new(handler),
        )
    }

    pub fn subscribe(
        &self,
        scope: SubscriptionScope,
        predicate: Option<EventPredicate>,
        handler: EventHandler,
    ) -> SubscriptionId {
        self.inner.shared.events.subscribe(scope, predicate, handler)
    }

    /// Delivers events through a channel instead of a callback.
    pub fn event_channel(
        &self,
        scope: SubscriptionScope,
    ) -> (SubscriptionId, mpsc::UnboundedReceiver<GatewayEvent>) {
        self.inner.shared.events.subscribe_channel(scope, None)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.shared.events.unsubscribe(id)
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.shared.state()
    }

    /// Observes every lifecycle transition.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.inner.shared.subscribe_state()
    }

    /// Calls still waiting for a response.
    pub fn pending_calls(&self) -> usize {
        self.inner.shared.pending.len()
    }

    pub fn subscription_count(&self) -> usize {
        self.inner.shared.events.len()
    }

    pub fn options(&self) -> &GatewayClientOptions {
        &self.inner.options
    }
}
