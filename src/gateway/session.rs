//! Typed request layer above [`GatewayClient`].
//!
//! `GatewaySession` maps the gateway's operator methods onto
//! [`crate::models`] types. It holds no state of its own; every method is a
//! single [`GatewayClient::request`].

use uuid::Uuid;

use crate::gateway::client::{ConnectConfig, GatewayClient};
use crate::gateway::error::{CallError, ConnectError};
use crate::gateway::proto::ServerHello;
use crate::models::{
    ChatHistoryParams, ChatSendAck, ChatSendParams, GatewayStatus, MessageList, SessionList,
    SessionsListParams,
};

pub const METHOD_STATUS: &str = "status";
pub const METHOD_SESSIONS_LIST: &str = "sessions.list";
pub const METHOD_CHAT_HISTORY: &str = "chat.history";
pub const METHOD_CHAT_SEND: &str = "chat.send";

#[derive(Clone)]
pub struct GatewaySession {
    client: GatewayClient,
}

impl GatewaySession {
    /// Connects `client` and wraps it.
    pub async fn connect(
        client: GatewayClient,
        config: ConnectConfig,
    ) -> Result<(Self, ServerHello), ConnectError> {
        let hello = client.connect(config).await?;
        Ok((Self { client }, hello))
    }

    /// Wraps a client that is already connected or will be connected later.
    pub fn from_client(client: GatewayClient) -> Self {
        Self { client }
    }

    /// Underlying client, for raw calls and event subscriptions.
    pub fn client(&self) -> &GatewayClient {
        &self.client
    }

    /// Gateway health, memory and channel overview (`status`).
    pub async fn status(&self) -> Result<GatewayStatus, CallError> {
        self.client
            .request(METHOD_STATUS, &serde_json::json!({}))
            .await
    }

    /// Sessions known to the gateway (`sessions.list`).
    pub async fn list_sessions(
        &self,
        params: &SessionsListParams,
    ) -> Result<SessionList, CallError> {
        self.client.request(METHOD_SESSIONS_LIST, params).await
    }

    /// Transcript of one session (`chat.history`).
    pub async fn chat_history(
        &self,
        session_key: impl Into<String>,
        limit: Option<u32>,
    ) -> Result<MessageList, CallError> {
        let params = ChatHistoryParams {
            session_key: session_key.into(),
            limit,
        };
        self.client.request(METHOD_CHAT_HISTORY, &params).await
    }

    /// Sends a chat message. A random idempotency key is attached when the
    /// caller did not supply one.
    pub async fn send_chat(&self, mut params: ChatSendParams) -> Result<ChatSendAck, CallError> {
        if params.idempotency_key.is_none() {
            params.idempotency_key = Some(Uuid::new_v4().to_string());
        }
        self.client.request(METHOD_CHAT_SEND, &params).await
    }

    /// Closes the underlying connection.
    pub async fn disconnect(&self) {
        self.client.disconnect().await;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::GatewaySession;
    use crate::gateway::client::{ConnectConfig, GatewayClient, GatewayClientOptions};
    use crate::gateway::error::CallError;
    use crate::gateway::testing::{next_server, MemoryConnector};
    use crate::models::{ChatSendParams, SessionsListParams};

    async fn session() -> (GatewaySession, crate::gateway::testing::ServerEnd) {
        let (connector, mut servers) = MemoryConnector::new();
        let client = GatewayClient::with_connector(connector, GatewayClientOptions::default());
        let connecting = tokio::spawn(GatewaySession::connect(client, ConnectConfig::default()));
        let mut server = next_server(&mut servers).await;
        server.accept_handshake().await;
        let (session, _) = connecting.await.expect("join").expect("connected");
        (session, server)
    }

    #[tokio::test]
    async fn list_sessions_decodes_typed_payload() {
        let (session, mut server) = session().await;
        let call = tokio::spawn({
            let session = session.clone();
            async move {
                session
                    .list_sessions(&SessionsListParams {
                        active_minutes: Some(120),
                        limit: None,
                    })
                    .await
            }
        });

        let request = server.expect_request("sessions.list").await;
        assert_eq!(request["params"], json!({"activeMinutes": 120}));
        server.reply(&request["id"], json!({"sessions": [{"key": "main", "model": "gpt"}]}));

        let list = call.await.expect("join").expect("decoded");
        assert_eq!(list.sessions.len(), 1);
        assert_eq!(list.sessions[0].model.as_deref(), Some("gpt"));
    }

    #[tokio::test]
    async fn send_chat_generates_idempotency_key() {
        let (session, mut server) = session().await;
        let call = tokio::spawn({
            let session = session.clone();
            async move { session.send_chat(ChatSendParams::new("main", "hello")).await }
        });

        let request = server.expect_request("chat.send").await;
        let key = request["params"]["idempotencyKey"]
            .as_str()
            .expect("idempotency key");
        assert_eq!(key.len(), 36);
        assert_eq!(request["params"]["sessionKey"], "main");
        server.reply(&request["id"], json!({"runId": "run-1", "status": "started"}));

        let ack = call.await.expect("join").expect("decoded");
        assert_eq!(ack.run_id.as_deref(), Some("run-1"));
    }

    #[tokio::test]
    async fn mismatched_payload_surfaces_decode_error() {
        let (session, mut server) = session().await;
        let call = tokio::spawn({
            let session = session.clone();
            async move { session.chat_history("main", Some(20)).await }
        });

        let request = server.expect_request("chat.history").await;
        assert_eq!(request["params"], json!({"sessionKey": "main", "limit": 20}));
        server.reply(&request["id"], json!({"messages": "not a list"}));

        let result = tokio::time::timeout(Duration::from_secs(2), call)
            .await
            .expect("finished")
            .expect("join");
        assert!(matches!(result, Err(CallError::Decode(_))));
    }
}
