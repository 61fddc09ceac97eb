//! Wire types shared with the gateway.
//!
//! Params and payloads stay schema-less (`serde_json::Value`) at this layer;
//! typed decoding happens in [`crate::gateway::session`].

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Protocol version spoken by this SDK.
pub const PROTOCOL_VERSION: u32 = 3;

/// Method name of the mandatory first request on every connection.
pub const HANDSHAKE_METHOD: &str = "connect";

/// One complete protocol message.
#[derive(Clone, Debug, PartialEq)]
pub enum Envelope {
    Request(RequestFrame),
    Response(ResponseFrame),
    Event(GatewayEvent),
    /// Frame with a `type` this SDK does not know. Kept for forward
    /// compatibility and never treated as an error.
    Unknown { kind: String, body: Map<String, Value> },
}

/// Caller-issued request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RequestFrame {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

/// Reply to a [`RequestFrame`] with the same `id`.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ResponseFrame {
    pub id: String,
    #[serde(flatten)]
    pub outcome: ResponseOutcome,
}

impl ResponseFrame {
    pub fn ok(id: impl Into<String>, payload: Value) -> Self {
        Self {
            id: id.into(),
            outcome: ResponseOutcome::Payload(payload),
        }
    }

    pub fn error(id: impl Into<String>, error: ErrorShape) -> Self {
        Self {
            id: id.into(),
            outcome: ResponseOutcome::Error(error),
        }
    }
}

/// Exactly one of `payload` or `error` is present on a response.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseOutcome {
    Payload(Value),
    Error(ErrorShape),
}

/// Server-pushed event. Events carry no id.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GatewayEvent {
    #[serde(rename = "event")]
    pub name: String,
    #[serde(default = "empty_object")]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
}

impl GatewayEvent {
    pub fn new(name: impl Into<String>, payload: Value) -> Self {
        Self {
            name: name.into(),
            payload,
            seq: None,
        }
    }
}

/// Error reported by the gateway for a single request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorShape {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default = "unknown_error_message")]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retryable: Option<bool>,
}

impl ErrorShape {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
            details: None,
            retryable: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

impl fmt::Display for ErrorShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.code {
            Some(code) => write!(f, "{code}: {}", self.message),
            None => f.write_str(&self.message),
        }
    }
}

/// Identity this client presents during the handshake.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfo {
    pub id: String,
    pub version: String,
    pub platform: String,
    pub mode: String,
}

impl Default for ClientInfo {
    fn default() -> Self {
        Self {
            id: "openclaw-control".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            platform: std::env::consts::OS.to_string(),
            mode: "webchat".to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthParams {
    pub token: String,
}

/// Params of the `connect` handshake request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectParams {
    pub min_protocol: u32,
    pub max_protocol: u32,
    pub client: ClientInfo,
    pub role: String,
    pub scopes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthParams>,
}

/// Successful handshake acknowledgement.
#[derive(Clone, Debug, PartialEq)]
pub struct ServerHello {
    pub payload: Value,
}

impl ServerHello {
    /// Protocol version the server settled on, when it reports one.
    pub fn protocol(&self) -> Option<u32> {
        self.payload
            .get("protocol")
            .and_then(Value::as_u64)
            .and_then(|version| u32::try_from(version).ok())
    }
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

fn unknown_error_message() -> String {
    "unknown error".to_string()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn connect_params_use_camel_case_and_omit_missing_auth() {
        let params = ConnectParams {
            min_protocol: 3,
            max_protocol: 3,
            client: ClientInfo {
                id: "openclaw-control".to_string(),
                version: "1.0.0".to_string(),
                platform: "linux".to_string(),
                mode: "webchat".to_string(),
            },
            role: "operator".to_string(),
            scopes: vec!["operator.admin".to_string()],
            auth: None,
        };

        let value = serde_json::to_value(&params).expect("serialize");
        assert_eq!(value["minProtocol"], 3);
        assert_eq!(value["maxProtocol"], 3);
        assert_eq!(value["client"]["mode"], "webchat");
        assert_eq!(value["scopes"], json!(["operator.admin"]));
        assert!(value.get("auth").is_none());
    }

    #[test]
    fn error_shape_display_includes_code() {
        let error = ErrorShape::new("session not found").with_code("NOT_FOUND");
        assert_eq!(error.to_string(), "NOT_FOUND: session not found");
        assert_eq!(ErrorShape::new("boom").to_string(), "boom");
    }

    #[test]
    fn server_hello_reads_negotiated_protocol() {
        let hello = ServerHello {
            payload: json!({"type": "hello-ok", "protocol": 3}),
        };
        assert_eq!(hello.protocol(), Some(3));
        assert_eq!(ServerHello { payload: json!({"ok": true}) }.protocol(), None);
    }
}
