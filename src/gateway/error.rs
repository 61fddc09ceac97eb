//! Error taxonomy of the gateway client.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio_tungstenite::tungstenite::Error as WsError;

use crate::gateway::proto::ErrorShape;

/// Connection-level failure. Fatal to the session it occurs on.
#[derive(Clone, Debug, Error)]
pub enum TransportError {
    #[error("websocket error: {0}")]
    WebSocket(Arc<WsError>),

    #[error("invalid header `{name}`: {reason}")]
    InvalidHeader { name: String, reason: String },

    #[error("transport is closed")]
    Closed,

    #[error("{0}")]
    Other(String),
}

impl From<WsError> for TransportError {
    fn from(error: WsError) -> Self {
        Self::WebSocket(Arc::new(error))
    }
}

/// Why the outstanding calls of a connection were drained.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CloseReason {
    /// `disconnect()` was called.
    UserRequested,
    /// The peer closed the transport.
    TransportClosed,
    /// The transport failed.
    TransportError(String),
    /// Every client handle was dropped.
    ClientDropped,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UserRequested => f.write_str("disconnect requested"),
            Self::TransportClosed => f.write_str("transport closed"),
            Self::TransportError(detail) => write!(f, "transport error: {detail}"),
            Self::ClientDropped => f.write_str("client dropped"),
        }
    }
}

/// Failure of a connect attempt. Cloned to every caller joined on the attempt.
#[derive(Clone, Debug, Error)]
pub enum ConnectError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("handshake rejected: {0}")]
    HandshakeRejected(ErrorShape),

    #[error("handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    #[error("connection closed before handshake completed")]
    ClosedDuringHandshake,

    #[error("failed to encode handshake: {0}")]
    Encode(String),

    #[error("connect attempt aborted: {0}")]
    Aborted(CloseReason),
}

impl ConnectError {
    /// Whether a reconnect loop should try again after this failure.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::HandshakeTimeout(_) | Self::ClosedDuringHandshake
        )
    }
}

/// Failure of a single `call`. Surfaced to the issuing caller only.
#[derive(Debug, Error)]
pub enum CallError {
    #[error("not connected to gateway")]
    NotConnected,

    #[error("gateway error: {0}")]
    Server(ErrorShape),

    #[error("connection closed: {0}")]
    ConnectionClosed(CloseReason),

    /// Invariant violation: ids are generated per connection and never reused
    /// while outstanding.
    #[error("request id `{0}` is already outstanding")]
    DuplicateId(String),

    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    #[error("failed to encode request: {0}")]
    Encode(String),

    #[error("failed to decode response payload: {0}")]
    Decode(#[source] serde_json::Error),
}
