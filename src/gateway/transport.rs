//! Transport seam between the lifecycle manager and the wire.
//!
//! A [`Connector`] opens one bidirectional text-frame [`Transport`] per
//! connection. The production implementation is [`WebSocketConnector`].

use std::collections::BTreeMap;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace};

use crate::gateway::error::TransportError;

/// Where and how to open a transport.
#[derive(Clone, Debug)]
pub struct ConnectTarget {
    pub url: String,
    pub auth_token: Option<SecretString>,
    /// Extra headers (routing hints) sent with the opening request.
    pub headers: BTreeMap<String, String>,
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, target: &ConnectTarget) -> Result<Box<dyn Transport>, TransportError>;
}

/// One open connection carrying UTF-8 text frames.
#[async_trait]
pub trait Transport: Send {
    async fn send(&mut self, frame: String) -> Result<(), TransportError>;

    /// Next inbound text frame. `None` once the peer has closed.
    async fn recv(&mut self) -> Option<Result<String, TransportError>>;

    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Opens WebSocket connections with tokio-tungstenite.
#[derive(Clone, Copy, Debug, Default)]
pub struct WebSocketConnector;

#[async_trait]
impl Connector for WebSocketConnector {
    async fn open(&self, target: &ConnectTarget) -> Result<Box<dyn Transport>, TransportError> {
        let mut request = target.url.as_str().into_client_request()?;

        if let Some(token) = target.auth_token.as_ref() {
            let value = HeaderValue::from_str(&format!("Bearer {}", token.expose_secret()))
                .map_err(|err| TransportError::InvalidHeader {
                    name: "authorization".to_string(),
                    reason: err.to_string(),
                })?;
            request.headers_mut().insert("authorization", value);
        }

        for (name, value) in &target.headers {
            let invalid = |reason: String| TransportError::InvalidHeader {
                name: name.clone(),
                reason,
            };
            let header_name =
                HeaderName::from_bytes(name.as_bytes()).map_err(|err| invalid(err.to_string()))?;
            let header_value =
                HeaderValue::from_str(value).map_err(|err| invalid(err.to_string()))?;
            request.headers_mut().insert(header_name, header_value);
        }

        let (socket, response) = connect_async(request).await?;
        debug!(
            event = "gateway_transport_opened",
            url = %target.url,
            status = response.status().as_u16()
        );
        Ok(Box::new(WebSocketTransport { socket }))
    }
}

struct WebSocketTransport {
    socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn send(&mut self, frame: String) -> Result<(), TransportError> {
        self.socket.send(Message::Text(frame)).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<String, TransportError>> {
        loop {
            match self.socket.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text)),
                Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                    Ok(text) => return Some(Ok(text)),
                    Err(_) => {
                        debug!(event = "gateway_frame_dropped", reason = "binary frame is not utf-8");
                    }
                },
                // tungstenite queues the pong reply itself.
                Ok(Message::Ping(_) | Message::Pong(_)) => {
                    trace!(event = "gateway_keepalive_frame");
                }
                Ok(Message::Close(frame)) => {
                    trace!(event = "gateway_close_frame", frame = ?frame);
                    return None;
                }
                Ok(Message::Frame(_)) => {}
                Err(err) => return Some(Err(err.into())),
            }
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.socket.close(None).await?;
        Ok(())
    }
}
