//! In-memory connector for driving the lifecycle manager from tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::gateway::error::TransportError;
use crate::gateway::transport::{ConnectTarget, Connector, Transport};

const WAIT: Duration = Duration::from_secs(2);

/// Hands the server end of every opened connection to the test.
pub(crate) struct MemoryConnector {
    servers: mpsc::UnboundedSender<ServerEnd>,
    opened: AtomicUsize,
    refuse: Mutex<usize>,
    targets: Mutex<Vec<String>>,
}

impl MemoryConnector {
    pub(crate) fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ServerEnd>) {
        let (servers, rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            servers,
            opened: AtomicUsize::new(0),
            refuse: Mutex::new(0),
            targets: Mutex::new(Vec::new()),
        });
        (connector, rx)
    }

    pub(crate) fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    /// Fails the next `count` open attempts.
    pub(crate) fn refuse_next(&self, count: usize) {
        *self.refuse.lock().expect("refuse") = count;
    }

    pub(crate) fn targets(&self) -> Vec<String> {
        self.targets.lock().expect("targets").clone()
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn open(&self, target: &ConnectTarget) -> Result<Box<dyn Transport>, TransportError> {
        {
            let mut refuse = self.refuse.lock().expect("refuse");
            if *refuse > 0 {
                *refuse -= 1;
                return Err(TransportError::Other("connection refused".to_string()));
            }
        }

        self.opened.fetch_add(1, Ordering::SeqCst);
        self.targets.lock().expect("targets").push(target.url.clone());

        let (to_server, from_client) = mpsc::unbounded_channel();
        let (to_client, from_server) = mpsc::unbounded_channel();
        let _ = self.servers.send(ServerEnd {
            from_client,
            to_client: Some(to_client),
        });
        Ok(Box::new(MemoryTransport {
            to_server: Some(to_server),
            from_server,
        }))
    }
}

struct MemoryTransport {
    to_server: Option<mpsc::UnboundedSender<String>>,
    from_server: mpsc::UnboundedReceiver<Result<String, TransportError>>,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&mut self, frame: String) -> Result<(), TransportError> {
        let sender = self.to_server.as_ref().ok_or(TransportError::Closed)?;
        sender.send(frame).map_err(|_| TransportError::Closed)
    }

    async fn recv(&mut self) -> Option<Result<String, TransportError>> {
        self.from_server.recv().await
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.to_server = None;
        Ok(())
    }
}

/// Scripted server side of one memory connection.
pub(crate) struct ServerEnd {
    from_client: mpsc::UnboundedReceiver<String>,
    to_client: Option<mpsc::UnboundedSender<Result<String, TransportError>>>,
}

impl ServerEnd {
    /// Next frame written by the client, parsed as JSON. `None` once the
    /// client closed its side.
    pub(crate) async fn next_frame(&mut self) -> Option<Value> {
        let text = tokio::time::timeout(WAIT, self.from_client.recv())
            .await
            .expect("timed out waiting for client frame")?;
        Some(serde_json::from_str(&text).expect("client frames are json"))
    }

    pub(crate) async fn expect_request(&mut self, method: &str) -> Value {
        let frame = self.next_frame().await.expect("client closed");
        assert_eq!(frame["type"], "req", "unexpected frame {frame}");
        assert_eq!(frame["method"], method, "unexpected frame {frame}");
        frame
    }

    /// Reads the handshake request and acknowledges it.
    pub(crate) async fn accept_handshake(&mut self) -> Value {
        let frame = self.expect_request("connect").await;
        self.reply(&frame["id"], json!({"ok": true}));
        frame
    }

    pub(crate) fn send_text(&self, text: impl Into<String>) {
        if let Some(tx) = self.to_client.as_ref() {
            let _ = tx.send(Ok(text.into()));
        }
    }

    pub(crate) fn send_json(&self, value: Value) {
        self.send_text(value.to_string());
    }

    pub(crate) fn reply(&self, id: &Value, payload: Value) {
        self.send_json(json!({"type": "res", "id": id, "payload": payload}));
    }

    pub(crate) fn reply_error(&self, id: &Value, message: &str) {
        self.send_json(json!({"type": "res", "id": id, "error": {"message": message}}));
    }

    pub(crate) fn event(&self, name: &str, payload: Value) {
        self.send_json(json!({"type": "event", "event": name, "payload": payload}));
    }

    pub(crate) fn fail(&self, message: &str) {
        if let Some(tx) = self.to_client.as_ref() {
            let _ = tx.send(Err(TransportError::Other(message.to_string())));
        }
    }

    /// Closes the server side; the client observes a clean close.
    pub(crate) fn close(&mut self) {
        self.to_client = None;
    }
}

pub(crate) async fn next_server(servers: &mut mpsc::UnboundedReceiver<ServerEnd>) -> ServerEnd {
    tokio::time::timeout(WAIT, servers.recv())
        .await
        .expect("timed out waiting for connection")
        .expect("connector dropped")
}
