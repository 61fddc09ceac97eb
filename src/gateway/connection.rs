//! Connection lifecycle manager.
//!
//! Each `connect` spawns one worker task that owns the transport for the
//! lifetime of that connection. The worker drives the handshake, runs the
//! single receive path, routes responses into the correlation table and
//! events into the dispatcher, and drains both on teardown. Callers talk to
//! the worker only through its command queue, so nothing but the worker ever
//! writes to the transport.
//!
//! Calls issued before the handshake completes are rejected with
//! `NotConnected` rather than queued: the correlation table only accepts
//! registrations once the worker has observed the handshake ack.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn};

use crate::gateway::error::{CloseReason, ConnectError, TransportError};
use crate::gateway::events::EventDispatcher;
use crate::gateway::pending::PendingCalls;
use crate::gateway::proto::{
    ConnectParams, Envelope, RequestFrame, ResponseFrame, ResponseOutcome, ServerHello,
    HANDSHAKE_METHOD,
};
use crate::gateway::transport::{ConnectTarget, Connector, Transport};
use crate::retry::{with_timeout, RetryPolicy};

/// Lifecycle state of the single gateway connection owned by a client.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    AwaitingHandshakeAck,
    Ready,
    Closing,
    Failed,
}

impl ConnectionState {
    pub fn is_ready(self) -> bool {
        self == Self::Ready
    }
}

pub(crate) enum Command {
    Send {
        epoch: u64,
        id: String,
        frame: String,
    },
    Close(CloseReason),
}

pub(crate) type Outcome = Option<Result<ServerHello, ConnectError>>;

/// Handle on the worker that currently owns the connection.
#[derive(Clone)]
pub(crate) struct Link {
    generation: u64,
    pub(crate) commands: mpsc::UnboundedSender<Command>,
    pub(crate) outcome: watch::Receiver<Outcome>,
}

/// What a worker needs to open and authenticate one connection.
#[derive(Clone, Debug)]
pub(crate) struct ConnectionSetup {
    pub(crate) target: ConnectTarget,
    pub(crate) params: ConnectParams,
}

#[derive(Clone, Debug, Default)]
pub(crate) struct LinkOptions {
    pub(crate) handshake_timeout: Option<Duration>,
    pub(crate) reconnect: Option<RetryPolicy>,
    pub(crate) decode_error_limit: Option<u32>,
}

/// State shared between the façade and the connection worker.
pub(crate) struct Shared {
    state: watch::Sender<ConnectionState>,
    pub(crate) pending: PendingCalls,
    pub(crate) events: EventDispatcher,
    link: Mutex<Option<Link>>,
    generations: AtomicU64,
    request_ids: AtomicU64,
    handshake_ids: AtomicU64,
}

impl Shared {
    pub(crate) fn new() -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            state,
            pending: PendingCalls::default(),
            events: EventDispatcher::default(),
            link: Mutex::new(None),
            generations: AtomicU64::new(0),
            request_ids: AtomicU64::new(0),
            handshake_ids: AtomicU64::new(0),
        }
    }

    pub(crate) fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub(crate) fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub(crate) fn current_link(&self) -> Option<Link> {
        self.lock_link().clone()
    }

    pub(crate) fn next_request_id(&self) -> String {
        format!("r{}", self.request_ids.fetch_add(1, Ordering::Relaxed) + 1)
    }

    fn next_handshake_id(&self) -> String {
        format!("h{}", self.handshake_ids.fetch_add(1, Ordering::Relaxed) + 1)
    }

    fn set_state(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            info!(event = "gateway_state_changed", from = ?previous, to = ?next);
        }
    }

    fn lock_link(&self) -> MutexGuard<'_, Option<Link>> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Returns the outcome of the live connect attempt, spawning a worker when no
/// connection exists. Concurrent callers share one attempt.
pub(crate) fn start_or_join(
    shared: &Arc<Shared>,
    connector: &Arc<dyn Connector>,
    setup: ConnectionSetup,
    options: LinkOptions,
) -> watch::Receiver<Outcome> {
    let mut slot = shared.lock_link();
    if let Some(link) = slot.as_ref() {
        return link.outcome.clone();
    }

    let generation = shared.generations.fetch_add(1, Ordering::Relaxed) + 1;
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let (outcome_tx, outcome_rx) = watch::channel(None);
    shared.set_state(ConnectionState::Connecting);
    *slot = Some(Link {
        generation,
        commands: commands_tx,
        outcome: outcome_rx.clone(),
    });

    let worker = Worker {
        shared: Arc::clone(shared),
        connector: Arc::clone(connector),
        setup,
        options,
        generation,
        commands: commands_rx,
        outcome: outcome_tx,
    };
    tokio::spawn(worker.run());
    outcome_rx
}

enum SessionEnd {
    Closed(CloseReason),
    PeerClosed,
    Failed(TransportError),
}

enum HandshakeWait {
    Acked(Result<Value, ConnectError>),
    TimedOut,
    Aborted(CloseReason),
}

type Established = (Box<dyn Transport>, ServerHello);

struct Worker {
    shared: Arc<Shared>,
    connector: Arc<dyn Connector>,
    setup: ConnectionSetup,
    options: LinkOptions,
    generation: u64,
    commands: mpsc::UnboundedReceiver<Command>,
    outcome: watch::Sender<Outcome>,
}

impl Worker {
    async fn run(mut self) {
        let (mut transport, mut hello) = match self.establish().await {
            Ok(established) => established,
            Err(err) => return self.fail_attempt(err),
        };

        loop {
            let epoch = self.shared.pending.open();
            self.shared.set_state(ConnectionState::Ready);
            self.outcome.send_replace(Some(Ok(hello)));

            let end = self.serve(transport.as_mut(), epoch).await;
            let reconnect = match end {
                SessionEnd::Closed(reason) => {
                    self.shared.set_state(ConnectionState::Closing);
                    if let Err(err) = transport.close().await {
                        debug!(event = "gateway_close_failed", error = %err);
                    }
                    self.teardown(reason, ConnectionState::Disconnected, false);
                    return;
                }
                SessionEnd::PeerClosed => {
                    let policy = self.options.reconnect.clone();
                    self.teardown(
                        CloseReason::TransportClosed,
                        ConnectionState::Disconnected,
                        policy.is_some(),
                    );
                    policy
                }
                SessionEnd::Failed(err) => {
                    warn!(event = "gateway_transport_failed", error = %err);
                    let policy = self.options.reconnect.clone();
                    self.teardown(
                        CloseReason::TransportError(err.to_string()),
                        ConnectionState::Failed,
                        policy.is_some(),
                    );
                    policy
                }
            };
            drop(transport);

            let Some(policy) = reconnect else {
                return;
            };
            match self.reconnect(&policy).await {
                Ok((next_transport, next_hello)) => {
                    transport = next_transport;
                    hello = next_hello;
                }
                Err(err) => return self.fail_attempt(err),
            }
        }
    }

    async fn establish(&mut self) -> Result<Established, ConnectError> {
        self.shared.set_state(ConnectionState::Connecting);

        let opened = tokio::select! {
            opened = self.connector.open(&self.setup.target) => opened,
            reason = wait_for_close(&mut self.commands) => {
                return Err(ConnectError::Aborted(reason));
            }
        };
        let mut transport = opened?;

        self.shared.set_state(ConnectionState::AwaitingHandshakeAck);
        let id = self.shared.next_handshake_id();
        let params = serde_json::to_value(&self.setup.params)
            .map_err(|err| ConnectError::Encode(err.to_string()))?;
        let frame = Envelope::Request(RequestFrame {
            id: id.clone(),
            method: HANDSHAKE_METHOD.to_string(),
            params,
        })
        .to_text()
        .map_err(|err| ConnectError::Encode(err.to_string()))?;
        transport.send(frame).await?;
        debug!(event = "gateway_handshake_sent", id = %id);

        let limit = self.options.handshake_timeout;
        let waited = tokio::select! {
            acked = with_timeout(limit, await_handshake_ack(transport.as_mut(), &id)) => {
                match acked {
                    Ok(acked) => HandshakeWait::Acked(acked),
                    Err(_) => HandshakeWait::TimedOut,
                }
            }
            reason = wait_for_close(&mut self.commands) => HandshakeWait::Aborted(reason),
        };

        let failure = match waited {
            HandshakeWait::Acked(Ok(payload)) => return Ok((transport, ServerHello { payload })),
            HandshakeWait::Acked(Err(err)) => err,
            HandshakeWait::TimedOut => ConnectError::HandshakeTimeout(limit.unwrap_or_default()),
            HandshakeWait::Aborted(reason) => ConnectError::Aborted(reason),
        };
        if let Err(err) = transport.close().await {
            debug!(event = "gateway_close_failed", error = %err);
        }
        Err(failure)
    }

    async fn serve(&mut self, transport: &mut dyn Transport, epoch: u64) -> SessionEnd {
        let mut decode_failures = 0u32;

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Send { epoch: queued, id, frame }) => {
                        if queued != epoch {
                            debug!(
                                event = "gateway_frame_dropped",
                                id = %id,
                                reason = "stale connection"
                            );
                        } else if let Err(err) = transport.send(frame).await {
                            return SessionEnd::Failed(err);
                        } else {
                            trace!(event = "gateway_frame_sent", id = %id);
                        }
                    }
                    Some(Command::Close(reason)) => return SessionEnd::Closed(reason),
                    None => return SessionEnd::Closed(CloseReason::ClientDropped),
                },
                inbound = transport.recv() => match inbound {
                    Some(Ok(text)) => {
                        if let Err(err) = self.route(&text, &mut decode_failures) {
                            return SessionEnd::Failed(err);
                        }
                    }
                    Some(Err(err)) => return SessionEnd::Failed(err),
                    None => return SessionEnd::PeerClosed,
                },
            }
        }
    }

    fn route(&self, text: &str, decode_failures: &mut u32) -> Result<(), TransportError> {
        let envelope = match Envelope::from_text(text) {
            Ok(envelope) => envelope,
            Err(err) => {
                *decode_failures += 1;
                warn!(
                    event = "gateway_frame_dropped",
                    error = %err,
                    consecutive = *decode_failures
                );
                return match self.options.decode_error_limit {
                    Some(limit) if *decode_failures >= limit => Err(TransportError::Other(
                        format!("{decode_failures} consecutive undecodable frames"),
                    )),
                    _ => Ok(()),
                };
            }
        };
        *decode_failures = 0;

        match envelope {
            Envelope::Response(ResponseFrame { id, outcome }) => match outcome {
                ResponseOutcome::Payload(payload) => {
                    self.shared.pending.resolve(&id, payload);
                }
                ResponseOutcome::Error(error) => {
                    self.shared.pending.reject(&id, error);
                }
            },
            Envelope::Event(event) => {
                self.shared.events.dispatch(&event);
            }
            Envelope::Request(request) => {
                debug!(event = "gateway_server_request_ignored", method = %request.method);
            }
            Envelope::Unknown { kind, .. } => {
                debug!(event = "gateway_unknown_frame", kind = %kind);
            }
        }
        Ok(())
    }

    async fn reconnect(&mut self, policy: &RetryPolicy) -> Result<Established, ConnectError> {
        let max_attempts = policy.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            let delay = policy.delay_for_attempt(attempt);
            info!(
                event = "gateway_reconnect_scheduled",
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                reason = wait_for_close(&mut self.commands) => {
                    return Err(ConnectError::Aborted(reason));
                }
            }

            match self.establish().await {
                Ok(established) => return Ok(established),
                Err(err) if err.is_retryable() && attempt < max_attempts => {
                    warn!(event = "gateway_reconnect_failed", attempt, error = %err);
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Drains the finished connection. Unless a reconnect follows, the link
    /// is released so the next `connect` starts a fresh worker.
    fn teardown(&self, reason: CloseReason, state: ConnectionState, will_reconnect: bool) {
        let mut slot = self.shared.lock_link();
        let drained = self.shared.pending.drain_all(reason.clone());
        let cleared = self.shared.events.clear_connection_scoped();
        if will_reconnect {
            self.outcome.send_replace(None);
        } else {
            self.release(&mut slot);
        }
        self.shared.set_state(state);
        drop(slot);
        let cleared_subscriptions = cleared.len();
        drop(cleared);

        info!(
            event = "gateway_connection_closed",
            reason = %reason,
            drained,
            cleared_subscriptions,
            will_reconnect
        );
    }

    fn fail_attempt(&self, err: ConnectError) {
        let state = match err {
            ConnectError::Aborted(_) => ConnectionState::Disconnected,
            _ => ConnectionState::Failed,
        };
        warn!(event = "gateway_connect_failed", error = %err);

        let mut slot = self.shared.lock_link();
        self.release(&mut slot);
        self.shared.set_state(state);
        drop(slot);

        self.outcome.send_replace(Some(Err(err)));
    }

    fn release(&self, slot: &mut Option<Link>) {
        if slot
            .as_ref()
            .is_some_and(|link| link.generation == self.generation)
        {
            *slot = None;
        }
    }
}

async fn await_handshake_ack(
    transport: &mut dyn Transport,
    id: &str,
) -> Result<Value, ConnectError> {
    loop {
        let text = match transport.recv().await {
            Some(Ok(text)) => text,
            Some(Err(err)) => return Err(ConnectError::Transport(err)),
            None => return Err(ConnectError::ClosedDuringHandshake),
        };

        match Envelope::from_text(&text) {
            Ok(Envelope::Response(response)) if response.id == id => {
                return match response.outcome {
                    ResponseOutcome::Payload(payload) => Ok(payload),
                    ResponseOutcome::Error(error) => Err(ConnectError::HandshakeRejected(error)),
                };
            }
            Ok(Envelope::Response(response)) => {
                debug!(
                    event = "gateway_unmatched_response",
                    id = %response.id,
                    "response before handshake ack"
                );
            }
            Ok(Envelope::Event(event)) => {
                debug!(
                    event = "gateway_event_dropped",
                    name = %event.name,
                    "event before handshake ack"
                );
            }
            Ok(_) => {}
            Err(err) => {
                warn!(
                    event = "gateway_frame_dropped",
                    error = %err,
                    "undecodable frame during handshake"
                );
            }
        }
    }
}

/// Resolves once a close is requested, discarding anything queued meanwhile.
async fn wait_for_close(commands: &mut mpsc::UnboundedReceiver<Command>) -> CloseReason {
    loop {
        match commands.recv().await {
            Some(Command::Close(reason)) => return reason,
            Some(Command::Send { id, .. }) => {
                debug!(event = "gateway_frame_dropped", id = %id, reason = "connection not ready");
            }
            None => return CloseReason::ClientDropped,
        }
    }
}
