//! Correlation table for in-flight requests.
//!
//! Every outstanding request id maps to exactly one pending call whose result
//! sink is a `oneshot` owned by the table until the call is retired. The table
//! only accepts registrations between [`PendingCalls::open`] and
//! [`PendingCalls::drain_all`], so a call can never be registered against a
//! connection that has already been drained.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::gateway::error::{CallError, CloseReason};
use crate::gateway::proto::ErrorShape;

pub(crate) type CallResult = Result<Value, CallError>;

#[derive(Clone, Debug, Default)]
pub(crate) struct PendingCalls {
    table: Arc<Mutex<Table>>,
}

#[derive(Debug, Default)]
struct Table {
    accepting: bool,
    epoch: u64,
    calls: HashMap<String, PendingCall>,
    // Ids whose caller gave up. Still reserved until a late response or drain.
    abandoned: HashSet<String>,
}

#[derive(Debug)]
struct PendingCall {
    method: String,
    epoch: u64,
    created_at: Instant,
    sink: oneshot::Sender<CallResult>,
}

impl PendingCalls {
    /// Starts accepting registrations for a new connection epoch.
    pub(crate) fn open(&self) -> u64 {
        let mut table = self.lock();
        table.accepting = true;
        table.epoch += 1;
        table.epoch
    }

    /// Creates the pending call for `id`.
    pub(crate) fn register(&self, id: &str, method: &str) -> Result<PendingReply, CallError> {
        let (sink, rx) = oneshot::channel();
        let epoch = {
            let mut table = self.lock();
            if !table.accepting {
                return Err(CallError::NotConnected);
            }
            if table.calls.contains_key(id) || table.abandoned.contains(id) {
                return Err(CallError::DuplicateId(id.to_string()));
            }
            let epoch = table.epoch;
            table.calls.insert(
                id.to_string(),
                PendingCall {
                    method: method.to_string(),
                    epoch,
                    created_at: Instant::now(),
                    sink,
                },
            );
            epoch
        };

        Ok(PendingReply {
            id: id.to_string(),
            epoch,
            rx,
            table: self.clone(),
            settled: false,
        })
    }

    /// Retires `id` with a payload. Returns `false` when nothing was waiting.
    pub(crate) fn resolve(&self, id: &str, payload: Value) -> bool {
        self.retire(id, Ok(payload))
    }

    /// Retires `id` with a server-reported error.
    pub(crate) fn reject(&self, id: &str, error: ErrorShape) -> bool {
        self.retire(id, Err(CallError::Server(error)))
    }

    /// Stops accepting registrations and fails every outstanding call with
    /// [`CallError::ConnectionClosed`].
    pub(crate) fn drain_all(&self, reason: CloseReason) -> usize {
        let drained: Vec<(String, PendingCall)> = {
            let mut table = self.lock();
            table.accepting = false;
            table.abandoned.clear();
            table.calls.drain().collect()
        };

        let count = drained.len();
        for (id, call) in drained {
            trace!(event = "gateway_call_drained", id = %id, method = %call.method);
            let _ = call
                .sink
                .send(Err(CallError::ConnectionClosed(reason.clone())));
        }
        if count > 0 {
            debug!(event = "gateway_calls_drained", count, reason = %reason);
        }
        count
    }

    /// Number of calls still waiting for a response.
    pub(crate) fn len(&self) -> usize {
        self.lock().calls.len()
    }

    fn retire(&self, id: &str, result: CallResult) -> bool {
        let call = {
            let mut table = self.lock();
            match table.calls.remove(id) {
                Some(call) => call,
                None => {
                    if table.abandoned.remove(id) {
                        debug!(event = "gateway_late_response", id, "discarding response for abandoned call");
                    } else {
                        debug!(event = "gateway_unmatched_response", id, "no pending call for response");
                    }
                    return false;
                }
            }
        };

        trace!(
            event = "gateway_call_retired",
            id,
            method = %call.method,
            ok = result.is_ok(),
            elapsed_ms = call.created_at.elapsed().as_millis() as u64
        );
        let _ = call.sink.send(result);
        true
    }

    fn abandon(&self, id: &str, epoch: u64) {
        let mut table = self.lock();
        let owned = table
            .calls
            .get(id)
            .is_some_and(|call| call.epoch == epoch);
        if owned {
            table.calls.remove(id);
            table.abandoned.insert(id.to_string());
        }
    }

    fn lock(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Caller side of a pending call.
///
/// Dropping it before the call is retired removes the pending entry while
/// keeping the id reserved, so a late response is discarded.
#[derive(Debug)]
pub(crate) struct PendingReply {
    id: String,
    epoch: u64,
    rx: oneshot::Receiver<CallResult>,
    table: PendingCalls,
    settled: bool,
}

impl PendingReply {
    pub(crate) fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Waits until the call is resolved, rejected, or drained.
    pub(crate) async fn wait(mut self) -> CallResult {
        let outcome = (&mut self.rx).await;
        self.settled = true;
        outcome.unwrap_or(Err(CallError::ConnectionClosed(CloseReason::ClientDropped)))
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        if !self.settled {
            self.table.abandon(&self.id, self.epoch);
        }
    }
}
