//! Fan-out of server-pushed events to subscribers.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tracing::{trace, warn};

use crate::gateway::proto::GatewayEvent;

/// Callback invoked on the receive path for each matching event.
///
/// Handlers must not block: hand work off to a task or channel instead.
pub type EventHandler = Arc<dyn Fn(&GatewayEvent) + Send + Sync>;

/// Filter deciding whether a subscription sees an event.
pub type EventPredicate = Arc<dyn Fn(&GatewayEvent) -> bool + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

/// How long a subscription lives.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SubscriptionScope {
    /// Removed when the current connection is torn down.
    #[default]
    Connection,
    /// Kept across disconnects and reconnects until unsubscribed.
    Client,
}

pub(crate) struct Subscription {
    id: SubscriptionId,
    scope: SubscriptionScope,
    predicate: Option<EventPredicate>,
    handler: EventHandler,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    // Registration order is delivery order.
    subscriptions: Vec<Subscription>,
}

#[derive(Clone, Default)]
pub(crate) struct EventDispatcher {
    registry: Arc<Mutex<Registry>>,
}

impl EventDispatcher {
    pub(crate) fn subscribe(
        &self,
        scope: SubscriptionScope,
        predicate: Option<EventPredicate>,
        handler: EventHandler,
    ) -> SubscriptionId {
        let mut registry = self.lock();
        registry.next_id += 1;
        let id = SubscriptionId(registry.next_id);
        registry.subscriptions.push(Subscription {
            id,
            scope,
            predicate,
            handler,
        });
        id
    }

    /// Bridges matching events into an unbounded channel.
    pub(crate) fn subscribe_channel(
        &self,
        scope: SubscriptionScope,
        predicate: Option<EventPredicate>,
    ) -> (SubscriptionId, mpsc::UnboundedReceiver<GatewayEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler: EventHandler = Arc::new(move |event: &GatewayEvent| {
            let _ = tx.send(event.clone());
        });
        (self.subscribe(scope, predicate, handler), rx)
    }

    pub(crate) fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let removed = {
            let mut registry = self.lock();
            let position = registry
                .subscriptions
                .iter()
                .position(|subscription| subscription.id == id);
            position.map(|index| registry.subscriptions.remove(index))
        };
        removed.is_some()
    }

    /// Delivers `event` to every current subscriber in registration order.
    ///
    /// Handlers run outside the registry lock, so they may subscribe or
    /// unsubscribe. A panicking handler is logged and skipped.
    pub(crate) fn dispatch(&self, event: &GatewayEvent) -> usize {
        let targets: Vec<(SubscriptionId, Option<EventPredicate>, EventHandler)> = self
            .lock()
            .subscriptions
            .iter()
            .map(|subscription| {
                (
                    subscription.id,
                    subscription.predicate.clone(),
                    Arc::clone(&subscription.handler),
                )
            })
            .collect();

        let mut delivered = 0;
        for (id, predicate, handler) in targets {
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                let wanted = predicate.as_ref().map_or(true, |accepts| accepts(event));
                if wanted {
                    handler(event);
                }
                wanted
            }));
            match outcome {
                Ok(true) => delivered += 1,
                Ok(false) => {}
                Err(_) => warn!(
                    event = "event_handler_panicked",
                    subscription = id.0,
                    name = %event.name
                ),
            }
        }

        trace!(event = "gateway_event_dispatched", name = %event.name, delivered);
        delivered
    }

    /// Detaches connection-scoped subscriptions on teardown.
    ///
    /// The removed subscriptions are handed back instead of dropped here: a
    /// handler may own the last client handle, whose drop must not run under
    /// the caller's locks.
    pub(crate) fn clear_connection_scoped(&self) -> Vec<Subscription> {
        let mut registry = self.lock();
        let (kept, removed) = std::mem::take(&mut registry.subscriptions)
            .into_iter()
            .partition(|subscription| subscription.scope == SubscriptionScope::Client);
        registry.subscriptions = kept;
        removed
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().subscriptions.len()
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
