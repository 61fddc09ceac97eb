//! Gateway WebSocket client modules.
//!
//! - `proto` / `codec`: envelope types and their JSON text encoding.
//! - `transport`: connector seam and the tokio-tungstenite implementation.
//! - `connection`: lifecycle worker driving handshake, receive loop and drain.
//! - `client`: public façade shared by every caller.
//! - `session`: typed operator methods on top of the façade.

/// Public façade, options and connect config.
pub mod client;
/// Envelope text encoding and decoding.
pub mod codec;
/// Connection lifecycle state and worker.
pub mod connection;
/// Error types for transport, connect and call failures.
pub mod error;
/// Event subscription and fan-out.
pub mod events;
mod pending;
/// Protocol envelope and handshake types.
pub mod proto;
/// Typed operator methods.
pub mod session;
/// Connector and transport traits.
pub mod transport;

#[cfg(test)]
mod testing;

pub use client::{ConnectConfig, GatewayClient, GatewayClientOptions, GatewayDefaults};
pub use connection::ConnectionState;
pub use error::{CallError, CloseReason, ConnectError, TransportError};
pub use events::{EventHandler, EventPredicate, SubscriptionId, SubscriptionScope};
pub use proto::{ClientInfo, GatewayEvent, ServerHello};
pub use session::GatewaySession;
