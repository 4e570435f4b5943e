//! Gateway control-plane protocol
//!
//! Wire envelope, transport adapters (WebSocket and simulated peer) and the
//! resilient [`GatewayClient`] session built on top of them.

pub mod backoff;
mod client;
pub mod envelope;
pub mod simulated;
pub mod transport;
pub mod websocket;

pub use backoff::ReconnectPolicy;
pub use client::{
    validate_endpoint, ClientEvent, ClientOptions, ConnectionStatus, GatewayClient,
    RuntimeConfigUpdate, DEFAULT_CLIENT_MODES,
};
pub use envelope::{Dialect, Envelope, InboundMessage};
pub use simulated::{SimulatedPeerOptions, SimulatedTransportFactory};
pub use transport::{Transport, TransportEvent, TransportFactory, TransportFault, TransportKind};
pub use websocket::WebSocketTransportFactory;
