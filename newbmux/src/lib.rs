//! newbmux -- connection demultiplexing and stream buffering for
//! datagram-based secure transports.
//!
//! One UDP socket serves many connections:
//! - **Acceptor**: routes each packet of a datagram to its connection,
//!   accepts new ones and answers strays with version negotiation or a
//!   stateless reset
//! - **Transport policy**: per-connection read thresholds and deferred
//!   writes, kept in step with the reactor's write interest
//! - **Stream bridge**: carries stream bytes between the protocol engine and
//!   the transport policy
//!
//! The protocol engine itself is external and plugs in through
//! [`ProtocolEngine`].

pub mod acceptor;
pub mod bridge;
pub mod config;
pub mod dialer;
pub mod driver;
pub mod engine;
pub mod error;
mod mux;
pub mod newb;
pub mod policy;
pub mod reactor;
pub mod registry;
pub mod socket;

#[cfg(test)]
mod testing;

// Re-export key public types at crate root.
pub use acceptor::Acceptor;
pub use bridge::{SliceIngress, StreamBridge};
pub use config::{AcceptorConfig, DialerConfig, KeyMaterial, KeyMaterialConfig};
pub use dialer::Dialer;
pub use driver::{Driver, Endpoint};
pub use engine::{
    CidPlaintext, ConnectionId, DecodedPacket, HeaderForm, IngressView, ProtocolEngine,
    StreamEvents, StreamId, Transmit,
};
pub use error::{DecodeError, EngineError, NewbError, Operation, Result};
pub use mux::INTERNAL_ERROR;
pub use newb::{
    BasicNewb, IoContext, Newb, NewbHandle, NewbPool, NewbRef, Outbox, Protocol, Spawner,
};
pub use policy::{ReceivePolicy, RwState, TransportPolicy};
pub use reactor::{InterestSet, Reactor, Token};
pub use registry::{ConnectionKey, ConnectionTable};
pub use socket::{
    create_socket, DatagramSocket, Egress, MemoryNetwork, MemorySocket, MAX_EGRESS_BACKLOG,
};
