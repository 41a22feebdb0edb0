//! Protocol engine adapter contract.
//!
//! The secure-transport engine is a black box to this crate. Everything the
//! acceptor and the dialer need from it goes through [`ProtocolEngine`]:
//! locating packets inside a datagram, feeding packets into connections,
//! accepting or opening connections, and encoding the stateless responses
//! (version negotiation, stateless reset).
//!
//! Engines report stream activity back through [`StreamEvents`], which the
//! caller supplies per dispatch. The callee never holds on to it, so no
//! opaque back-pointer has to survive between calls.

use std::fmt;
use std::net::SocketAddr;
use std::time::Instant;

use bytes::Bytes;

use crate::config::KeyMaterial;
use crate::error::{DecodeError, EngineError};

/// Identifier of one logical byte stream within a connection.
pub type StreamId = u64;

/// Opaque connection identifier carried in packet headers.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ConnectionId(Bytes);

impl ConnectionId {
    pub fn new(bytes: Bytes) -> Self {
        Self(bytes)
    }

    pub fn from_slice(data: &[u8]) -> Self {
        Self(Bytes::copy_from_slice(data))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConnectionId(")?;
        for b in self.0.iter() {
            write!(f, "{b:02x}")?;
        }
        write!(f, ")")
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0.iter() {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

/// The plaintext fields an engine embeds in the connection IDs it mints.
///
/// `thread_id` and `node_id` double as the authentication fields checked
/// before answering an unknown short-header packet: both zero marks an
/// anonymous ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CidPlaintext {
    pub master_id: u32,
    pub thread_id: u16,
    pub node_id: u16,
}

impl CidPlaintext {
    pub fn new(master_id: u32, thread_id: u16, node_id: u16) -> Self {
        Self {
            master_id,
            thread_id,
            node_id,
        }
    }

    /// True when neither authentication field is set.
    pub fn is_anonymous(&self) -> bool {
        self.node_id == 0 && self.thread_id == 0
    }
}

/// The two header forms a packet can use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderForm {
    /// Connection establishment; carries the version and both IDs.
    Long { version: u32 },
    /// Steady state; carries only the destination ID.
    Short,
}

impl HeaderForm {
    pub fn is_long(&self) -> bool {
        matches!(self, HeaderForm::Long { .. })
    }

    /// Version negotiation packets are long-header packets with version 0.
    pub fn is_version_negotiation(&self) -> bool {
        matches!(self, HeaderForm::Long { version: 0 })
    }
}

/// One packet located inside a datagram by [`ProtocolEngine::decode`].
#[derive(Debug, Clone)]
pub struct DecodedPacket {
    pub form: HeaderForm,
    /// Destination connection ID as it appeared on the wire.
    pub dcid: ConnectionId,
    /// Source connection ID; long-header packets only.
    pub scid: Option<ConnectionId>,
    /// Plaintext recovered from `dcid` by the engine.
    pub dest_plaintext: CidPlaintext,
    /// The packet is itself a stateless reset and must never be answered
    /// with one.
    pub is_stateless_reset: bool,
    /// The bytes of this packet only.
    pub octets: Bytes,
}

impl DecodedPacket {
    /// Number of datagram bytes this packet consumed.
    pub fn len(&self) -> usize {
        self.octets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.octets.is_empty()
    }
}

/// A datagram an engine wants sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transmit {
    pub destination: SocketAddr,
    pub payload: Bytes,
}

/// The engine's reordered ingress for one stream.
///
/// `contiguous` exposes the bytes that are ready in order; `shift`
/// acknowledges their consumption so the engine can free reassembly state.
pub trait IngressView {
    fn contiguous(&self) -> &[u8];

    fn shift(&mut self, n: usize);

    /// True once the peer finished the stream and every byte was shifted out.
    fn is_finished(&self) -> bool;
}

/// Stream-level notifications an engine raises while processing a packet.
pub trait StreamEvents {
    /// A stream was opened by the peer.
    fn on_stream_open(&mut self, stream: StreamId) -> Result<(), EngineError>;

    /// Bytes arrived on an open stream.
    fn on_stream_data(
        &mut self,
        stream: StreamId,
        ingress: &mut dyn IngressView,
    ) -> Result<(), EngineError>;

    /// The peer reset a stream. Not a connection failure.
    fn on_stream_reset(&mut self, stream: StreamId, error_code: u64);

    /// The peer closed the whole connection.
    fn on_closed_by_peer(&mut self, error_code: u64, reason: &str);
}

/// Narrow interface to the external secure-transport engine.
///
/// None of these calls block. Decode failures are reported per packet and
/// never leave partial state behind.
pub trait ProtocolEngine: Send + 'static {
    /// Engine-owned connection state.
    type Connection: Send + 'static;

    /// Installs certificate and key material. Must happen before the socket
    /// that serves connections is created.
    fn install_key_material(&mut self, keys: &KeyMaterial) -> Result<(), EngineError>;

    fn supports_version(&self, version: u32) -> bool;

    /// Locates the first packet in `datagram`; the packet's `len()` tells the
    /// caller where the next one starts.
    fn decode(&self, datagram: &Bytes) -> Result<DecodedPacket, DecodeError>;

    /// Whether `packet` belongs to `conn`.
    fn is_destination(
        &self,
        conn: &Self::Connection,
        peer: SocketAddr,
        packet: &DecodedPacket,
    ) -> bool;

    /// The canonical ID the local side issued for `conn`.
    fn local_cid(&self, conn: &Self::Connection) -> ConnectionId;

    /// Feeds a packet into an existing connection.
    fn receive(
        &mut self,
        conn: &mut Self::Connection,
        peer: SocketAddr,
        packet: &DecodedPacket,
        events: &mut dyn StreamEvents,
    ) -> Result<(), EngineError>;

    /// Accepts a new connection from its first packet. `offered` seeds the
    /// local connection ID. Must not raise stream events.
    fn accept(
        &mut self,
        peer: SocketAddr,
        packet: &DecodedPacket,
        offered: CidPlaintext,
    ) -> Result<Self::Connection, EngineError>;

    /// Opens a client connection towards `server`.
    fn connect(
        &mut self,
        server: SocketAddr,
        offered: CidPlaintext,
    ) -> Result<Self::Connection, EngineError>;

    fn is_established(&self, conn: &Self::Connection) -> bool;

    fn is_closed(&self, conn: &Self::Connection) -> bool;

    fn open_stream(&mut self, conn: &mut Self::Connection) -> Result<StreamId, EngineError>;

    /// Queues stream bytes; returns how many were taken (0 when blocked).
    fn stream_send(
        &mut self,
        conn: &mut Self::Connection,
        stream: StreamId,
        data: &[u8],
    ) -> Result<usize, EngineError>;

    /// Pops the next datagram the connection wants sent.
    fn poll_transmit(&mut self, conn: &mut Self::Connection, now: Instant) -> Option<Transmit>;

    fn next_timeout(&self, conn: &Self::Connection) -> Option<Instant>;

    fn on_timeout(&mut self, conn: &mut Self::Connection, now: Instant) -> Result<(), EngineError>;

    /// Starts a local close; the close signal leaves through `poll_transmit`.
    fn close(&mut self, conn: &mut Self::Connection, error_code: u64);

    fn encode_version_negotiation(
        &self,
        peer: SocketAddr,
        packet: &DecodedPacket,
    ) -> Result<Bytes, EngineError>;

    fn encode_stateless_reset(
        &self,
        peer: SocketAddr,
        dcid: &ConnectionId,
    ) -> Result<Bytes, EngineError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anonymous_plaintext() {
        assert!(CidPlaintext::new(7, 0, 0).is_anonymous());
        assert!(!CidPlaintext::new(0, 0, 1).is_anonymous());
        assert!(!CidPlaintext::new(0, 3, 0).is_anonymous());
    }

    #[test]
    fn header_form_helpers() {
        assert!(HeaderForm::Long { version: 1 }.is_long());
        assert!(!HeaderForm::Short.is_long());
        assert!(HeaderForm::Long { version: 0 }.is_version_negotiation());
        assert!(!HeaderForm::Long { version: 1 }.is_version_negotiation());
    }

    #[test]
    fn connection_id_display() {
        let cid = ConnectionId::from_slice(&[0xde, 0xad, 0x01]);
        assert_eq!(cid.to_string(), "dead01");
        assert_eq!(format!("{cid:?}"), "ConnectionId(dead01)");
        assert_eq!(cid.len(), 3);
    }
}
