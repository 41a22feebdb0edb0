//! Minimal engine for unit tests of the buffering layer.

use std::net::SocketAddr;
use std::time::Instant;

use bytes::Bytes;

use crate::config::KeyMaterial;
use crate::engine::{
    CidPlaintext, ConnectionId, DecodedPacket, ProtocolEngine, StreamEvents, StreamId, Transmit,
};
use crate::error::{DecodeError, EngineError};

#[derive(Debug, Default)]
pub(crate) struct NullConnection {
    next_stream: StreamId,
}

/// Swallows stream bytes into `sent`; takes at most `accept_limit` per call.
#[derive(Debug, Default)]
pub(crate) struct NullEngine {
    pub(crate) sent: Vec<u8>,
    pub(crate) accept_limit: Option<usize>,
    pub(crate) fail_sends: bool,
}

impl ProtocolEngine for NullEngine {
    type Connection = NullConnection;

    fn install_key_material(&mut self, _keys: &KeyMaterial) -> Result<(), EngineError> {
        Ok(())
    }

    fn supports_version(&self, version: u32) -> bool {
        version == 1
    }

    fn decode(&self, datagram: &Bytes) -> Result<DecodedPacket, DecodeError> {
        Err(DecodeError::NeedsMoreData {
            needed: 1,
            available: datagram.len(),
        })
    }

    fn is_destination(&self, _: &NullConnection, _: SocketAddr, _: &DecodedPacket) -> bool {
        false
    }

    fn local_cid(&self, _: &NullConnection) -> ConnectionId {
        ConnectionId::default()
    }

    fn receive(
        &mut self,
        _: &mut NullConnection,
        _: SocketAddr,
        _: &DecodedPacket,
        _: &mut dyn StreamEvents,
    ) -> Result<(), EngineError> {
        Ok(())
    }

    fn accept(
        &mut self,
        _: SocketAddr,
        _: &DecodedPacket,
        _: CidPlaintext,
    ) -> Result<NullConnection, EngineError> {
        Ok(NullConnection::default())
    }

    fn connect(&mut self, _: SocketAddr, _: CidPlaintext) -> Result<NullConnection, EngineError> {
        Ok(NullConnection::default())
    }

    fn is_established(&self, _: &NullConnection) -> bool {
        true
    }

    fn is_closed(&self, _: &NullConnection) -> bool {
        false
    }

    fn open_stream(&mut self, conn: &mut NullConnection) -> Result<StreamId, EngineError> {
        let id = conn.next_stream;
        conn.next_stream += 4;
        Ok(id)
    }

    fn stream_send(
        &mut self,
        _: &mut NullConnection,
        _: StreamId,
        data: &[u8],
    ) -> Result<usize, EngineError> {
        if self.fail_sends {
            return Err(EngineError::ConnectionClosed);
        }
        let n = self.accept_limit.map_or(data.len(), |l| l.min(data.len()));
        self.sent.extend_from_slice(&data[..n]);
        Ok(n)
    }

    fn poll_transmit(&mut self, _: &mut NullConnection, _: Instant) -> Option<Transmit> {
        None
    }

    fn next_timeout(&self, _: &NullConnection) -> Option<Instant> {
        None
    }

    fn on_timeout(&mut self, _: &mut NullConnection, _: Instant) -> Result<(), EngineError> {
        Ok(())
    }

    fn close(&mut self, _: &mut NullConnection, _: u64) {}

    fn encode_version_negotiation(
        &self,
        _: SocketAddr,
        _: &DecodedPacket,
    ) -> Result<Bytes, EngineError> {
        Ok(Bytes::new())
    }

    fn encode_stateless_reset(
        &self,
        _: SocketAddr,
        _: &ConnectionId,
    ) -> Result<Bytes, EngineError> {
        Ok(Bytes::new())
    }
}
