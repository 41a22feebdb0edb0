//! [`ProtocolEngine`] implementation over the plaintext wire format.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::Bytes;
use newbmux::{
    CidPlaintext, ConnectionId, DecodeError, DecodedPacket, EngineError, HeaderForm, KeyMaterial,
    ProtocolEngine, StreamEvents, StreamId, Transmit,
};

use crate::cid::{decode_cid, encode_cid, ResetTokenKey};
use crate::connection::{Connection, Role};
use crate::frame::Frame;
use crate::header::{Header, LongType, Packet, RESET_TAG, SUPPORTED_VERSIONS, VERSION_1};

pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// The plaintext reference engine.
///
/// Performs no encryption. The installed private key only seeds the
/// stateless reset tokens.
#[derive(Debug)]
pub struct PlainEngine {
    reset_key: Option<ResetTokenKey>,
    idle_timeout: Duration,
    /// Version offered by [`ProtocolEngine::connect`].
    version: u32,
}

impl PlainEngine {
    pub fn new() -> Self {
        Self {
            reset_key: None,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            version: VERSION_1,
        }
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Offers `version` on outgoing connections, supported or not.
    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    fn reset_key(&self) -> Result<&ResetTokenKey, EngineError> {
        self.reset_key
            .as_ref()
            .ok_or_else(|| EngineError::KeyMaterial("no key material installed".into()))
    }

    fn parse(packet: &DecodedPacket) -> Result<Packet, EngineError> {
        let (parsed, _) = Packet::decode(&packet.octets)?;
        Ok(parsed)
    }
}

fn is_reset(packet: &DecodedPacket) -> bool {
    packet.octets.first() == Some(&RESET_TAG)
}

impl Default for PlainEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ProtocolEngine for PlainEngine {
    type Connection = Connection;

    fn install_key_material(&mut self, keys: &KeyMaterial) -> Result<(), EngineError> {
        if keys.private_key().is_empty() {
            return Err(EngineError::KeyMaterial("private key is empty".into()));
        }
        self.reset_key = Some(ResetTokenKey::new(keys.private_key()));
        tracing::debug!(cert_len = keys.certificate_chain().len(), "key material installed");
        Ok(())
    }

    fn supports_version(&self, version: u32) -> bool {
        SUPPORTED_VERSIONS.contains(&version)
    }

    fn decode(&self, datagram: &Bytes) -> Result<DecodedPacket, DecodeError> {
        let (packet, used) = Packet::decode(datagram)?;
        let (form, scid) = match &packet.header {
            Header::Long { version, scid, .. } => {
                (HeaderForm::Long { version: *version }, Some(scid.clone()))
            }
            Header::Short { .. } | Header::Reset { .. } => (HeaderForm::Short, None),
        };
        let dcid = packet.header.dcid().clone();
        Ok(DecodedPacket {
            form,
            dest_plaintext: decode_cid(&dcid),
            is_stateless_reset: matches!(packet.header, Header::Reset { .. }),
            dcid,
            scid,
            octets: datagram.slice(..used),
        })
    }

    fn is_destination(&self, conn: &Connection, _peer: SocketAddr, packet: &DecodedPacket) -> bool {
        if &packet.dcid == conn.local_cid() {
            return true;
        }
        match conn.role() {
            Role::Server => conn.original_dcid() == Some(&packet.dcid),
            // Resets are addressed with the ID the client sends to.
            Role::Client => is_reset(packet) && &packet.dcid == conn.remote_cid(),
        }
    }

    fn local_cid(&self, conn: &Connection) -> ConnectionId {
        conn.local_cid().clone()
    }

    fn receive(
        &mut self,
        conn: &mut Connection,
        _peer: SocketAddr,
        packet: &DecodedPacket,
        events: &mut dyn StreamEvents,
    ) -> Result<(), EngineError> {
        let parsed = Self::parse(packet)?;
        conn.on_packet(&parsed, events, Instant::now())
    }

    fn accept(
        &mut self,
        peer: SocketAddr,
        packet: &DecodedPacket,
        offered: CidPlaintext,
    ) -> Result<Connection, EngineError> {
        let parsed = Self::parse(packet)?;
        let Header::Long {
            ty: LongType::Initial,
            dcid,
            scid,
            ..
        } = &parsed.header
        else {
            return Err(EngineError::Rejected("not an Initial packet".into()));
        };
        let frames = Frame::decode_all(&parsed.payload)?;
        if !frames.contains(&Frame::Hello) {
            return Err(EngineError::Rejected("Initial without HELLO".into()));
        }

        let local_cid = encode_cid(offered);
        let reset_token = self.reset_key()?.token(&local_cid)?;
        Ok(Connection::server(
            peer,
            local_cid,
            scid.clone(),
            dcid.clone(),
            reset_token,
            self.idle_timeout,
            Instant::now(),
        ))
    }

    fn connect(
        &mut self,
        server: SocketAddr,
        offered: CidPlaintext,
    ) -> Result<Connection, EngineError> {
        let initial_dcid = ConnectionId::from_slice(&rand::random::<u64>().to_be_bytes());
        Ok(Connection::client(
            server,
            self.version,
            encode_cid(offered),
            initial_dcid,
            self.idle_timeout,
            Instant::now(),
        ))
    }

    fn is_established(&self, conn: &Connection) -> bool {
        conn.is_established()
    }

    fn is_closed(&self, conn: &Connection) -> bool {
        conn.is_closed()
    }

    fn open_stream(&mut self, conn: &mut Connection) -> Result<StreamId, EngineError> {
        Ok(StreamId::from(conn.open_stream()?))
    }

    fn stream_send(
        &mut self,
        conn: &mut Connection,
        stream: StreamId,
        data: &[u8],
    ) -> Result<usize, EngineError> {
        let id = u32::try_from(stream).map_err(|_| EngineError::UnknownStream(stream))?;
        conn.send(id, data)
    }

    fn poll_transmit(&mut self, conn: &mut Connection, _now: Instant) -> Option<Transmit> {
        match conn.poll_datagram() {
            Ok(payload) => payload.map(|payload| Transmit {
                destination: conn.peer(),
                payload,
            }),
            Err(e) => {
                tracing::warn!(cid = %conn.local_cid(), error = %e, "could not build packet");
                None
            }
        }
    }

    fn next_timeout(&self, conn: &Connection) -> Option<Instant> {
        conn.next_timeout()
    }

    fn on_timeout(&mut self, conn: &mut Connection, now: Instant) -> Result<(), EngineError> {
        conn.on_timeout(now);
        Ok(())
    }

    fn close(&mut self, conn: &mut Connection, error_code: u64) {
        conn.close(error_code, "");
    }

    fn encode_version_negotiation(
        &self,
        _peer: SocketAddr,
        packet: &DecodedPacket,
    ) -> Result<Bytes, EngineError> {
        let scid = packet.scid.clone().unwrap_or_default();
        Ok(Packet::version_negotiation(&packet.dcid, &scid)?.encode())
    }

    fn encode_stateless_reset(
        &self,
        _peer: SocketAddr,
        dcid: &ConnectionId,
    ) -> Result<Bytes, EngineError> {
        let token = self.reset_key()?.token(dcid)?;
        Ok(Packet::reset(dcid.clone(), token)?.encode())
    }
}
