//! Scripted engine and recording protocol shared by the integration tests.
//!
//! Packet layout: `[kind, version, dcid, auth, len, payload..]` where kind
//! is `1` (long), `2` (short) or `3` (a stateless reset in short form).
//! Payloads steer the engine: `close` closes the connection from the peer
//! side, `reset` resets stream 1, anything else is stream data on stream 1.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use parking_lot::Mutex;

use newbmux::{
    BasicNewb, CidPlaintext, ConnectionId, DecodeError, DecodedPacket, EngineError, HeaderForm,
    KeyMaterial, NewbError, NewbPool, Outbox, Protocol, ProtocolEngine, SliceIngress,
    StreamEvents, StreamId, Transmit, TransportPolicy,
};

pub const LONG: u8 = 1;
pub const SHORT: u8 = 2;
pub const RESET: u8 = 3;
pub const STREAM: StreamId = 1;

pub fn packet(kind: u8, version: u8, dcid: u8, auth: u8, payload: &[u8]) -> Vec<u8> {
    let mut p = vec![kind, version, dcid, auth, payload.len() as u8];
    p.extend_from_slice(payload);
    p
}

pub fn long(dcid: u8, payload: &[u8]) -> Vec<u8> {
    packet(LONG, 1, dcid, 1, payload)
}

pub fn short(dcid: u8, payload: &[u8]) -> Vec<u8> {
    packet(SHORT, 1, dcid, 1, payload)
}

pub fn keys() -> KeyMaterial {
    KeyMaterial::from_pem(&b"-----CERT-----"[..], &b"-----KEY-----"[..])
}

#[derive(Debug)]
pub struct ScriptedConn {
    pub cid: u8,
    pub original_dcid: Option<u8>,
    pub peer: SocketAddr,
    pub established: bool,
    pub closed: bool,
    stream_open: bool,
    outbound: VecDeque<Bytes>,
}

/// What the engine saw, in order.
#[derive(Debug, Default)]
pub struct EngineLog {
    /// Destination ID of every packet fed into an existing connection.
    pub dispatched: Vec<u8>,
    pub accepted: usize,
    pub keys_installed: bool,
}

#[derive(Debug, Default)]
pub struct ScriptedEngine {
    pub log: EngineLog,
}

impl ScriptedEngine {
    fn conn(cid: u8, original_dcid: Option<u8>, peer: SocketAddr) -> ScriptedConn {
        ScriptedConn {
            cid,
            original_dcid,
            peer,
            established: false,
            closed: false,
            stream_open: false,
            outbound: VecDeque::new(),
        }
    }
}

impl ProtocolEngine for ScriptedEngine {
    type Connection = ScriptedConn;

    fn install_key_material(&mut self, keys: &KeyMaterial) -> Result<(), EngineError> {
        if keys.private_key().is_empty() {
            return Err(EngineError::KeyMaterial("empty private key".into()));
        }
        self.log.keys_installed = true;
        Ok(())
    }

    fn supports_version(&self, version: u32) -> bool {
        version == 1
    }

    fn decode(&self, datagram: &Bytes) -> Result<DecodedPacket, DecodeError> {
        if datagram.len() < 5 {
            return Err(DecodeError::NeedsMoreData {
                needed: 5,
                available: datagram.len(),
            });
        }
        let form = match datagram[0] {
            LONG => HeaderForm::Long {
                version: u32::from(datagram[1]),
            },
            SHORT | RESET => HeaderForm::Short,
            other => return Err(DecodeError::Malformed(format!("kind {other}"))),
        };
        let total = 5 + usize::from(datagram[4]);
        if datagram.len() < total {
            return Err(DecodeError::NeedsMoreData {
                needed: total,
                available: datagram.len(),
            });
        }
        let dcid = datagram[2];
        Ok(DecodedPacket {
            form,
            dcid: ConnectionId::from_slice(&[dcid]),
            scid: None,
            dest_plaintext: CidPlaintext::new(u32::from(dcid), 0, u16::from(datagram[3])),
            is_stateless_reset: datagram[0] == RESET,
            octets: datagram.slice(..total),
        })
    }

    fn is_destination(
        &self,
        conn: &ScriptedConn,
        _peer: SocketAddr,
        packet: &DecodedPacket,
    ) -> bool {
        let dcid = packet.dcid.as_bytes()[0];
        dcid == conn.cid || Some(dcid) == conn.original_dcid
    }

    fn local_cid(&self, conn: &ScriptedConn) -> ConnectionId {
        ConnectionId::from_slice(&[conn.cid])
    }

    fn receive(
        &mut self,
        conn: &mut ScriptedConn,
        _peer: SocketAddr,
        packet: &DecodedPacket,
        events: &mut dyn StreamEvents,
    ) -> Result<(), EngineError> {
        self.log.dispatched.push(packet.dcid.as_bytes()[0]);
        conn.established = true;
        let payload = &packet.octets[5..];
        match payload {
            b"" => Ok(()),
            b"close" => {
                conn.closed = true;
                events.on_closed_by_peer(0, "bye");
                Ok(())
            }
            b"reset" => {
                events.on_stream_reset(STREAM, 9);
                Ok(())
            }
            b"fail" => Err(EngineError::Internal("scripted failure".into())),
            data => {
                if !conn.stream_open {
                    conn.stream_open = true;
                    events.on_stream_open(STREAM)?;
                }
                events.on_stream_data(STREAM, &mut SliceIngress::new(data, false))
            }
        }
    }

    fn accept(
        &mut self,
        peer: SocketAddr,
        packet: &DecodedPacket,
        offered: CidPlaintext,
    ) -> Result<ScriptedConn, EngineError> {
        if &packet.octets[5..] == b"reject" {
            return Err(EngineError::Rejected("scripted rejection".into()));
        }
        self.log.accepted += 1;
        let cid = 0x80 | offered.master_id as u8;
        let mut conn = Self::conn(cid, Some(packet.dcid.as_bytes()[0]), peer);
        conn.established = true;
        Ok(conn)
    }

    fn connect(
        &mut self,
        server: SocketAddr,
        offered: CidPlaintext,
    ) -> Result<ScriptedConn, EngineError> {
        let mut conn = Self::conn(0x40 | offered.master_id as u8, None, server);
        conn.outbound
            .push_back(Bytes::from(packet(LONG, 1, 0x01, 0, b"")));
        Ok(conn)
    }

    fn is_established(&self, conn: &ScriptedConn) -> bool {
        conn.established
    }

    fn is_closed(&self, conn: &ScriptedConn) -> bool {
        conn.closed
    }

    fn open_stream(&mut self, conn: &mut ScriptedConn) -> Result<StreamId, EngineError> {
        conn.stream_open = true;
        Ok(STREAM)
    }

    fn stream_send(
        &mut self,
        conn: &mut ScriptedConn,
        _stream: StreamId,
        data: &[u8],
    ) -> Result<usize, EngineError> {
        if conn.closed {
            return Err(EngineError::ConnectionClosed);
        }
        for chunk in data.chunks(200) {
            conn.outbound
                .push_back(Bytes::from(packet(SHORT, 1, conn.cid, 1, chunk)));
        }
        Ok(data.len())
    }

    fn poll_transmit(&mut self, conn: &mut ScriptedConn, _now: Instant) -> Option<Transmit> {
        conn.outbound.pop_front().map(|payload| Transmit {
            destination: conn.peer,
            payload,
        })
    }

    fn next_timeout(&self, _conn: &ScriptedConn) -> Option<Instant> {
        None
    }

    fn on_timeout(&mut self, _conn: &mut ScriptedConn, _now: Instant) -> Result<(), EngineError> {
        Ok(())
    }

    fn close(&mut self, conn: &mut ScriptedConn, error_code: u64) {
        if !conn.closed {
            conn.closed = true;
            conn.outbound
                .push_back(Bytes::from(packet(SHORT, 1, conn.cid, 1, &[0xCC, error_code as u8])));
        }
    }

    fn encode_version_negotiation(
        &self,
        _peer: SocketAddr,
        pkt: &DecodedPacket,
    ) -> Result<Bytes, EngineError> {
        Ok(Bytes::from(packet(LONG, 0, pkt.dcid.as_bytes()[0], 0, &[1])))
    }

    fn encode_stateless_reset(
        &self,
        _peer: SocketAddr,
        dcid: &ConnectionId,
    ) -> Result<Bytes, EngineError> {
        Ok(Bytes::from(vec![0xFF, dcid.as_bytes()[0]]))
    }
}

/// Shared record of what one newb experienced.
#[derive(Debug, Default)]
pub struct Stats {
    pub started: usize,
    pub messages: Vec<Vec<u8>>,
    pub resets: Vec<(StreamId, u64)>,
    pub errors: Vec<String>,
    pub shutdowns: usize,
}

/// Echoes every message; `quit` requests a local close.
pub struct Recorder {
    pub stats: Arc<Mutex<Stats>>,
}

impl Protocol for Recorder {
    fn on_start(&mut self, _out: &mut Outbox<'_>) {
        self.stats.lock().started += 1;
    }

    fn on_message(&mut self, data: &[u8], out: &mut Outbox<'_>) {
        self.stats.lock().messages.push(data.to_vec());
        if data == b"quit" {
            out.close(0);
        } else {
            out.write(data);
        }
    }

    fn on_stream_reset(&mut self, stream: StreamId, error_code: u64) {
        self.stats.lock().resets.push((stream, error_code));
    }

    fn on_io_error(&mut self, err: &NewbError) {
        self.stats.lock().errors.push(err.to_string());
    }

    fn on_shutdown(&mut self) {
        self.stats.lock().shutdowns += 1;
    }
}

pub type ScriptedHandle = newbmux::NewbHandle<ScriptedEngine>;

pub type Factory =
    Box<dyn FnMut(TransportPolicy<ScriptedEngine>) -> newbmux::Result<ScriptedHandle> + Send>;

/// Pool plus the stats of every newb it spawned, in spawn order.
pub struct Harness {
    pub pool: Arc<Mutex<NewbPool<ScriptedEngine, Factory>>>,
    pub stats: Arc<Mutex<Vec<Arc<Mutex<Stats>>>>>,
}

impl Harness {
    pub fn new() -> Self {
        let stats: Arc<Mutex<Vec<Arc<Mutex<Stats>>>>> = Arc::default();
        let sink = stats.clone();
        let factory: Factory = Box::new(move |transport| {
            let s = Arc::new(Mutex::new(Stats::default()));
            sink.lock().push(s.clone());
            Ok(BasicNewb::spawn(transport, Recorder { stats: s }))
        });
        Self {
            pool: Arc::new(Mutex::new(NewbPool::new(factory))),
            stats,
        }
    }

    pub fn stats(&self, i: usize) -> Arc<Mutex<Stats>> {
        self.stats.lock()[i].clone()
    }

    pub fn spawned(&self) -> usize {
        self.stats.lock().len()
    }
}
