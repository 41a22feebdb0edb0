//! Connection state machine.
//!
//! Manages the lifecycle of one reference-engine connection:
//! Handshaking -> Established -> Closed.
//!
//! The client sends HELLO in an Initial packet and holds stream data until
//! the server's HELLO_ACK arrives in a Handshake packet. The server is
//! established as soon as it accepts. Afterwards both sides exchange short
//! packets. The path is assumed lossless: nothing is retransmitted.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use newbmux::{ConnectionId, EngineError, StreamEvents, StreamId};

use crate::error::{Result, WireError};
use crate::frame::{Frame, STREAM_OVERHEAD};
use crate::header::{Header, LongType, Packet, RESET_TOKEN_LEN, VERSION_1};
use crate::reassembly::StreamReassembly;

/// Longest close reason put on the wire.
const MAX_REASON_LEN: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Connection state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Client waiting for HELLO_ACK.
    Handshaking,
    /// Ready for stream data.
    Established,
    /// Closed locally, by the peer, by a reset or by the idle timer.
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Handshaking => write!(f, "Handshaking"),
            ConnectionState::Established => write!(f, "Established"),
            ConnectionState::Closed => write!(f, "Closed"),
        }
    }
}

pub struct Connection {
    role: Role,
    state: ConnectionState,
    peer: SocketAddr,
    version: u32,
    local_cid: ConnectionId,
    /// Where packets are addressed. The client starts with a random ID and
    /// switches to the server's ID once it learns it.
    remote_cid: ConnectionId,
    /// Server only: the ID the client addressed its Initial to.
    original_dcid: Option<ConnectionId>,
    /// Token that lets the server reset this connection statelessly.
    reset_token: Option<[u8; RESET_TOKEN_LEN]>,
    /// Frames for long-header packets.
    handshake: VecDeque<Frame>,
    /// Frames for short-header packets.
    outbound: VecDeque<Frame>,
    recv: HashMap<u32, StreamReassembly>,
    reset_streams: HashSet<u32>,
    send_offsets: HashMap<u32, u64>,
    next_stream: u32,
    idle_timeout: Duration,
    last_activity: Instant,
}

impl Connection {
    /// Client side: queues HELLO towards `initial_dcid`.
    pub fn client(
        peer: SocketAddr,
        version: u32,
        local_cid: ConnectionId,
        initial_dcid: ConnectionId,
        idle_timeout: Duration,
        now: Instant,
    ) -> Self {
        let mut conn = Self::new(
            Role::Client,
            peer,
            version,
            local_cid,
            initial_dcid,
            idle_timeout,
            now,
        );
        conn.handshake.push_back(Frame::Hello);
        conn
    }

    /// Server side: established on creation, HELLO_ACK queued.
    pub fn server(
        peer: SocketAddr,
        local_cid: ConnectionId,
        remote_cid: ConnectionId,
        original_dcid: ConnectionId,
        reset_token: [u8; RESET_TOKEN_LEN],
        idle_timeout: Duration,
        now: Instant,
    ) -> Self {
        let mut conn = Self::new(
            Role::Server,
            peer,
            VERSION_1,
            local_cid,
            remote_cid,
            idle_timeout,
            now,
        );
        conn.state = ConnectionState::Established;
        conn.original_dcid = Some(original_dcid);
        conn.reset_token = Some(reset_token);
        conn.handshake.push_back(Frame::HelloAck { reset_token });
        conn
    }

    fn new(
        role: Role,
        peer: SocketAddr,
        version: u32,
        local_cid: ConnectionId,
        remote_cid: ConnectionId,
        idle_timeout: Duration,
        now: Instant,
    ) -> Self {
        Self {
            role,
            state: ConnectionState::Handshaking,
            peer,
            version,
            local_cid,
            remote_cid,
            original_dcid: None,
            reset_token: None,
            handshake: VecDeque::new(),
            outbound: VecDeque::new(),
            recv: HashMap::new(),
            reset_streams: HashSet::new(),
            send_offsets: HashMap::new(),
            next_stream: match role {
                Role::Client => 0,
                Role::Server => 1,
            },
            idle_timeout,
            last_activity: now,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn local_cid(&self) -> &ConnectionId {
        &self.local_cid
    }

    pub fn remote_cid(&self) -> &ConnectionId {
        &self.remote_cid
    }

    pub fn original_dcid(&self) -> Option<&ConnectionId> {
        self.original_dcid.as_ref()
    }

    pub fn reset_token(&self) -> Option<&[u8; RESET_TOKEN_LEN]> {
        self.reset_token.as_ref()
    }

    pub fn is_established(&self) -> bool {
        self.state == ConnectionState::Established
    }

    pub fn is_closed(&self) -> bool {
        self.state == ConnectionState::Closed
    }

    /// Frames waiting to be packetized.
    pub fn queued_frames(&self) -> usize {
        self.handshake.len() + self.outbound.len()
    }

    fn transition(&mut self, to: ConnectionState) -> Result<()> {
        let allowed = matches!(
            (self.state, to),
            (ConnectionState::Handshaking, ConnectionState::Established)
                | (ConnectionState::Handshaking, ConnectionState::Closed)
                | (ConnectionState::Established, ConnectionState::Closed)
        );
        if !allowed {
            return Err(WireError::InvalidStateTransition {
                from: self.state.to_string(),
                to: to.to_string(),
            });
        }
        tracing::trace!(cid = %self.local_cid, from = %self.state, to = %to, "state change");
        self.state = to;
        Ok(())
    }

    pub fn open_stream(&mut self) -> Result<u32> {
        if self.is_closed() {
            return Err(WireError::InvalidStateTransition {
                from: self.state.to_string(),
                to: "stream open".into(),
            });
        }
        let id = self.next_stream;
        self.next_stream = self.next_stream.wrapping_add(4);
        self.send_offsets.insert(id, 0);
        Ok(id)
    }

    /// Splits `data` into STREAM frames that each fit a short packet.
    pub fn send(&mut self, stream: u32, data: &[u8]) -> std::result::Result<usize, EngineError> {
        if self.is_closed() {
            return Err(EngineError::ConnectionClosed);
        }
        if self.reset_streams.contains(&stream) {
            return Err(EngineError::UnknownStream(StreamId::from(stream)));
        }
        let offset = self.send_offsets.entry(stream).or_insert(0);
        let chunk = Packet::short_payload_budget() - STREAM_OVERHEAD;
        for piece in data.chunks(chunk) {
            self.outbound.push_back(Frame::Stream {
                stream_id: stream,
                offset: *offset,
                fin: false,
                data: Bytes::copy_from_slice(piece),
            });
            *offset += piece.len() as u64;
        }
        Ok(data.len())
    }

    /// Queues CLOSE and moves to `Closed`. The CLOSE frame stays pollable.
    pub fn close(&mut self, error_code: u64, reason: &str) {
        if self.is_closed() {
            return;
        }
        if !self.is_established() {
            self.outbound.retain(|f| !f.is_application());
        }
        let mut reason = reason.to_owned();
        if reason.len() > MAX_REASON_LEN {
            let mut cut = MAX_REASON_LEN;
            while !reason.is_char_boundary(cut) {
                cut -= 1;
            }
            reason.truncate(cut);
        }
        self.outbound.push_back(Frame::Close { error_code, reason });
        self.state = ConnectionState::Closed;
        tracing::debug!(cid = %self.local_cid, error_code, "connection closed locally");
    }

    /// Ends the connection without telling the peer.
    fn terminate(&mut self) {
        self.handshake.clear();
        self.outbound.clear();
        self.state = ConnectionState::Closed;
    }

    /// Builds the next datagram, if anything can be sent.
    pub fn poll_datagram(&mut self) -> Result<Option<Bytes>> {
        if !self.handshake.is_empty() {
            let mut payload = BytesMut::new();
            for frame in self.handshake.drain(..) {
                frame.encode_into(&mut payload);
            }
            let ty = match self.role {
                Role::Client => LongType::Initial,
                Role::Server => LongType::Handshake,
            };
            let packet = Packet::new(
                Header::Long {
                    ty,
                    version: self.version,
                    dcid: self.remote_cid.clone(),
                    scid: self.local_cid.clone(),
                },
                payload.freeze(),
            )?;
            return Ok(Some(packet.encode()));
        }

        let held = self.state == ConnectionState::Handshaking;
        let budget = Packet::short_payload_budget();
        let mut payload = BytesMut::new();
        while let Some(frame) = self.outbound.front() {
            if held && frame.is_application() {
                break;
            }
            if !payload.is_empty() && payload.len() + frame.encoded_len() > budget {
                break;
            }
            if let Some(frame) = self.outbound.pop_front() {
                frame.encode_into(&mut payload);
            }
        }
        if payload.is_empty() {
            return Ok(None);
        }
        let packet = Packet::short(self.remote_cid.clone(), payload.freeze())?;
        Ok(Some(packet.encode()))
    }

    /// Processes one packet addressed to this connection.
    pub fn on_packet(
        &mut self,
        packet: &Packet,
        events: &mut dyn StreamEvents,
        now: Instant,
    ) -> std::result::Result<(), EngineError> {
        if self.is_closed() {
            return Ok(());
        }
        self.last_activity = now;
        match &packet.header {
            Header::Reset { token, .. } => {
                if self.reset_token.as_ref() == Some(token) {
                    tracing::debug!(cid = %self.local_cid, "stateless reset received");
                    self.terminate();
                    events.on_closed_by_peer(0, "stateless reset");
                }
                return Ok(());
            }
            Header::Long { version: 0, .. } => {
                if !packet.supported_versions().contains(&self.version) {
                    tracing::debug!(
                        cid = %self.local_cid,
                        version = self.version,
                        "version rejected by peer"
                    );
                    self.terminate();
                    events.on_closed_by_peer(0, "no common version");
                }
                return Ok(());
            }
            Header::Long {
                ty: LongType::Handshake,
                scid,
                ..
            } if self.role == Role::Client => {
                self.remote_cid = scid.clone();
            }
            _ => {}
        }

        for frame in Frame::decode_all(&packet.payload)? {
            self.on_frame(frame, events)?;
            if self.is_closed() {
                break;
            }
        }
        Ok(())
    }

    fn on_frame(
        &mut self,
        frame: Frame,
        events: &mut dyn StreamEvents,
    ) -> std::result::Result<(), EngineError> {
        match frame {
            Frame::Hello => {
                // A retransmitted Initial: answer it again.
                if let (Role::Server, Some(reset_token)) = (self.role, self.reset_token) {
                    self.handshake.push_back(Frame::HelloAck { reset_token });
                }
            }
            Frame::HelloAck { reset_token } => {
                if self.role == Role::Client && self.state == ConnectionState::Handshaking {
                    self.reset_token = Some(reset_token);
                    self.transition(ConnectionState::Established)?;
                }
            }
            Frame::Stream {
                stream_id,
                offset,
                fin,
                data,
            } => {
                if self.reset_streams.contains(&stream_id) {
                    return Ok(());
                }
                let id = StreamId::from(stream_id);
                if !self.recv.contains_key(&stream_id) {
                    events.on_stream_open(id)?;
                }
                let reassembly = self.recv.entry(stream_id).or_default();
                reassembly.insert(offset, data, fin)?;
                events.on_stream_data(id, reassembly)?;
            }
            Frame::ResetStream {
                stream_id,
                error_code,
            } => {
                self.recv.remove(&stream_id);
                self.reset_streams.insert(stream_id);
                events.on_stream_reset(StreamId::from(stream_id), error_code);
            }
            Frame::Close { error_code, reason } => {
                tracing::debug!(
                    cid = %self.local_cid,
                    error_code,
                    reason = %reason,
                    "closed by peer"
                );
                self.terminate();
                events.on_closed_by_peer(error_code, &reason);
            }
            Frame::Ping => {}
        }
        Ok(())
    }

    pub fn next_timeout(&self) -> Option<Instant> {
        if self.is_closed() {
            None
        } else {
            Some(self.last_activity + self.idle_timeout)
        }
    }

    /// Closes the connection silently once it was idle for too long.
    pub fn on_timeout(&mut self, now: Instant) {
        match self.next_timeout() {
            Some(deadline) if now >= deadline => {
                tracing::debug!(cid = %self.local_cid, "idle timeout");
                self.terminate();
            }
            _ => {}
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("role", &self.role)
            .field("state", &self.state)
            .field("peer", &self.peer)
            .field("local_cid", &self.local_cid)
            .field("remote_cid", &self.remote_cid)
            .field("queued_frames", &self.queued_frames())
            .finish()
    }
}
