//! Server endpoint: one UDP socket shared by every accepted connection.
//!
//! Each readable event takes one datagram off the socket and walks the
//! packets coalesced in it:
//!
//! 1. long header, version 0: a version negotiation packet, dropped.
//! 2. long header, unsupported version: answered with version negotiation.
//! 3. addressed to a tracked connection: fed into that connection.
//! 4. unknown long header: a new connection is accepted.
//! 5. unknown short header: answered with a stateless reset if the
//!    destination ID is anonymous, otherwise dropped.
//!
//! A packet that fails to decode ends the walk; the rest of the datagram is
//! discarded. After every event all pending engine output is sent.

use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::ops::ControlFlow;
use std::time::Instant;

use bytes::Bytes;

use crate::bridge::Teardown;
use crate::config::{AcceptorConfig, KeyMaterial};
use crate::engine::{CidPlaintext, DecodedPacket, HeaderForm, ProtocolEngine, Transmit};
use crate::error::{NewbError, Result};
use crate::mux::Mux;
use crate::newb::{IoContext, Spawner};
use crate::policy::TransportPolicy;
use crate::reactor::{Reactor, Token};
use crate::registry::ConnectionKey;
use crate::socket::{create_socket, DatagramSocket, Egress};

pub struct Acceptor<E: ProtocolEngine, S> {
    mux: Mux<E, S>,
    config: AcceptorConfig,
    spawner: Box<dyn Spawner<E> + Send>,
    local_addr: SocketAddr,
    /// Plaintext offered to the engine for the next accepted connection.
    next_cid: CidPlaintext,
    scratch: Vec<u8>,
}

impl<E: ProtocolEngine> Acceptor<E, UdpSocket> {
    /// Loads key material from `config`, installs it, then binds.
    pub fn bind(
        config: AcceptorConfig,
        engine: E,
        spawner: impl Spawner<E> + Send + 'static,
    ) -> Result<Self> {
        let keys = KeyMaterial::load(&config.key_material)?;
        Self::bind_with_keys(config, engine, &keys, spawner, Ok)
    }
}

impl<E: ProtocolEngine, S: DatagramSocket> Acceptor<E, S> {
    /// Installs `keys`, creates the socket and hands it to `wrap`, which may
    /// convert it (for example into a tokio socket).
    pub fn bind_with_keys(
        config: AcceptorConfig,
        mut engine: E,
        keys: &KeyMaterial,
        spawner: impl Spawner<E> + Send + 'static,
        wrap: impl FnOnce(UdpSocket) -> io::Result<S>,
    ) -> Result<Self> {
        config.validate()?;
        engine.install_key_material(keys)?;
        let socket = create_socket(config.port, &config.host)?;
        let socket = wrap(socket)?;
        Self::assemble(config, engine, socket, spawner)
    }

    /// Serves on an existing socket.
    pub fn with_socket(
        config: AcceptorConfig,
        mut engine: E,
        keys: &KeyMaterial,
        socket: S,
        spawner: impl Spawner<E> + Send + 'static,
    ) -> Result<Self> {
        config.validate()?;
        engine.install_key_material(keys)?;
        Self::assemble(config, engine, socket, spawner)
    }

    fn assemble(
        config: AcceptorConfig,
        engine: E,
        socket: S,
        spawner: impl Spawner<E> + Send + 'static,
    ) -> Result<Self> {
        let local_addr = socket.local_addr()?;
        tracing::info!(addr = %local_addr, "acceptor listening");
        Ok(Self {
            mux: Mux::new(engine, socket, Token::Acceptor),
            next_cid: CidPlaintext::new(0, config.thread_id, config.node_id),
            scratch: vec![0; config.recv_buffer_size],
            spawner: Box::new(spawner),
            local_addr,
            config,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn config(&self) -> &AcceptorConfig {
        &self.config
    }

    pub fn socket(&self) -> &S {
        &self.mux.socket
    }

    pub fn engine(&self) -> &E {
        &self.mux.engine
    }

    pub fn engine_mut(&mut self) -> &mut E {
        &mut self.mux.engine
    }

    pub fn connection_count(&self) -> usize {
        self.mux.connections.len()
    }

    pub fn connection_keys(&self) -> Vec<ConnectionKey> {
        self.mux.connections.keys()
    }

    pub fn egress(&self) -> &Egress {
        self.mux.egress()
    }

    /// Plaintext the next accepted connection will be offered.
    pub fn next_cid(&self) -> CidPlaintext {
        self.next_cid
    }

    /// The socket is readable: receive one datagram and demultiplex it.
    pub fn read_event(&mut self, reactor: &mut dyn Reactor) -> Result<()> {
        let (len, peer) = match self.mux.socket.try_recv_from(&mut self.scratch) {
            Ok(received) => received,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
            Err(e) => {
                tracing::warn!(error = %e, "recv failed");
                return Ok(());
            }
        };
        let datagram = Bytes::copy_from_slice(&self.scratch[..len]);
        self.handle_datagram(reactor, peer, datagram);
        self.mux.flush_all(reactor);
        Ok(())
    }

    /// Walks the packets coalesced in `datagram`.
    pub fn handle_datagram(
        &mut self,
        reactor: &mut dyn Reactor,
        peer: SocketAddr,
        datagram: Bytes,
    ) {
        let mut offset = 0;
        while offset < datagram.len() {
            let packet = match self.mux.engine.decode(&datagram.slice(offset..)) {
                Ok(packet) => packet,
                Err(e) => {
                    tracing::debug!(
                        peer = %peer,
                        offset,
                        len = datagram.len(),
                        error = %e,
                        "dropping rest of datagram"
                    );
                    break;
                }
            };
            if packet.is_empty() {
                break;
            }
            offset += packet.len();
            if self.handle_packet(reactor, peer, &packet).is_break() {
                break;
            }
        }
    }

    fn handle_packet(
        &mut self,
        reactor: &mut dyn Reactor,
        peer: SocketAddr,
        packet: &DecodedPacket,
    ) -> ControlFlow<()> {
        if let HeaderForm::Long { version } = packet.form {
            if packet.form.is_version_negotiation() {
                tracing::debug!(peer = %peer, "ignoring version negotiation packet");
                return ControlFlow::Continue(());
            }
            if !self.mux.engine.supports_version(version) {
                self.negotiate_version(reactor, peer, packet);
                return ControlFlow::Continue(());
            }
        }

        match self.mux.find(reactor, peer, packet) {
            Some((key, handle)) => {
                self.mux.dispatch(reactor, key, &handle, peer, packet);
                ControlFlow::Continue(())
            }
            None if packet.form.is_long() => self.accept(reactor, peer, packet),
            None => {
                self.reset_unknown(reactor, peer, packet);
                ControlFlow::Continue(())
            }
        }
    }

    fn negotiate_version(
        &mut self,
        reactor: &mut dyn Reactor,
        peer: SocketAddr,
        packet: &DecodedPacket,
    ) {
        match self.mux.engine.encode_version_negotiation(peer, packet) {
            Ok(payload) => {
                tracing::debug!(peer = %peer, form = ?packet.form, "sending version negotiation");
                self.mux.send(
                    reactor,
                    Transmit {
                        destination: peer,
                        payload,
                    },
                );
            }
            Err(e) => {
                tracing::warn!(peer = %peer, error = %e, "could not encode version negotiation");
            }
        }
    }

    /// Answers a short-header packet for an unknown connection.
    fn reset_unknown(
        &mut self,
        reactor: &mut dyn Reactor,
        peer: SocketAddr,
        packet: &DecodedPacket,
    ) {
        if packet.is_stateless_reset {
            tracing::debug!(peer = %peer, dcid = %packet.dcid, "ignoring stateless reset");
            return;
        }
        if !packet.dest_plaintext.is_anonymous() {
            tracing::debug!(
                peer = %peer,
                dcid = %packet.dcid,
                "dropping packet for unknown connection"
            );
            return;
        }
        match self.mux.engine.encode_stateless_reset(peer, &packet.dcid) {
            Ok(payload) => {
                tracing::debug!(peer = %peer, dcid = %packet.dcid, "sending stateless reset");
                self.mux.send(
                    reactor,
                    Transmit {
                        destination: peer,
                        payload,
                    },
                );
            }
            Err(e) => {
                tracing::warn!(peer = %peer, error = %e, "could not encode stateless reset");
            }
        }
    }

    /// Accepts a new connection. Any failure discards the rest of the
    /// datagram and leaves no state behind.
    fn accept(
        &mut self,
        reactor: &mut dyn Reactor,
        peer: SocketAddr,
        packet: &DecodedPacket,
    ) -> ControlFlow<()> {
        match self.accept_connection(reactor, peer, packet) {
            Ok(_) => ControlFlow::Continue(()),
            Err(e) => {
                tracing::warn!(peer = %peer, error = %e, "accept failed");
                ControlFlow::Break(())
            }
        }
    }

    fn accept_connection(
        &mut self,
        reactor: &mut dyn Reactor,
        peer: SocketAddr,
        packet: &DecodedPacket,
    ) -> Result<ConnectionKey> {
        let conn = self
            .mux
            .engine
            .accept(peer, packet, self.next_cid)
            .map_err(|e| NewbError::AcceptRejected(e.to_string()))?;
        let cid = self.mux.engine.local_cid(&conn);

        let key = self.mux.connections.vacant_key();
        let mut transport =
            TransportPolicy::new(Token::Connection(key), conn, peer, self.config.receive_policy);
        transport.prepare_next_read();
        let newb = self.spawner.create_newb(transport)?;
        let handle = newb.upgrade().ok_or(NewbError::HandlerGone)?;

        let inserted = self.mux.connections.insert(cid.clone(), newb);
        debug_assert_eq!(inserted, key);
        self.next_cid.master_id = self.next_cid.master_id.wrapping_add(1);
        tracing::info!(peer = %peer, cid = %cid, "accepted connection");

        let started = {
            let mut newb = handle.lock();
            let mut io = IoContext::new(&mut self.mux.engine, &mut *reactor);
            newb.start(&mut io)
        };
        if let Err(e) = started {
            self.mux.teardown(reactor, key, &handle, Teardown::Failure(e));
        }
        Ok(key)
    }

    /// The writable event shared by every connection.
    pub fn write_event(&mut self, reactor: &mut dyn Reactor) -> Result<()> {
        self.mux.write_event(reactor);
        Ok(())
    }

    /// Fires expired engine timers.
    pub fn timeout(&mut self, reactor: &mut dyn Reactor, now: Instant) -> Result<()> {
        self.mux.timeout(reactor, now);
        Ok(())
    }

    /// Removes a connection the peer closed and asks its handler to shut
    /// down. Other connections are untouched.
    pub fn on_peer_closed(&mut self, reactor: &mut dyn Reactor, key: ConnectionKey) {
        if let Some(handle) = self.mux.handle(reactor, key) {
            self.mux.teardown(
                reactor,
                key,
                &handle,
                Teardown::PeerClosed {
                    code: 0,
                    reason: String::new(),
                },
            );
        }
    }

    /// Closes one connection locally.
    pub fn close(&mut self, reactor: &mut dyn Reactor, key: ConnectionKey, error_code: u64) {
        self.mux.close(reactor, key, error_code);
    }

    /// Closes every connection and drops all registrations.
    pub fn shutdown(&mut self, reactor: &mut dyn Reactor) {
        tracing::info!(
            addr = %self.local_addr,
            connections = self.mux.connections.len(),
            "acceptor shutting down"
        );
        self.mux.close_all(reactor, 0);
    }
}
