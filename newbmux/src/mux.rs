//! Connection bookkeeping shared by the acceptor and the dialer.
//!
//! Owns the engine, the socket and the connection table, and implements
//! routing to existing connections, the pending-output drain and teardown.

use std::net::SocketAddr;
use std::time::Instant;

use crate::bridge::{self, Teardown};
use crate::engine::{DecodedPacket, ProtocolEngine, Transmit};
use crate::error::Operation;
use crate::newb::{IoContext, NewbHandle, NewbRef};
use crate::reactor::{Reactor, Token};
use crate::registry::{ConnectionKey, ConnectionTable};
use crate::socket::{DatagramSocket, Egress};

/// Close code used when a connection is torn down after a failure.
pub const INTERNAL_ERROR: u64 = 0x1;

pub(crate) struct Mux<E: ProtocolEngine, S> {
    pub(crate) engine: E,
    pub(crate) socket: S,
    pub(crate) connections: ConnectionTable<NewbRef<E>>,
    egress: Egress,
    /// Endpoint token holding write interest while the egress backlog is
    /// non-empty.
    token: Token,
}

impl<E: ProtocolEngine, S: DatagramSocket> Mux<E, S> {
    pub(crate) fn new(engine: E, socket: S, token: Token) -> Self {
        Self {
            engine,
            socket,
            connections: ConnectionTable::new(),
            egress: Egress::new(),
            token,
        }
    }

    pub(crate) fn egress(&self) -> &Egress {
        &self.egress
    }

    /// Upgrades the handler reference of `key`. A handler that is gone takes
    /// its table entry with it.
    pub(crate) fn handle(
        &mut self,
        reactor: &mut dyn Reactor,
        key: ConnectionKey,
    ) -> Option<NewbHandle<E>> {
        let weak = self.connections.get(key)?;
        if let Some(handle) = weak.upgrade() {
            return Some(handle);
        }
        tracing::debug!(?key, "handler gone, dropping connection");
        self.connections.remove(key);
        let token = Token::Connection(key);
        reactor.set_timeout(token, None);
        reactor.deregister(token, Operation::Write);
        None
    }

    /// Finds the connection `packet` is addressed to: direct ID lookup first,
    /// then the engine's predicate over every tracked connection.
    pub(crate) fn find(
        &mut self,
        reactor: &mut dyn Reactor,
        peer: SocketAddr,
        packet: &DecodedPacket,
    ) -> Option<(ConnectionKey, NewbHandle<E>)> {
        if let Some(key) = self.connections.lookup(&packet.dcid) {
            if let Some(handle) = self.handle(reactor, key) {
                return Some((key, handle));
            }
        }
        for key in self.connections.keys() {
            let Some(handle) = self.handle(reactor, key) else {
                continue;
            };
            let hit = {
                let newb = handle.lock();
                self.engine
                    .is_destination(newb.transport().connection(), peer, packet)
            };
            if hit {
                return Some((key, handle));
            }
        }
        None
    }

    pub(crate) fn dispatch(
        &mut self,
        reactor: &mut dyn Reactor,
        key: ConnectionKey,
        handle: &NewbHandle<E>,
        peer: SocketAddr,
        packet: &DecodedPacket,
    ) {
        let outcome = {
            let mut newb = handle.lock();
            let mut io = IoContext::new(&mut self.engine, &mut *reactor);
            bridge::dispatch(&mut *newb, &mut io, peer, packet)
        };
        if let Some(reason) = outcome {
            self.teardown(reactor, key, handle, reason);
        }
    }

    pub(crate) fn send(&mut self, reactor: &mut dyn Reactor, transmit: Transmit) {
        self.egress.send(&self.socket, transmit, reactor, self.token);
    }

    /// Sends everything `key`'s engine connection has queued, re-arms its
    /// timer and tears it down once the engine reports it closed.
    pub(crate) fn flush_connection(&mut self, reactor: &mut dyn Reactor, key: ConnectionKey) {
        let Some(handle) = self.handle(reactor, key) else {
            return;
        };
        let now = Instant::now();
        let mut transmits = Vec::new();
        let closed = {
            let mut newb = handle.lock();
            let transport = newb.transport_mut();
            if transport.pending_output() == 0 {
                if let Some(code) = transport.take_close_request() {
                    tracing::debug!(peer = %transport.peer(), code, "closing connection");
                    self.engine.close(transport.connection_mut(), code);
                }
            }
            while let Some(t) = self.engine.poll_transmit(transport.connection_mut(), now) {
                transmits.push(t);
            }
            reactor.set_timeout(
                Token::Connection(key),
                self.engine.next_timeout(transport.connection()),
            );
            self.engine.is_closed(transport.connection())
        };
        for t in transmits {
            self.send(reactor, t);
        }
        if closed {
            self.teardown(reactor, key, &handle, Teardown::Closed);
        }
    }

    pub(crate) fn flush_all(&mut self, reactor: &mut dyn Reactor) {
        for key in self.connections.keys() {
            self.flush_connection(reactor, key);
        }
    }

    /// Removes `key` and shuts its handler down. Runs at most once per
    /// connection; pending writes are discarded, not flushed.
    pub(crate) fn teardown(
        &mut self,
        reactor: &mut dyn Reactor,
        key: ConnectionKey,
        handle: &NewbHandle<E>,
        reason: Teardown,
    ) {
        if self.connections.remove(key).is_none() {
            return;
        }
        let token = Token::Connection(key);
        reactor.set_timeout(token, None);

        let mut transmits = Vec::new();
        {
            let mut newb = handle.lock();
            let peer = newb.transport().peer();
            match &reason {
                Teardown::PeerClosed { code, reason } => {
                    tracing::info!(
                        peer = %peer,
                        code,
                        reason = %reason,
                        "connection closed by peer"
                    );
                }
                Teardown::Closed => {
                    tracing::info!(peer = %peer, "connection closed");
                }
                Teardown::Failure(err) => {
                    tracing::warn!(peer = %peer, error = %err, "connection failed");
                    newb.io_error(err);
                    let conn = newb.transport_mut().connection_mut();
                    if !self.engine.is_closed(conn) {
                        self.engine.close(conn, INTERNAL_ERROR);
                        while let Some(t) = self.engine.poll_transmit(conn, Instant::now()) {
                            transmits.push(t);
                        }
                    }
                }
            }
            let mut io = IoContext::new(&mut self.engine, &mut *reactor);
            newb.graceful_shutdown(&mut io);
        }
        reactor.deregister(token, Operation::Write);
        for t in transmits {
            self.send(reactor, t);
        }
    }

    /// Drains the egress backlog, lets every handler write, then sends what
    /// the handlers produced.
    pub(crate) fn write_event(&mut self, reactor: &mut dyn Reactor) {
        self.egress.drain(&self.socket);
        for key in self.connections.keys() {
            let Some(handle) = self.handle(reactor, key) else {
                continue;
            };
            let result = {
                let mut newb = handle.lock();
                let mut io = IoContext::new(&mut self.engine, &mut *reactor);
                newb.write_event(&mut io)
            };
            if let Err(e) = result {
                self.teardown(reactor, key, &handle, Teardown::Failure(e));
            }
        }
        self.flush_all(reactor);
        if self.egress.is_empty() {
            reactor.deregister(self.token, Operation::Write);
        }
    }

    /// Fires every engine timer that expired by `now`.
    pub(crate) fn timeout(&mut self, reactor: &mut dyn Reactor, now: Instant) {
        for key in self.connections.keys() {
            let Some(handle) = self.handle(reactor, key) else {
                continue;
            };
            let result = {
                let mut newb = handle.lock();
                let conn = newb.transport_mut().connection_mut();
                match self.engine.next_timeout(conn) {
                    Some(at) if at <= now => self.engine.on_timeout(conn, now),
                    _ => Ok(()),
                }
            };
            if let Err(e) = result {
                self.teardown(reactor, key, &handle, Teardown::Failure(e.into()));
            }
        }
        self.flush_all(reactor);
    }

    /// Starts a local close of `key` and flushes the close signal.
    pub(crate) fn close(&mut self, reactor: &mut dyn Reactor, key: ConnectionKey, code: u64) {
        let Some(handle) = self.handle(reactor, key) else {
            return;
        };
        {
            let mut newb = handle.lock();
            let transport = newb.transport_mut();
            transport.discard_pending_writes(reactor);
            self.engine.close(transport.connection_mut(), code);
        }
        self.flush_connection(reactor, key);
    }

    /// Closes every connection and drops all registrations.
    pub(crate) fn close_all(&mut self, reactor: &mut dyn Reactor, code: u64) {
        for key in self.connections.keys() {
            self.close(reactor, key, code);
        }
        if !self.egress.drain(&self.socket) {
            tracing::debug!(dropped = self.egress.len(), "discarding unsent datagrams");
            self.egress.clear();
        }
        reactor.deregister(self.token, Operation::Write);
    }
}
