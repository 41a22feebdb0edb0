//! Client endpoint: a single connection on its own socket.
//!
//! The handshake is driven by ordinary readable events. A connect deadline
//! armed on [`Token::Dialer`] tears the connection down with
//! [`NewbError::ConnectTimeout`] if the engine does not report the
//! connection established in time.

use std::io;
use std::net::SocketAddr;
use std::time::Instant;

use bytes::Bytes;

use crate::bridge::Teardown;
use crate::config::DialerConfig;
use crate::engine::{CidPlaintext, ProtocolEngine};
use crate::error::{NewbError, Result};
use crate::mux::Mux;
use crate::newb::{IoContext, NewbHandle, Spawner};
use crate::policy::TransportPolicy;
use crate::reactor::{Reactor, Token};
use crate::registry::ConnectionKey;
use crate::socket::DatagramSocket;

pub struct Dialer<E: ProtocolEngine, S> {
    mux: Mux<E, S>,
    config: DialerConfig,
    server: SocketAddr,
    key: ConnectionKey,
    connect_deadline: Option<Instant>,
    established: bool,
    scratch: Vec<u8>,
}

impl<E: ProtocolEngine, S: DatagramSocket> Dialer<E, S> {
    /// Opens a connection towards `server`, spawns its newb and sends the
    /// first flight. Returns without waiting for the handshake.
    pub fn connect(
        config: DialerConfig,
        mut engine: E,
        socket: S,
        server: SocketAddr,
        spawner: &mut dyn Spawner<E>,
        reactor: &mut dyn Reactor,
    ) -> Result<Self> {
        config.validate()?;
        let offered = CidPlaintext::new(0, config.thread_id, config.node_id);
        let conn = engine.connect(server, offered)?;
        let cid = engine.local_cid(&conn);

        let mut mux = Mux::new(engine, socket, Token::Dialer);
        let key = mux.connections.vacant_key();
        let mut transport =
            TransportPolicy::new(Token::Connection(key), conn, server, config.receive_policy);
        transport.prepare_next_read();
        let newb = spawner.create_newb(transport)?;
        let handle = newb.upgrade().ok_or(NewbError::HandlerGone)?;
        mux.connections.insert(cid.clone(), newb);

        let deadline = Instant::now() + config.connect_timeout();
        reactor.set_timeout(Token::Dialer, Some(deadline));
        tracing::debug!(server = %server, cid = %cid, "connecting");

        let mut dialer = Self {
            mux,
            scratch: vec![0; config.recv_buffer_size],
            config,
            server,
            key,
            connect_deadline: Some(deadline),
            established: false,
        };

        let started = {
            let mut newb = handle.lock();
            let mut io = IoContext::new(&mut dialer.mux.engine, &mut *reactor);
            newb.start(&mut io)
        };
        if let Err(e) = started {
            dialer.fail(reactor, &handle, e);
            return Ok(dialer);
        }
        dialer.mux.flush_connection(reactor, key);
        Ok(dialer)
    }

    pub fn server(&self) -> SocketAddr {
        self.server
    }

    pub fn config(&self) -> &DialerConfig {
        &self.config
    }

    pub fn socket(&self) -> &S {
        &self.mux.socket
    }

    pub fn engine(&self) -> &E {
        &self.mux.engine
    }

    pub fn is_established(&self) -> bool {
        self.established && self.is_open()
    }

    /// False once the connection was torn down.
    pub fn is_open(&self) -> bool {
        self.mux.connections.contains(self.key)
    }

    pub fn connection_key(&self) -> ConnectionKey {
        self.key
    }

    /// The newb of the connection while it is alive.
    pub fn handle(&self) -> Option<NewbHandle<E>> {
        self.mux.connections.get(self.key)?.upgrade()
    }

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

        let mut offset = 0;
        while offset < datagram.len() {
            let packet = match self.mux.engine.decode(&datagram.slice(offset..)) {
                Ok(packet) => packet,
                Err(e) => {
                    tracing::debug!(peer = %peer, offset, error = %e, "dropping rest of datagram");
                    break;
                }
            };
            if packet.is_empty() {
                break;
            }
            offset += packet.len();
            match self.mux.find(reactor, peer, &packet) {
                Some((key, handle)) => self.mux.dispatch(reactor, key, &handle, peer, &packet),
                None => {
                    tracing::debug!(
                        peer = %peer,
                        dcid = %packet.dcid,
                        "dropping packet for unknown connection"
                    );
                }
            }
        }

        self.check_established(reactor);
        self.mux.flush_all(reactor);
        Ok(())
    }

    pub fn write_event(&mut self, reactor: &mut dyn Reactor) -> Result<()> {
        self.mux.write_event(reactor);
        Ok(())
    }

    /// Fires the connect deadline and expired engine timers.
    pub fn timeout(&mut self, reactor: &mut dyn Reactor, now: Instant) -> Result<()> {
        if let Some(deadline) = self.connect_deadline {
            if now >= deadline {
                self.connect_deadline = None;
                reactor.set_timeout(Token::Dialer, None);
                if let Some(handle) = self.mux.handle(reactor, self.key) {
                    tracing::warn!(server = %self.server, "connect deadline expired");
                    self.fail(reactor, &handle, NewbError::ConnectTimeout);
                }
            }
        }
        self.mux.timeout(reactor, now);
        Ok(())
    }

    /// Closes the connection locally.
    pub fn close(&mut self, reactor: &mut dyn Reactor, error_code: u64) {
        self.connect_deadline = None;
        reactor.set_timeout(Token::Dialer, None);
        self.mux.close_all(reactor, error_code);
    }

    fn check_established(&mut self, reactor: &mut dyn Reactor) {
        if self.established {
            return;
        }
        let Some(handle) = self.handle() else {
            return;
        };
        let established = {
            let newb = handle.lock();
            self.mux.engine.is_established(newb.transport().connection())
        };
        if established {
            self.established = true;
            self.connect_deadline = None;
            reactor.set_timeout(Token::Dialer, None);
            tracing::info!(server = %self.server, "connection established");
        }
    }

    fn fail(&mut self, reactor: &mut dyn Reactor, handle: &NewbHandle<E>, err: NewbError) {
        self.mux
            .teardown(reactor, self.key, handle, Teardown::Failure(err));
    }
}
