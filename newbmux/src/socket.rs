//! UDP socket setup and the datagram socket abstraction.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};

use crate::engine::Transmit;
use crate::error::{NewbError, Operation, Result};
use crate::reactor::{Reactor, Token};

/// Creates a non-blocking UDP socket bound to `host:port` with `SO_REUSEADDR`.
///
/// Every failure, from name resolution to bind, is reported as
/// [`NewbError::Bind`].
pub fn create_socket(port: u16, host: &str) -> Result<UdpSocket> {
    let display = format!("{host}:{port}");
    let bind_err = |source: io::Error| NewbError::Bind {
        addr: display.clone(),
        source,
    };

    let addr = (host, port)
        .to_socket_addrs()
        .map_err(&bind_err)?
        .next()
        .ok_or_else(|| {
            bind_err(io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                "host resolved to no addresses",
            ))
        })?;

    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))
        .map_err(&bind_err)?;
    socket.set_reuse_address(true).map_err(&bind_err)?;
    if let Err(e) = socket.bind(&addr.into()) {
        tracing::error!(addr = %addr, error = %e, "could not bind UDP socket");
        return Err(bind_err(e));
    }
    socket.set_nonblocking(true).map_err(&bind_err)?;

    let socket: UdpSocket = socket.into();
    tracing::debug!(addr = %addr, "UDP socket bound");
    Ok(socket)
}

/// Non-blocking datagram I/O as the endpoints use it.
///
/// Both calls fail with `WouldBlock` instead of waiting.
pub trait DatagramSocket {
    fn try_recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;

    fn try_send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize>;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

impl DatagramSocket for UdpSocket {
    fn try_recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.recv_from(buf)
    }

    fn try_send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        self.send_to(buf, target)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        UdpSocket::local_addr(self)
    }
}

impl DatagramSocket for tokio::net::UdpSocket {
    fn try_recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        tokio::net::UdpSocket::try_recv_from(self, buf)
    }

    fn try_send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        tokio::net::UdpSocket::try_send_to(self, buf, target)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        tokio::net::UdpSocket::local_addr(self)
    }
}

type Queue = VecDeque<(SocketAddr, Bytes)>;

/// In-process datagram network for deterministic tests.
///
/// Datagrams sent to an address nobody bound are dropped, as UDP would.
#[derive(Debug, Clone, Default)]
pub struct MemoryNetwork {
    queues: Arc<Mutex<HashMap<SocketAddr, Queue>>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(&self, addr: SocketAddr) -> MemorySocket {
        self.queues.lock().entry(addr).or_default();
        MemorySocket {
            addr,
            network: self.clone(),
            send_blocked: Arc::new(Mutex::new(false)),
        }
    }

    /// Injects a datagram as if `from` had sent it.
    pub fn inject(&self, from: SocketAddr, to: SocketAddr, payload: impl Into<Bytes>) {
        if let Some(queue) = self.queues.lock().get_mut(&to) {
            queue.push_back((from, payload.into()));
        }
    }

    /// Datagrams waiting at `addr`.
    pub fn pending(&self, addr: SocketAddr) -> usize {
        self.queues.lock().get(&addr).map_or(0, VecDeque::len)
    }

    /// Removes and returns everything waiting at `addr`.
    pub fn drain(&self, addr: SocketAddr) -> Vec<(SocketAddr, Bytes)> {
        self.queues
            .lock()
            .get_mut(&addr)
            .map(|q| q.drain(..).collect())
            .unwrap_or_default()
    }
}

/// One bound address on a [`MemoryNetwork`].
#[derive(Debug, Clone)]
pub struct MemorySocket {
    addr: SocketAddr,
    network: MemoryNetwork,
    send_blocked: Arc<Mutex<bool>>,
}

impl MemorySocket {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn pending(&self) -> usize {
        self.network.pending(self.addr)
    }

    /// While set, sends fail with `WouldBlock`.
    pub fn set_send_blocked(&self, blocked: bool) {
        *self.send_blocked.lock() = blocked;
    }
}

impl DatagramSocket for MemorySocket {
    fn try_recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        let mut queues = self.network.queues.lock();
        let (from, payload) = queues
            .get_mut(&self.addr)
            .and_then(VecDeque::pop_front)
            .ok_or_else(|| io::Error::from(io::ErrorKind::WouldBlock))?;
        // Oversized datagrams are truncated, as recvfrom would.
        let n = payload.len().min(buf.len());
        buf[..n].copy_from_slice(&payload[..n]);
        Ok((n, from))
    }

    fn try_send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        if *self.send_blocked.lock() {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        self.network.inject(self.addr, target, Bytes::copy_from_slice(buf));
        Ok(buf.len())
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.addr)
    }
}

/// Most datagrams an [`Egress`] holds; past it the oldest are dropped.
pub const MAX_EGRESS_BACKLOG: usize = 1024;

/// Datagrams the socket refused with `WouldBlock`.
///
/// While the backlog is non-empty the owning endpoint's token holds write
/// interest; new datagrams queue behind it to keep their order. At most
/// [`MAX_EGRESS_BACKLOG`] are held.
#[derive(Debug, Default)]
pub struct Egress {
    backlog: VecDeque<Transmit>,
}

impl Egress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn send<S: DatagramSocket>(
        &mut self,
        socket: &S,
        transmit: Transmit,
        reactor: &mut dyn Reactor,
        token: Token,
    ) {
        if !self.backlog.is_empty() {
            self.enqueue(transmit);
            return;
        }
        match socket.try_send_to(&transmit.payload, transmit.destination) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.enqueue(transmit);
                reactor.register(token, Operation::Write);
            }
            Err(e) => {
                tracing::warn!(
                    peer = %transmit.destination,
                    len = transmit.payload.len(),
                    error = %e,
                    "failed to send datagram"
                );
            }
        }
    }

    fn enqueue(&mut self, transmit: Transmit) {
        if self.backlog.len() >= MAX_EGRESS_BACKLOG {
            if let Some(oldest) = self.backlog.pop_front() {
                tracing::debug!(
                    peer = %oldest.destination,
                    len = oldest.payload.len(),
                    "egress backlog full, dropping oldest datagram"
                );
            }
        }
        self.backlog.push_back(transmit);
    }

    /// Sends as much of the backlog as the socket takes. Returns true once it
    /// is empty.
    pub fn drain<S: DatagramSocket>(&mut self, socket: &S) -> bool {
        while let Some(transmit) = self.backlog.front() {
            match socket.try_send_to(&transmit.payload, transmit.destination) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return false,
                Err(e) => {
                    tracing::warn!(
                        peer = %transmit.destination,
                        error = %e,
                        "dropping queued datagram"
                    );
                }
            }
            self.backlog.pop_front();
        }
        true
    }

    pub fn len(&self) -> usize {
        self.backlog.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backlog.is_empty()
    }

    pub fn clear(&mut self) {
        self.backlog.clear();
    }
}
