//! In-memory server and clients wired to one [`MemoryNetwork`].

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;

use newbmux::{
    Acceptor, AcceptorConfig, BasicNewb, Dialer, DialerConfig, InterestSet, KeyMaterial,
    MemoryNetwork, MemorySocket, NewbHandle, NewbPool, Protocol, TransportPolicy,
};
use newbwire::pingpong::{counter_policy, PingClient, PingMonitor, PingServer};
use newbwire::PlainEngine;

pub type Factory = Box<
    dyn FnMut(TransportPolicy<PlainEngine>) -> newbmux::Result<NewbHandle<PlainEngine>> + Send,
>;

pub fn server_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 4433))
}

pub fn client_addr(n: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 50000 + n))
}

pub fn keys() -> KeyMaterial {
    KeyMaterial::from_pem(&b"test certificate"[..], &b"test private key"[..])
}

pub fn factory<P, F>(mut make: F) -> Factory
where
    P: Protocol,
    F: FnMut() -> P + Send + 'static,
{
    Box::new(move |transport| Ok(BasicNewb::spawn(transport, make())))
}

pub fn ping_config() -> AcceptorConfig {
    AcceptorConfig {
        receive_policy: counter_policy(),
        ..AcceptorConfig::default()
    }
}

pub struct Server {
    pub acceptor: Acceptor<PlainEngine, MemorySocket>,
    pub reactor: InterestSet,
    pub pool: Arc<Mutex<NewbPool<PlainEngine, Factory>>>,
}

impl Server {
    pub fn start(
        net: &MemoryNetwork,
        config: AcceptorConfig,
        engine: PlainEngine,
        factory: Factory,
    ) -> Self {
        let pool = Arc::new(Mutex::new(NewbPool::new(factory)));
        let acceptor =
            Acceptor::with_socket(config, engine, &keys(), net.bind(server_addr()), pool.clone())
                .unwrap();
        Self {
            acceptor,
            reactor: InterestSet::new(),
            pool,
        }
    }

    pub fn ping(net: &MemoryNetwork, config: AcceptorConfig) -> Self {
        Self::start(net, config, PlainEngine::new(), factory(PingServer::new))
    }

    /// Handles everything waiting at the server. True if anything happened.
    pub fn pump(&mut self, net: &MemoryNetwork) -> bool {
        let mut moved = false;
        while net.pending(server_addr()) > 0 {
            self.acceptor.read_event(&mut self.reactor).unwrap();
            moved = true;
        }
        if self.reactor.wants_write() {
            self.acceptor.write_event(&mut self.reactor).unwrap();
            moved = true;
        }
        moved
    }
}

pub struct Client {
    pub dialer: Dialer<PlainEngine, MemorySocket>,
    pub reactor: InterestSet,
    pub pool: NewbPool<PlainEngine, Factory>,
    addr: SocketAddr,
}

impl Client {
    pub fn connect(
        net: &MemoryNetwork,
        addr: SocketAddr,
        config: DialerConfig,
        engine: PlainEngine,
        factory: Factory,
    ) -> Self {
        let mut pool = NewbPool::new(factory);
        let mut reactor = InterestSet::new();
        let dialer = Dialer::connect(
            config,
            engine,
            net.bind(addr),
            server_addr(),
            &mut pool,
            &mut reactor,
        )
        .unwrap();
        Self {
            dialer,
            reactor,
            pool,
            addr,
        }
    }

    pub fn ping(
        net: &MemoryNetwork,
        addr: SocketAddr,
        engine: PlainEngine,
        messages: u32,
    ) -> (Self, Arc<PingMonitor>) {
        let monitor = PingMonitor::new();
        let shared = monitor.clone();
        let config = DialerConfig {
            receive_policy: counter_policy(),
            ..DialerConfig::default()
        };
        let client = Self::connect(
            net,
            addr,
            config,
            engine,
            factory(move || PingClient::new(messages, shared.clone())),
        );
        (client, monitor)
    }

    pub fn pump(&mut self, net: &MemoryNetwork) -> bool {
        let mut moved = false;
        while net.pending(self.addr) > 0 {
            self.dialer.read_event(&mut self.reactor).unwrap();
            moved = true;
        }
        if self.reactor.wants_write() {
            self.dialer.write_event(&mut self.reactor).unwrap();
            moved = true;
        }
        moved
    }
}

/// Pumps every endpoint until the network is quiet.
pub fn settle(net: &MemoryNetwork, server: &mut Server, clients: &mut [Client]) {
    for _ in 0..100_000 {
        let mut moved = server.pump(net);
        for client in clients.iter_mut() {
            moved |= client.pump(net);
        }
        if !moved {
            return;
        }
    }
    panic!("network did not settle");
}
