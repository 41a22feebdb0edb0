//! Tokio readiness loop for an endpoint.

use std::future::Future;
use std::time::{Duration, Instant};

use crate::acceptor::Acceptor;
use crate::dialer::Dialer;
use crate::engine::ProtocolEngine;
use crate::error::Result;
use crate::reactor::{InterestSet, Reactor};
use crate::socket::DatagramSocket;

/// Anything the driver can feed readiness events into.
pub trait Endpoint {
    type Socket: DatagramSocket;

    fn read_event(&mut self, reactor: &mut dyn Reactor) -> Result<()>;

    fn write_event(&mut self, reactor: &mut dyn Reactor) -> Result<()>;

    fn timeout(&mut self, reactor: &mut dyn Reactor, now: Instant) -> Result<()>;

    fn socket(&self) -> &Self::Socket;
}

impl<E: ProtocolEngine, S: DatagramSocket> Endpoint for Acceptor<E, S> {
    type Socket = S;

    fn read_event(&mut self, reactor: &mut dyn Reactor) -> Result<()> {
        Acceptor::read_event(self, reactor)
    }

    fn write_event(&mut self, reactor: &mut dyn Reactor) -> Result<()> {
        Acceptor::write_event(self, reactor)
    }

    fn timeout(&mut self, reactor: &mut dyn Reactor, now: Instant) -> Result<()> {
        Acceptor::timeout(self, reactor, now)
    }

    fn socket(&self) -> &S {
        Acceptor::socket(self)
    }
}

impl<E: ProtocolEngine, S: DatagramSocket> Endpoint for Dialer<E, S> {
    type Socket = S;

    fn read_event(&mut self, reactor: &mut dyn Reactor) -> Result<()> {
        Dialer::read_event(self, reactor)
    }

    fn write_event(&mut self, reactor: &mut dyn Reactor) -> Result<()> {
        Dialer::write_event(self, reactor)
    }

    fn timeout(&mut self, reactor: &mut dyn Reactor, now: Instant) -> Result<()> {
        Dialer::timeout(self, reactor, now)
    }

    fn socket(&self) -> &S {
        Dialer::socket(self)
    }
}

/// Far-off placeholder for the timer branch while no deadline is armed.
const IDLE_WAKEUP: Duration = Duration::from_secs(3600);

enum Event {
    Readable,
    Writable,
    Timer,
    Stop,
}

/// Runs an endpoint on a tokio UDP socket.
pub struct Driver<T> {
    endpoint: T,
    interest: InterestSet,
}

impl<T> Driver<T>
where
    T: Endpoint<Socket = tokio::net::UdpSocket>,
{
    pub fn new(endpoint: T) -> Self {
        Self::with_interest(endpoint, InterestSet::new())
    }

    /// Starts from interests the endpoint registered during setup, such as
    /// the dialer's connect deadline.
    pub fn with_interest(endpoint: T, interest: InterestSet) -> Self {
        Self { endpoint, interest }
    }

    pub fn endpoint(&self) -> &T {
        &self.endpoint
    }

    pub fn endpoint_mut(&mut self) -> &mut T {
        &mut self.endpoint
    }

    pub fn interest(&self) -> &InterestSet {
        &self.interest
    }

    /// Gives back the endpoint and the reactor state.
    pub fn into_parts(self) -> (T, InterestSet) {
        (self.endpoint, self.interest)
    }

    /// Dispatches readiness events until `stop` resolves.
    pub async fn run_until<F: Future>(&mut self, stop: F) -> Result<()> {
        tokio::pin!(stop);
        loop {
            let deadline = self.interest.next_deadline();
            let wants_write = self.interest.wants_write();
            let wake_at = deadline.unwrap_or_else(|| Instant::now() + IDLE_WAKEUP);

            let event = {
                let socket = self.endpoint.socket();
                tokio::select! {
                    biased;
                    _ = &mut stop => Event::Stop,
                    ready = socket.writable(), if wants_write => {
                        ready?;
                        Event::Writable
                    }
                    ready = socket.readable() => {
                        ready?;
                        Event::Readable
                    }
                    _ = tokio::time::sleep_until(wake_at.into()), if deadline.is_some() => {
                        Event::Timer
                    }
                }
            };

            match event {
                Event::Stop => return Ok(()),
                Event::Readable => self.endpoint.read_event(&mut self.interest)?,
                Event::Writable => self.endpoint.write_event(&mut self.interest)?,
                Event::Timer => self
                    .endpoint
                    .timeout(&mut self.interest, Instant::now())?,
            }
        }
    }
}
