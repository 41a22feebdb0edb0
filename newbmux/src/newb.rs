//! Handler entities ("newbs") and the runtime boundary.
//!
//! Endpoints hold each newb only through a [`NewbRef`]. Whoever spawned it
//! keeps the strong [`NewbHandle`] and decides when it goes away.

use std::sync::{Arc, Weak};

use bytes::BytesMut;
use parking_lot::Mutex;

use crate::engine::{ProtocolEngine, StreamId};
use crate::error::{NewbError, Result};
use crate::policy::{ReceivePolicy, RwState, TransportPolicy};
use crate::reactor::Reactor;

/// Strong handle kept by the runtime.
pub type NewbHandle<E> = Arc<Mutex<dyn Newb<E>>>;
/// Weak reference kept by endpoints; lookup only.
pub type NewbRef<E> = Weak<Mutex<dyn Newb<E>>>;

/// What a handler may touch while reacting to an event.
pub struct IoContext<'a, E: ProtocolEngine> {
    pub engine: &'a mut E,
    pub reactor: &'a mut dyn Reactor,
}

impl<'a, E: ProtocolEngine> IoContext<'a, E> {
    pub fn new(engine: &'a mut E, reactor: &'a mut dyn Reactor) -> Self {
        Self { engine, reactor }
    }
}

/// The handler entity of one connection.
pub trait Newb<E: ProtocolEngine>: Send {
    /// Called once, right after the connection was registered.
    fn start(&mut self, io: &mut IoContext<'_, E>) -> Result<()>;

    fn stop_reading(&mut self, io: &mut IoContext<'_, E>);

    fn stop_writing(&mut self, io: &mut IoContext<'_, E>);

    /// New bytes reached the transport policy.
    fn read_event(&mut self, io: &mut IoContext<'_, E>) -> Result<()>;

    /// The shared socket is writable.
    fn write_event(&mut self, io: &mut IoContext<'_, E>) -> Result<()>;

    /// The connection is gone; the newb may wrap up but gets no more events.
    fn graceful_shutdown(&mut self, io: &mut IoContext<'_, E>);

    fn io_error(&mut self, err: &NewbError);

    fn stream_reset(&mut self, stream: StreamId, error_code: u64);

    fn transport(&self) -> &TransportPolicy<E>;

    fn transport_mut(&mut self) -> &mut TransportPolicy<E>;

    /// True after `graceful_shutdown`.
    fn is_shut_down(&self) -> bool;
}

/// Creates the newb for a freshly accepted or dialed connection.
pub trait Spawner<E: ProtocolEngine> {
    fn create_newb(&mut self, transport: TransportPolicy<E>) -> Result<NewbRef<E>>;
}

/// Spawner that keeps every newb it creates alive.
pub struct NewbPool<E: ProtocolEngine, F> {
    factory: F,
    handles: Vec<NewbHandle<E>>,
}

impl<E, F> NewbPool<E, F>
where
    E: ProtocolEngine,
    F: FnMut(TransportPolicy<E>) -> Result<NewbHandle<E>>,
{
    pub fn new(factory: F) -> Self {
        Self {
            factory,
            handles: Vec::new(),
        }
    }

    pub fn handles(&self) -> &[NewbHandle<E>] {
        &self.handles
    }

    /// Drops the handles of newbs that finished shutting down.
    pub fn reap(&mut self) -> usize {
        let before = self.handles.len();
        self.handles.retain(|h| !h.lock().is_shut_down());
        before - self.handles.len()
    }
}

impl<E, F> Spawner<E> for NewbPool<E, F>
where
    E: ProtocolEngine,
    F: FnMut(TransportPolicy<E>) -> Result<NewbHandle<E>>,
{
    fn create_newb(&mut self, transport: TransportPolicy<E>) -> Result<NewbRef<E>> {
        let handle = (self.factory)(transport)?;
        let weak = Arc::downgrade(&handle);
        self.handles.push(handle);
        Ok(weak)
    }
}

/// Shared pools are spawners too, so the runtime can keep a clone.
impl<E, S> Spawner<E> for Arc<Mutex<S>>
where
    E: ProtocolEngine,
    S: Spawner<E>,
{
    fn create_newb(&mut self, transport: TransportPolicy<E>) -> Result<NewbRef<E>> {
        self.lock().create_newb(transport)
    }
}

/// Requests a protocol can make while handling an event.
pub struct Outbox<'a> {
    writes: &'a mut BytesMut,
    read_policy: &'a mut Option<ReceivePolicy>,
    close: &'a mut Option<u64>,
}

impl<'a> Outbox<'a> {
    pub(crate) fn new(
        writes: &'a mut BytesMut,
        read_policy: &'a mut Option<ReceivePolicy>,
        close: &'a mut Option<u64>,
    ) -> Self {
        Self {
            writes,
            read_policy,
            close,
        }
    }

    pub fn write(&mut self, data: &[u8]) {
        self.writes.extend_from_slice(data);
    }

    /// Applies from the next message on.
    pub fn configure_read(&mut self, policy: ReceivePolicy) {
        *self.read_policy = Some(policy);
    }

    /// Closes the connection once queued output went out.
    pub fn close(&mut self, error_code: u64) {
        *self.close = Some(error_code);
    }
}

/// Application logic plugged into a [`BasicNewb`].
pub trait Protocol: Send + 'static {
    fn on_start(&mut self, _out: &mut Outbox<'_>) {}

    /// One message, sized by the active receive policy.
    fn on_message(&mut self, data: &[u8], out: &mut Outbox<'_>);

    fn on_stream_reset(&mut self, _stream: StreamId, _error_code: u64) {}

    fn on_io_error(&mut self, _err: &NewbError) {}

    fn on_shutdown(&mut self) {}
}

/// Generic newb driving a [`Protocol`] over a [`TransportPolicy`].
pub struct BasicNewb<E: ProtocolEngine, P> {
    transport: TransportPolicy<E>,
    protocol: P,
    reading: bool,
    shut_down: bool,
}

impl<E: ProtocolEngine, P: Protocol> BasicNewb<E, P> {
    pub fn new(transport: TransportPolicy<E>, protocol: P) -> Self {
        Self {
            transport,
            protocol,
            reading: true,
            shut_down: false,
        }
    }

    /// Boxes a new newb into a runtime handle.
    pub fn spawn(transport: TransportPolicy<E>, protocol: P) -> NewbHandle<E> {
        Arc::new(Mutex::new(Self::new(transport, protocol)))
    }

    pub fn protocol(&self) -> &P {
        &self.protocol
    }

    pub fn protocol_mut(&mut self) -> &mut P {
        &mut self.protocol
    }
}

impl<E: ProtocolEngine, P: Protocol> Newb<E> for BasicNewb<E, P> {
    fn start(&mut self, io: &mut IoContext<'_, E>) -> Result<()> {
        let protocol = &mut self.protocol;
        protocol.on_start(&mut self.transport.outbox());
        self.transport.flush(io.reactor);
        Ok(())
    }

    fn stop_reading(&mut self, _io: &mut IoContext<'_, E>) {
        self.reading = false;
    }

    fn stop_writing(&mut self, io: &mut IoContext<'_, E>) {
        self.transport.stop_writing(io.reactor);
    }

    fn read_event(&mut self, io: &mut IoContext<'_, E>) -> Result<()> {
        if !self.reading || self.shut_down {
            return Ok(());
        }
        while self.transport.read_some()? == RwState::Success {
            if self.transport.should_deliver() {
                let protocol = &mut self.protocol;
                self.transport
                    .deliver(|data, out| protocol.on_message(data, out));
                self.transport.prepare_next_read();
                self.transport.flush(io.reactor);
            }
        }
        Ok(())
    }

    fn write_event(&mut self, io: &mut IoContext<'_, E>) -> Result<()> {
        while self.transport.is_writing() {
            if self.transport.write_some(io)? == RwState::Indeterminate {
                break;
            }
        }
        Ok(())
    }

    fn graceful_shutdown(&mut self, io: &mut IoContext<'_, E>) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        self.reading = false;
        self.transport.discard_pending_writes(io.reactor);
        self.protocol.on_shutdown();
    }

    fn io_error(&mut self, err: &NewbError) {
        self.protocol.on_io_error(err);
    }

    fn stream_reset(&mut self, stream: StreamId, error_code: u64) {
        self.protocol.on_stream_reset(stream, error_code);
    }

    fn transport(&self) -> &TransportPolicy<E> {
        &self.transport
    }

    fn transport_mut(&mut self) -> &mut TransportPolicy<E> {
        &mut self.transport
    }

    fn is_shut_down(&self) -> bool {
        self.shut_down
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::StreamEvents;
    use crate::error::Operation;
    use crate::reactor::{InterestSet, Token};
    use crate::testing::{NullConnection, NullEngine};

    #[derive(Default)]
    struct Echo {
        messages: Vec<Vec<u8>>,
        shutdowns: usize,
    }

    impl Protocol for Echo {
        fn on_message(&mut self, data: &[u8], out: &mut Outbox<'_>) {
            self.messages.push(data.to_vec());
            out.write(data);
        }

        fn on_shutdown(&mut self) {
            self.shutdowns += 1;
        }
    }

    fn newb(policy: ReceivePolicy) -> BasicNewb<NullEngine, Echo> {
        let mut t = TransportPolicy::new(
            Token::Dialer,
            NullConnection::default(),
            "127.0.0.1:1".parse().unwrap(),
            policy,
        );
        t.prepare_next_read();
        BasicNewb::new(t, Echo::default())
    }

    fn feed(n: &mut BasicNewb<NullEngine, Echo>, data: &[u8], fin: bool) {
        let (_, mut bridge) = n.transport_mut().split_for_dispatch();
        bridge.on_stream_open(0).unwrap();
        bridge.push(0, data, fin);
    }

    #[test]
    fn delivers_one_message_per_threshold() {
        let mut n = newb(ReceivePolicy::exactly(4));
        let mut engine = NullEngine::default();
        let mut reactor = InterestSet::new();
        feed(&mut n, &[1, 0, 0, 0, 2, 0, 0, 0, 3], false);

        n.read_event(&mut IoContext::new(&mut engine, &mut reactor))
            .unwrap();
        assert_eq!(
            n.protocol().messages,
            vec![vec![1, 0, 0, 0], vec![2, 0, 0, 0]]
        );
        assert_eq!(n.transport().collected(), 1);
        assert!(reactor.is_registered(Token::Dialer, Operation::Write));

        n.write_event(&mut IoContext::new(&mut engine, &mut reactor))
            .unwrap();
        assert_eq!(engine.sent, vec![1, 0, 0, 0, 2, 0, 0, 0]);
        assert!(!reactor.wants_write());
    }

    #[test]
    fn stop_reading_holds_ingress() {
        let mut n = newb(ReceivePolicy::at_most(8));
        let mut engine = NullEngine::default();
        let mut reactor = InterestSet::new();
        n.stop_reading(&mut IoContext::new(&mut engine, &mut reactor));
        feed(&mut n, b"abc", false);
        n.read_event(&mut IoContext::new(&mut engine, &mut reactor))
            .unwrap();
        assert!(n.protocol().messages.is_empty());
        assert_eq!(n.transport().pending_ingress(), 3);
    }

    #[test]
    fn peer_fin_surfaces_as_read_failure() {
        let mut n = newb(ReceivePolicy::at_most(8));
        let mut engine = NullEngine::default();
        let mut reactor = InterestSet::new();
        feed(&mut n, b"z", true);
        let err = n
            .read_event(&mut IoContext::new(&mut engine, &mut reactor))
            .unwrap_err();
        assert!(matches!(err, NewbError::ReadFailure(_)));
        assert_eq!(n.protocol().messages, vec![b"z".to_vec()]);
    }

    #[test]
    fn shutdown_runs_once() {
        let mut n = newb(ReceivePolicy::at_most(8));
        let mut engine = NullEngine::default();
        let mut reactor = InterestSet::new();
        n.graceful_shutdown(&mut IoContext::new(&mut engine, &mut reactor));
        n.graceful_shutdown(&mut IoContext::new(&mut engine, &mut reactor));
        assert_eq!(n.protocol().shutdowns, 1);
        assert!(n.is_shut_down());
    }

    #[test]
    fn pool_keeps_handles_until_reaped() {
        let mut pool = NewbPool::new(|t: TransportPolicy<NullEngine>| {
            Ok(BasicNewb::spawn(t, Echo::default()))
        });
        let t = TransportPolicy::new(
            Token::Dialer,
            NullConnection::default(),
            "127.0.0.1:1".parse().unwrap(),
            ReceivePolicy::default(),
        );
        let weak = pool.create_newb(t).unwrap();
        assert!(weak.upgrade().is_some());
        assert_eq!(pool.reap(), 0);

        let mut engine = NullEngine::default();
        let mut reactor = InterestSet::new();
        if let Some(h) = weak.upgrade() {
            h.lock()
                .graceful_shutdown(&mut IoContext::new(&mut engine, &mut reactor));
        }
        assert_eq!(pool.reap(), 1);
        assert!(weak.upgrade().is_none());
    }
}
