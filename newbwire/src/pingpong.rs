//! Counter ping-pong used by the demo binary and the end-to-end tests.
//!
//! The client sends `1`; the server echoes every counter; the client answers
//! each echo with the next counter until it has seen `messages` echoes, then
//! sends [`QUIT`] and closes. Counters are 4-byte little-endian integers, so
//! both sides read with `ReceivePolicy::exactly(4)`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use newbmux::{NewbError, Outbox, Protocol, ReceivePolicy, StreamId};
use parking_lot::Mutex;
use tokio::sync::Notify;

/// Counter value that ends the exchange.
pub const QUIT: u32 = u32::MAX;
pub const COUNTER_LEN: usize = 4;

/// Receive policy both sides run with.
pub fn counter_policy() -> ReceivePolicy {
    ReceivePolicy::exactly(COUNTER_LEN)
}

fn read_counter(data: &[u8]) -> Option<u32> {
    <[u8; COUNTER_LEN]>::try_from(data)
        .ok()
        .map(u32::from_le_bytes)
}

/// What the client saw so far.
#[derive(Debug, Default, Clone)]
pub struct Progress {
    pub received: u32,
    pub last_counter: u32,
    /// Time from start to the last echo, once the exchange completed.
    pub elapsed: Option<Duration>,
    pub error: Option<String>,
    pub shut_down: bool,
}

/// Shared between a [`PingClient`] and whoever waits for it.
#[derive(Debug, Default)]
pub struct PingMonitor {
    progress: Mutex<Progress>,
    done: Notify,
}

impl PingMonitor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn progress(&self) -> Progress {
        self.progress.lock().clone()
    }

    /// Resolves once the client's connection was torn down, which follows
    /// the close the client requests after its last echo.
    pub async fn finished(&self) {
        self.done.notified().await;
    }
}

pub struct PingClient {
    messages: u32,
    started: Option<Instant>,
    monitor: Arc<PingMonitor>,
}

impl PingClient {
    pub fn new(messages: u32, monitor: Arc<PingMonitor>) -> Self {
        Self {
            messages: messages.max(1),
            started: None,
            monitor,
        }
    }
}

impl Protocol for PingClient {
    fn on_start(&mut self, out: &mut Outbox<'_>) {
        self.started = Some(Instant::now());
        out.write(&1u32.to_le_bytes());
    }

    fn on_message(&mut self, data: &[u8], out: &mut Outbox<'_>) {
        let Some(counter) = read_counter(data) else {
            tracing::warn!(len = data.len(), "ignoring malformed counter");
            return;
        };
        let received = {
            let mut progress = self.monitor.progress.lock();
            progress.received += 1;
            progress.last_counter = counter;
            progress.received
        };
        if received % 100 == 0 {
            tracing::debug!(received, "ping progress");
        }
        if received >= self.messages {
            out.write(&QUIT.to_le_bytes());
            out.close(0);
            self.monitor.progress.lock().elapsed = self.started.map(|t| t.elapsed());
        } else {
            out.write(&counter.wrapping_add(1).to_le_bytes());
        }
    }

    fn on_io_error(&mut self, err: &NewbError) {
        self.monitor.progress.lock().error = Some(err.to_string());
    }

    fn on_shutdown(&mut self) {
        self.monitor.progress.lock().shut_down = true;
        self.monitor.done.notify_one();
    }
}

/// Echoes counters until it sees [`QUIT`].
#[derive(Debug, Default)]
pub struct PingServer {
    echoed: u64,
}

impl PingServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn echoed(&self) -> u64 {
        self.echoed
    }
}

impl Protocol for PingServer {
    fn on_message(&mut self, data: &[u8], out: &mut Outbox<'_>) {
        match read_counter(data) {
            Some(QUIT) => {
                tracing::debug!(echoed = self.echoed, "client finished");
                out.close(0);
            }
            Some(_) => {
                self.echoed += 1;
                out.write(data);
            }
            None => tracing::warn!(len = data.len(), "ignoring malformed counter"),
        }
    }

    fn on_stream_reset(&mut self, stream: StreamId, error_code: u64) {
        tracing::debug!(stream, error_code, "stream reset by client");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    use newbmux::{CidPlaintext, ConnectionKey, ProtocolEngine, Token, TransportPolicy};

    use crate::engine::PlainEngine;

    fn transport() -> TransportPolicy<PlainEngine> {
        let peer = SocketAddr::from(([127, 0, 0, 1], 4433));
        let conn = PlainEngine::new()
            .connect(peer, CidPlaintext::new(0, 1, 0))
            .unwrap();
        TransportPolicy::new(
            Token::Connection(ConnectionKey::default()),
            conn,
            peer,
            counter_policy(),
        )
    }

    #[test]
    fn client_counts_up_then_quits() {
        let monitor = PingMonitor::new();
        let mut client = PingClient::new(2, monitor.clone());
        let mut t = transport();

        client.on_start(&mut t.outbox());
        assert_eq!(t.pending_output(), 4);

        client.on_message(&1u32.to_le_bytes(), &mut t.outbox());
        assert_eq!(t.pending_output(), 8);
        assert_eq!(monitor.progress().received, 1);
        assert!(monitor.progress().elapsed.is_none());

        client.on_message(&2u32.to_le_bytes(), &mut t.outbox());
        assert_eq!(t.pending_output(), 12);
        assert_eq!(t.take_close_request(), Some(0));
        let progress = monitor.progress();
        assert_eq!(progress.received, 2);
        assert_eq!(progress.last_counter, 2);
        assert!(progress.elapsed.is_some());
    }

    #[test]
    fn server_echoes_and_stops_on_quit() {
        let mut server = PingServer::new();
        let mut t = transport();

        server.on_message(&7u32.to_le_bytes(), &mut t.outbox());
        assert_eq!(t.pending_output(), 4);
        assert_eq!(server.echoed(), 1);

        server.on_message(&QUIT.to_le_bytes(), &mut t.outbox());
        assert_eq!(t.pending_output(), 4);
        assert_eq!(t.take_close_request(), Some(0));
    }

    #[test]
    fn malformed_counters_are_ignored() {
        let mut server = PingServer::new();
        let mut t = transport();
        server.on_message(&[1, 2], &mut t.outbox());
        assert_eq!(t.pending_output(), 0);
        assert_eq!(server.echoed(), 0);
    }

    #[tokio::test]
    async fn monitor_wakes_on_shutdown() {
        let monitor = PingMonitor::new();
        let mut client = PingClient::new(5, monitor.clone());
        client.on_shutdown();
        tokio::time::timeout(Duration::from_secs(1), monitor.finished())
            .await
            .unwrap();
        assert!(monitor.progress().shut_down);
    }
}
