//! Per-connection transport policy.
//!
//! Owns the engine connection handle together with the read and write
//! buffering state of one connection.
//!
//! Read side: bytes forwarded by the stream bridge land in `ingress`;
//! [`TransportPolicy::read_some`] moves them into the read buffer, whose size
//! and delivery threshold come from the active [`ReceivePolicy`].
//!
//! Write side: application writes append to the offline buffer.
//! [`TransportPolicy::flush`] registers write interest and rotates the
//! offline buffer into the send buffer, and
//! [`TransportPolicy::write_some`] hands send-buffer bytes to the engine.
//! The connection's token holds write interest exactly while `writing` is
//! set.

use std::collections::BTreeSet;
use std::net::SocketAddr;

use bytes::{Buf, BytesMut};
use serde::{Deserialize, Serialize};

use crate::bridge::StreamBridge;
use crate::engine::{ProtocolEngine, StreamId};
use crate::error::{NewbError, Operation, Result};
use crate::newb::{IoContext, Outbox};
use crate::reactor::{Reactor, Token};

/// Minimum slack an `at_least` buffer gets on top of its threshold.
const AT_LEAST_MIN_SLACK: usize = 100;

/// How many bytes make up one delivered message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceivePolicy {
    /// Deliver exactly N bytes at a time.
    Exactly(usize),
    /// Deliver as soon as anything arrived, at most N bytes.
    AtMost(usize),
    /// Deliver once N bytes arrived; the buffer has room to over-read.
    AtLeast(usize),
}

impl ReceivePolicy {
    pub fn exactly(n: usize) -> Self {
        ReceivePolicy::Exactly(n)
    }

    pub fn at_most(n: usize) -> Self {
        ReceivePolicy::AtMost(n)
    }

    pub fn at_least(n: usize) -> Self {
        ReceivePolicy::AtLeast(n)
    }

    /// Read buffer capacity under this policy.
    pub fn target_size(&self) -> usize {
        match *self {
            ReceivePolicy::Exactly(n) | ReceivePolicy::AtMost(n) => n,
            ReceivePolicy::AtLeast(n) => n + AT_LEAST_MIN_SLACK.max(n / 10),
        }
    }

    /// Collected bytes needed before a delivery is signalled.
    pub fn threshold(&self) -> usize {
        match *self {
            ReceivePolicy::Exactly(n) | ReceivePolicy::AtLeast(n) => n,
            ReceivePolicy::AtMost(_) => 1,
        }
    }

    pub fn validate(&self) -> Result<()> {
        let n = match *self {
            ReceivePolicy::Exactly(n) | ReceivePolicy::AtMost(n) | ReceivePolicy::AtLeast(n) => n,
        };
        if n == 0 {
            return Err(NewbError::Config(format!("{self:?} must be non-zero")));
        }
        Ok(())
    }
}

impl Default for ReceivePolicy {
    fn default() -> Self {
        ReceivePolicy::AtMost(1024)
    }
}

/// Outcome of a single `read_some` / `write_some` attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RwState {
    /// Bytes were moved.
    Success,
    /// Nothing could be moved right now.
    Indeterminate,
}

#[derive(Debug)]
struct ReadState {
    buffer: Vec<u8>,
    collected: usize,
    threshold: usize,
    maximum: usize,
    policy: ReceivePolicy,
    /// Replaces `policy` at the next `prepare_next_read`.
    pending: Option<ReceivePolicy>,
}

#[derive(Debug, Default)]
struct WriteState {
    send_buffer: BytesMut,
    offline_buffer: BytesMut,
    written: usize,
    writing: bool,
}

/// Streams bound to a connection. The first one opened, by either side,
/// becomes the primary stream writes go out on.
#[derive(Debug, Default)]
pub(crate) struct StreamBindings {
    pub(crate) primary: Option<StreamId>,
    pub(crate) bound: BTreeSet<StreamId>,
}

impl StreamBindings {
    pub(crate) fn bind(&mut self, stream: StreamId) {
        self.bound.insert(stream);
        if self.primary.is_none() {
            self.primary = Some(stream);
        }
    }
}

/// Read/write buffering for one connection.
pub struct TransportPolicy<E: ProtocolEngine> {
    token: Token,
    conn: E::Connection,
    peer: SocketAddr,
    streams: StreamBindings,
    ingress: BytesMut,
    ingress_finished: bool,
    read: ReadState,
    write: WriteState,
    close_requested: Option<u64>,
}

impl<E: ProtocolEngine> TransportPolicy<E> {
    pub fn new(token: Token, conn: E::Connection, peer: SocketAddr, policy: ReceivePolicy) -> Self {
        Self {
            token,
            conn,
            peer,
            streams: StreamBindings::default(),
            ingress: BytesMut::new(),
            ingress_finished: false,
            read: ReadState {
                buffer: Vec::new(),
                collected: 0,
                threshold: 0,
                maximum: 0,
                policy,
                pending: None,
            },
            write: WriteState::default(),
            close_requested: None,
        }
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn connection(&self) -> &E::Connection {
        &self.conn
    }

    pub fn connection_mut(&mut self) -> &mut E::Connection {
        &mut self.conn
    }

    pub fn primary_stream(&self) -> Option<StreamId> {
        self.streams.primary
    }

    pub fn receive_policy(&self) -> ReceivePolicy {
        self.read.policy
    }

    // ---- read path ----

    /// Switches the receive policy. Takes effect at the next
    /// [`prepare_next_read`](Self::prepare_next_read).
    pub fn configure_read(&mut self, policy: ReceivePolicy) {
        self.read.pending = Some(policy);
    }

    /// Resets `collected` and re-applies the sizing rule of the active
    /// policy. Call once per delivered message, after delivery.
    pub fn prepare_next_read(&mut self) {
        if let Some(policy) = self.read.pending.take() {
            self.read.policy = policy;
        }
        let policy = self.read.policy;
        self.read.collected = 0;
        self.read.maximum = policy.target_size();
        self.read.threshold = policy.threshold();
        self.read.buffer.resize(self.read.maximum, 0);
    }

    /// Moves buffered ingress bytes into the free part of the read buffer.
    ///
    /// Fails with `ReadFailure` once the peer finished the stream and no
    /// bytes are left. Success says nothing about the threshold; check
    /// [`should_deliver`](Self::should_deliver).
    pub fn read_some(&mut self) -> Result<RwState> {
        let free = self.read.buffer.len() - self.read.collected;
        if self.ingress.is_empty() {
            if self.ingress_finished {
                return Err(NewbError::ReadFailure("stream finished by peer".into()));
            }
            return Ok(RwState::Indeterminate);
        }
        if free == 0 {
            return Ok(RwState::Indeterminate);
        }
        let n = free.min(self.ingress.len());
        let start = self.read.collected;
        self.read.buffer[start..start + n].copy_from_slice(&self.ingress[..n]);
        self.ingress.advance(n);
        self.read.collected += n;
        Ok(RwState::Success)
    }

    pub fn should_deliver(&self) -> bool {
        self.read.collected >= self.read.threshold
    }

    pub fn collected(&self) -> usize {
        self.read.collected
    }

    pub fn threshold(&self) -> usize {
        self.read.threshold
    }

    /// Current read buffer capacity.
    pub fn capacity(&self) -> usize {
        self.read.buffer.len()
    }

    /// Bytes the bridge forwarded that `read_some` has not consumed yet.
    pub fn pending_ingress(&self) -> usize {
        self.ingress.len()
    }

    /// Hands the collected bytes and an [`Outbox`] to `f`.
    pub fn deliver<R>(&mut self, f: impl FnOnce(&[u8], &mut Outbox<'_>) -> R) -> R {
        let data = &self.read.buffer[..self.read.collected];
        let mut outbox = Outbox::new(
            &mut self.write.offline_buffer,
            &mut self.read.pending,
            &mut self.close_requested,
        );
        f(data, &mut outbox)
    }

    pub fn outbox(&mut self) -> Outbox<'_> {
        Outbox::new(
            &mut self.write.offline_buffer,
            &mut self.read.pending,
            &mut self.close_requested,
        )
    }

    // ---- write path ----

    /// Queues `data` in the offline buffer.
    pub fn write(&mut self, data: &[u8]) {
        self.write.offline_buffer.extend_from_slice(data);
    }

    /// Starts writing queued output. No-op when output is already in flight
    /// or nothing is queued.
    pub fn flush(&mut self, reactor: &mut dyn Reactor) {
        if self.write.writing || self.write.offline_buffer.is_empty() {
            return;
        }
        reactor.register(self.token, Operation::Write);
        self.write.writing = true;
        if self.write.written >= self.write.send_buffer.len() {
            self.prepare_next_write(reactor);
        }
    }

    /// Hands as much of the send buffer to the engine as it accepts.
    pub fn write_some(&mut self, io: &mut IoContext<'_, E>) -> Result<RwState> {
        if !self.write.writing || self.write.written >= self.write.send_buffer.len() {
            return Ok(RwState::Indeterminate);
        }
        let stream = match self.streams.primary {
            Some(stream) => stream,
            None => {
                let stream = io
                    .engine
                    .open_stream(&mut self.conn)
                    .map_err(|e| NewbError::WriteFailure(e.to_string()))?;
                self.streams.bind(stream);
                stream
            }
        };
        let n = io
            .engine
            .stream_send(&mut self.conn, stream, &self.write.send_buffer[self.write.written..])
            .map_err(|e| NewbError::WriteFailure(e.to_string()))?;
        if n == 0 {
            return Ok(RwState::Indeterminate);
        }
        self.write.written += n;
        if self.write.written == self.write.send_buffer.len() {
            self.prepare_next_write(io.reactor);
        }
        Ok(RwState::Success)
    }

    /// Rotates the next offline batch in, or stops writing when none is left.
    pub fn prepare_next_write(&mut self, reactor: &mut dyn Reactor) {
        self.write.written = 0;
        self.write.send_buffer.clear();
        if self.write.offline_buffer.is_empty() {
            reactor.deregister(self.token, Operation::Write);
            self.write.writing = false;
        } else {
            std::mem::swap(&mut self.write.send_buffer, &mut self.write.offline_buffer);
        }
    }

    /// Drops write interest but keeps queued bytes.
    pub fn stop_writing(&mut self, reactor: &mut dyn Reactor) {
        if self.write.writing {
            reactor.deregister(self.token, Operation::Write);
            self.write.writing = false;
        }
    }

    /// Drops everything not yet handed to the engine.
    pub fn discard_pending_writes(&mut self, reactor: &mut dyn Reactor) {
        self.stop_writing(reactor);
        self.write.send_buffer.clear();
        self.write.offline_buffer.clear();
        self.write.written = 0;
    }

    pub fn is_writing(&self) -> bool {
        self.write.writing
    }

    /// Bytes queued or in flight that the engine has not taken yet.
    pub fn pending_output(&self) -> usize {
        self.write.send_buffer.len() - self.write.written + self.write.offline_buffer.len()
    }

    /// Takes a close request issued through the [`Outbox`].
    pub fn take_close_request(&mut self) -> Option<u64> {
        self.close_requested.take()
    }

    pub fn request_close(&mut self, error_code: u64) {
        self.close_requested = Some(error_code);
    }

    /// Splits off the engine connection and a bridge over the ingress state,
    /// so both can be handed to `ProtocolEngine::receive` at once.
    pub(crate) fn split_for_dispatch(&mut self) -> (&mut E::Connection, StreamBridge<'_>) {
        (
            &mut self.conn,
            StreamBridge::new(&mut self.streams, &mut self.ingress, &mut self.ingress_finished),
        )
    }
}
