//! Stream bridge between the protocol engine and a transport policy.
//!
//! A [`StreamBridge`] borrows the ingress side of one transport policy for
//! the duration of a single `ProtocolEngine::receive` call. Stream events
//! raised by the engine land directly in that policy's state; what the
//! handler has to hear about afterwards is collected in a notice.

use std::net::SocketAddr;

use bytes::BytesMut;

use crate::engine::{DecodedPacket, IngressView, ProtocolEngine, StreamEvents, StreamId};
use crate::error::{EngineError, NewbError};
use crate::newb::{IoContext, Newb};
use crate::policy::StreamBindings;

/// What the handler must be told after a dispatch.
#[derive(Debug, Default)]
pub(crate) struct BridgeNotice {
    pub(crate) readable: bool,
    pub(crate) resets: Vec<(StreamId, u64)>,
    pub(crate) closed_by_peer: Option<(u64, String)>,
}

pub struct StreamBridge<'a> {
    streams: &'a mut StreamBindings,
    ingress: &'a mut BytesMut,
    finished: &'a mut bool,
    notice: BridgeNotice,
}

impl<'a> StreamBridge<'a> {
    pub(crate) fn new(
        streams: &'a mut StreamBindings,
        ingress: &'a mut BytesMut,
        finished: &'a mut bool,
    ) -> Self {
        Self {
            streams,
            ingress,
            finished,
            notice: BridgeNotice::default(),
        }
    }

    pub(crate) fn into_notice(self) -> BridgeNotice {
        self.notice
    }

    #[cfg(test)]
    pub(crate) fn push(&mut self, stream: StreamId, data: &[u8], fin: bool) {
        let mut view = SliceIngress::new(data, fin);
        self.on_stream_data(stream, &mut view).unwrap();
    }
}

impl StreamEvents for StreamBridge<'_> {
    fn on_stream_open(&mut self, stream: StreamId) -> Result<(), EngineError> {
        tracing::trace!(stream, "stream opened by peer");
        self.streams.bind(stream);
        Ok(())
    }

    fn on_stream_data(
        &mut self,
        stream: StreamId,
        ingress: &mut dyn IngressView,
    ) -> Result<(), EngineError> {
        if !self.streams.bound.contains(&stream) {
            return Err(EngineError::UnknownStream(stream));
        }
        let n = {
            let data = ingress.contiguous();
            self.ingress.extend_from_slice(data);
            data.len()
        };
        if n > 0 {
            ingress.shift(n);
            self.notice.readable = true;
        }
        if ingress.is_finished() && self.streams.primary == Some(stream) && !*self.finished {
            *self.finished = true;
            self.notice.readable = true;
        }
        Ok(())
    }

    fn on_stream_reset(&mut self, stream: StreamId, error_code: u64) {
        self.streams.bound.remove(&stream);
        if self.streams.primary == Some(stream) {
            self.streams.primary = None;
        }
        self.notice.resets.push((stream, error_code));
    }

    fn on_closed_by_peer(&mut self, error_code: u64, reason: &str) {
        self.notice.closed_by_peer = Some((error_code, reason.to_owned()));
    }
}

/// An [`IngressView`] over a borrowed slice.
///
/// Handy for engines that hold a stream's in-order bytes in one piece.
#[derive(Debug)]
pub struct SliceIngress<'a> {
    data: &'a [u8],
    consumed: usize,
    fin: bool,
}

impl<'a> SliceIngress<'a> {
    pub fn new(data: &'a [u8], fin: bool) -> Self {
        Self {
            data,
            consumed: 0,
            fin,
        }
    }

    pub fn consumed(&self) -> usize {
        self.consumed
    }
}

impl IngressView for SliceIngress<'_> {
    fn contiguous(&self) -> &[u8] {
        &self.data[self.consumed..]
    }

    fn shift(&mut self, n: usize) {
        self.consumed = (self.consumed + n).min(self.data.len());
    }

    fn is_finished(&self) -> bool {
        self.fin && self.consumed == self.data.len()
    }
}

/// Why a connection has to be torn down.
#[derive(Debug)]
pub(crate) enum Teardown {
    PeerClosed { code: u64, reason: String },
    /// The engine reports the connection closed (local close, idle timeout).
    Closed,
    Failure(NewbError),
}

/// Feeds one packet into the connection `newb` owns and notifies the
/// handler of what happened. Engine errors are logged and leave the
/// connection in place.
pub(crate) fn dispatch<E: ProtocolEngine>(
    newb: &mut dyn Newb<E>,
    io: &mut IoContext<'_, E>,
    peer: SocketAddr,
    packet: &DecodedPacket,
) -> Option<Teardown> {
    let notice = {
        let (conn, mut bridge) = newb.transport_mut().split_for_dispatch();
        if let Err(e) = io.engine.receive(conn, peer, packet, &mut bridge) {
            tracing::warn!(
                peer = %peer,
                dcid = %packet.dcid,
                error = %e,
                "engine failed to process packet"
            );
        }
        bridge.into_notice()
    };

    for (stream, code) in notice.resets {
        tracing::debug!(peer = %peer, stream, code, "stream reset by peer");
        newb.stream_reset(stream, code);
    }
    if notice.readable {
        if let Err(e) = newb.read_event(io) {
            return Some(Teardown::Failure(e));
        }
    }
    notice
        .closed_by_peer
        .map(|(code, reason)| Teardown::PeerClosed { code, reason })
}
