//! Per-stream reassembly of STREAM frames by offset.
//!
//! Segments arriving out of order wait in a `BTreeMap` until the gap before
//! them closes; in-order bytes move to the ready buffer that the stream
//! bridge reads through [`IngressView`].

use std::collections::BTreeMap;

use bytes::{Buf, Bytes, BytesMut};
use newbmux::IngressView;

use crate::error::{Result, WireError};

/// How far past the in-order point a peer may send, and how many
/// out-of-order bytes one stream may hold.
pub const MAX_STREAM_WINDOW: u64 = 1 << 20;

#[derive(Debug, Default)]
pub struct StreamReassembly {
    /// In-order bytes not yet shifted out.
    ready: BytesMut,
    /// Stream offset one past the last in-order byte.
    next_offset: u64,
    /// Out-of-order segments keyed by their starting offset.
    pending: BTreeMap<u64, Bytes>,
    pending_bytes: usize,
    /// Final size of the stream, once a FIN was seen.
    fin_offset: Option<u64>,
}

impl StreamReassembly {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds the segment `[offset, offset + data.len())`. Duplicate and
    /// overlapping bytes are ignored. Segments reaching past the receive
    /// window are rejected.
    pub fn insert(&mut self, offset: u64, mut data: Bytes, fin: bool) -> Result<()> {
        let end = offset
            .checked_add(data.len() as u64)
            .ok_or(WireError::OffsetOverflow {
                offset,
                len: data.len(),
            })?;
        let limit = self.next_offset.saturating_add(MAX_STREAM_WINDOW);
        if end > limit {
            return Err(WireError::StreamWindowExceeded { end, limit });
        }
        if fin {
            match self.fin_offset {
                Some(known) if known != end => {
                    return Err(WireError::Internal(format!(
                        "stream final size changed from {known} to {end}"
                    )));
                }
                _ => self.fin_offset = Some(end),
            }
        }
        if let Some(final_size) = self.fin_offset {
            if end > final_size {
                return Err(WireError::Internal(format!(
                    "data beyond final size {final_size}"
                )));
            }
        }
        if end <= self.next_offset {
            return Ok(());
        }

        let mut offset = offset;
        if offset < self.next_offset {
            data.advance((self.next_offset - offset) as usize);
            offset = self.next_offset;
        }
        let replaced = match self.pending.get(&offset) {
            Some(existing) if existing.len() >= data.len() => return Ok(()),
            Some(existing) => existing.len(),
            None => 0,
        };
        let buffered = self.pending_bytes - replaced + data.len();
        if offset > self.next_offset && buffered as u64 > MAX_STREAM_WINDOW {
            return Err(WireError::ReassemblyBufferFull {
                buffered,
                max: MAX_STREAM_WINDOW,
            });
        }
        self.pending_bytes = buffered;
        self.pending.insert(offset, data);
        self.drain_pending();
        Ok(())
    }

    fn drain_pending(&mut self) {
        while let Some((&start, _)) = self.pending.first_key_value() {
            if start > self.next_offset {
                break;
            }
            let Some((start, mut seg)) = self.pending.pop_first() else {
                break;
            };
            self.pending_bytes -= seg.len();
            let seg_end = start + seg.len() as u64;
            if seg_end <= self.next_offset {
                continue;
            }
            seg.advance((self.next_offset - start) as usize);
            self.ready.extend_from_slice(&seg);
            self.next_offset = seg_end;
        }
    }

    /// Bytes waiting behind a gap.
    pub fn buffered_out_of_order(&self) -> usize {
        self.pending_bytes
    }

    pub fn next_offset(&self) -> u64 {
        self.next_offset
    }
}

impl IngressView for StreamReassembly {
    fn contiguous(&self) -> &[u8] {
        &self.ready
    }

    fn shift(&mut self, n: usize) {
        let n = n.min(self.ready.len());
        self.ready.advance(n);
    }

    fn is_finished(&self) -> bool {
        self.ready.is_empty() && self.fin_offset == Some(self.next_offset)
    }
}
