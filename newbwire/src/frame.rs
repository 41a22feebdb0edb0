use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Result, WireError};
use crate::header::RESET_TOKEN_LEN;

/// Frame type identifiers carried in packet payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    Hello = 0x01,
    HelloAck = 0x02,
    Stream = 0x03,
    ResetStream = 0x04,
    Close = 0x05,
    Ping = 0x06,
}

impl TryFrom<u8> for FrameType {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(FrameType::Hello),
            0x02 => Ok(FrameType::HelloAck),
            0x03 => Ok(FrameType::Stream),
            0x04 => Ok(FrameType::ResetStream),
            0x05 => Ok(FrameType::Close),
            0x06 => Ok(FrameType::Ping),
            other => Err(WireError::UnknownFrameType(other)),
        }
    }
}

/// Set in a STREAM frame's flags when it carries the last byte of the stream.
pub const STREAM_FIN: u8 = 0x01;

/// Reference engine frame.
///
/// Binary layout (all fields big-endian):
///
/// ```text
/// +-------+--- variable ---+
/// | type  | fields per type |
/// | (1B)  |                 |
/// +-------+-----------------+
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// HELLO: no fields. Opens a connection.
    Hello,
    /// HELLO_ACK: reset_token(16)
    HelloAck { reset_token: [u8; RESET_TOKEN_LEN] },
    /// STREAM: stream_id(4) + offset(8) + flags(1) + len(2) + data(N)
    Stream {
        stream_id: u32,
        offset: u64,
        fin: bool,
        data: Bytes,
    },
    /// RESET_STREAM: stream_id(4) + error_code(8)
    ResetStream { stream_id: u32, error_code: u64 },
    /// CLOSE: error_code(8) + reason_len(2) + reason(N)
    Close { error_code: u64, reason: String },
    /// PING: no fields.
    Ping,
}

/// Fixed bytes of a STREAM frame ahead of its data.
pub const STREAM_OVERHEAD: usize = 1 + 4 + 8 + 1 + 2;

impl Frame {
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Hello => FrameType::Hello,
            Frame::HelloAck { .. } => FrameType::HelloAck,
            Frame::Stream { .. } => FrameType::Stream,
            Frame::ResetStream { .. } => FrameType::ResetStream,
            Frame::Close { .. } => FrameType::Close,
            Frame::Ping => FrameType::Ping,
        }
    }

    /// Whether the frame only makes sense once the handshake completed.
    pub fn is_application(&self) -> bool {
        matches!(self, Frame::Stream { .. } | Frame::ResetStream { .. })
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf.freeze()
    }

    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u8(self.frame_type() as u8);
        match self {
            Frame::Hello | Frame::Ping => {}
            Frame::HelloAck { reset_token } => buf.put_slice(reset_token),
            Frame::Stream {
                stream_id,
                offset,
                fin,
                data,
            } => {
                buf.put_u32(*stream_id);
                buf.put_u64(*offset);
                buf.put_u8(if *fin { STREAM_FIN } else { 0 });
                buf.put_u16(data.len() as u16);
                buf.put_slice(data);
            }
            Frame::ResetStream {
                stream_id,
                error_code,
            } => {
                buf.put_u32(*stream_id);
                buf.put_u64(*error_code);
            }
            Frame::Close { error_code, reason } => {
                buf.put_u64(*error_code);
                buf.put_u16(reason.len() as u16);
                buf.put_slice(reason.as_bytes());
            }
        }
    }

    pub fn encoded_len(&self) -> usize {
        1 + match self {
            Frame::Hello | Frame::Ping => 0,
            Frame::HelloAck { .. } => RESET_TOKEN_LEN,
            Frame::Stream { data, .. } => STREAM_OVERHEAD - 1 + data.len(),
            Frame::ResetStream { .. } => 4 + 8,
            Frame::Close { reason, .. } => 8 + 2 + reason.len(),
        }
    }

    /// Decode one frame from the start of `data`.
    pub fn decode(mut data: &[u8]) -> Result<Self> {
        ensure_len(data, 1)?;
        let frame_type = FrameType::try_from(data[0])?;
        data = &data[1..];

        match frame_type {
            FrameType::Hello => Ok(Frame::Hello),
            FrameType::Ping => Ok(Frame::Ping),
            FrameType::HelloAck => {
                ensure_len(data, RESET_TOKEN_LEN)?;
                let mut reset_token = [0u8; RESET_TOKEN_LEN];
                reset_token.copy_from_slice(&data[..RESET_TOKEN_LEN]);
                Ok(Frame::HelloAck { reset_token })
            }
            FrameType::Stream => {
                ensure_len(data, 15)?; // 4+8+1+2
                let stream_id = (&data[0..4]).get_u32();
                let offset = (&data[4..12]).get_u64();
                let fin = data[12] & STREAM_FIN != 0;
                let len = (&data[13..15]).get_u16() as usize;
                let data = &data[15..];
                ensure_len(data, len)?;
                Ok(Frame::Stream {
                    stream_id,
                    offset,
                    fin,
                    data: Bytes::copy_from_slice(&data[..len]),
                })
            }
            FrameType::ResetStream => {
                ensure_len(data, 12)?;
                let stream_id = (&data[0..4]).get_u32();
                let error_code = (&data[4..12]).get_u64();
                Ok(Frame::ResetStream {
                    stream_id,
                    error_code,
                })
            }
            FrameType::Close => {
                ensure_len(data, 10)?;
                let error_code = (&data[0..8]).get_u64();
                let len = (&data[8..10]).get_u16() as usize;
                let data = &data[10..];
                ensure_len(data, len)?;
                let reason = String::from_utf8(data[..len].to_vec())
                    .map_err(|_| WireError::Internal("close reason is not utf-8".into()))?;
                Ok(Frame::Close { error_code, reason })
            }
        }
    }

    /// Decode every frame in a packet payload.
    pub fn decode_all(mut payload: &[u8]) -> Result<Vec<Self>> {
        let mut frames = Vec::new();
        while !payload.is_empty() {
            let frame = Self::decode(payload)?;
            payload = &payload[frame.encoded_len()..];
            frames.push(frame);
        }
        Ok(frames)
    }
}

fn ensure_len(data: &[u8], needed: usize) -> Result<()> {
    if data.len() < needed {
        Err(WireError::PacketTooShort {
            expected: needed,
            actual: data.len(),
        })
    } else {
        Ok(())
    }
}
