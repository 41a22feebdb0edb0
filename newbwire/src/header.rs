//! Packet headers.
//!
//! Binary layout (all integers big-endian):
//!
//! ```text
//! long:   0xC0|type(1) version(4) dcid_len(1) dcid scid_len(1) scid len(2) payload
//! short:  0x40(1) dcid(8) len(2) payload
//! reset:  0x50(1) dcid(8) token(16)
//! ```
//!
//! A long header with version 0 is a version negotiation packet; its payload
//! lists the supported versions, four bytes each.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use newbmux::ConnectionId;

use crate::error::{Result, WireError};

pub const VERSION_1: u32 = 1;
pub const SUPPORTED_VERSIONS: &[u32] = &[VERSION_1];

/// Length of the IDs this engine mints and of every short-header dcid.
pub const CID_LEN: usize = 8;
/// Longest ID a long header may carry.
pub const MAX_CID_LEN: usize = 20;
pub const RESET_TOKEN_LEN: usize = 16;
pub const MAX_PAYLOAD: usize = u16::MAX as usize;
/// Largest datagram the engine builds.
pub const MAX_DATAGRAM: usize = 1200;

const LONG_FORM: u8 = 0xC0;
const SHORT_TAG: u8 = 0x40;
pub const RESET_TAG: u8 = 0x50;

const SHORT_OVERHEAD: usize = 1 + CID_LEN + 2;
const RESET_LEN: usize = 1 + CID_LEN + RESET_TOKEN_LEN;

/// Long-header packet types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum LongType {
    /// Client's first flight.
    Initial = 0x00,
    /// Server's answer to an Initial.
    Handshake = 0x01,
}

impl TryFrom<u8> for LongType {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x00 => Ok(LongType::Initial),
            0x01 => Ok(LongType::Handshake),
            other => Err(WireError::UnknownPacketType(LONG_FORM | other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Header {
    Long {
        ty: LongType,
        version: u32,
        dcid: ConnectionId,
        scid: ConnectionId,
    },
    Short {
        dcid: ConnectionId,
    },
    Reset {
        dcid: ConnectionId,
        token: [u8; RESET_TOKEN_LEN],
    },
}

impl Header {
    pub fn dcid(&self) -> &ConnectionId {
        match self {
            Header::Long { dcid, .. } | Header::Short { dcid } | Header::Reset { dcid, .. } => dcid,
        }
    }

    pub fn is_version_negotiation(&self) -> bool {
        matches!(self, Header::Long { version: 0, .. })
    }
}

/// One packet: header plus its (possibly empty) payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub header: Header,
    pub payload: Bytes,
}

impl Packet {
    /// Builds a packet, checking ID lengths and the payload size.
    pub fn new(header: Header, payload: Bytes) -> Result<Self> {
        match &header {
            Header::Long { dcid, scid, .. } => {
                for cid in [dcid, scid] {
                    if cid.len() > MAX_CID_LEN {
                        return Err(WireError::InvalidCidLength(cid.len()));
                    }
                }
            }
            Header::Short { dcid } | Header::Reset { dcid, .. } => {
                if dcid.len() != CID_LEN {
                    return Err(WireError::InvalidCidLength(dcid.len()));
                }
            }
        }
        if matches!(header, Header::Reset { .. }) && !payload.is_empty() {
            return Err(WireError::PayloadTooLarge {
                size: payload.len(),
                max: 0,
            });
        }
        if payload.len() > MAX_PAYLOAD {
            return Err(WireError::PayloadTooLarge {
                size: payload.len(),
                max: MAX_PAYLOAD,
            });
        }
        Ok(Self { header, payload })
    }

    pub fn short(dcid: ConnectionId, payload: Bytes) -> Result<Self> {
        Self::new(Header::Short { dcid }, payload)
    }

    pub fn reset(dcid: ConnectionId, token: [u8; RESET_TOKEN_LEN]) -> Result<Self> {
        Self::new(Header::Reset { dcid, token }, Bytes::new())
    }

    /// A version negotiation packet answering one whose IDs were `dcid` and
    /// `scid`: the IDs are swapped, as the peer expects.
    pub fn version_negotiation(dcid: &ConnectionId, scid: &ConnectionId) -> Result<Self> {
        let mut payload = BytesMut::with_capacity(SUPPORTED_VERSIONS.len() * 4);
        for v in SUPPORTED_VERSIONS {
            payload.put_u32(*v);
        }
        Self::new(
            Header::Long {
                ty: LongType::Initial,
                version: 0,
                dcid: scid.clone(),
                scid: dcid.clone(),
            },
            payload.freeze(),
        )
    }

    /// Versions listed by a version negotiation packet.
    pub fn supported_versions(&self) -> Vec<u32> {
        if !self.header.is_version_negotiation() {
            return Vec::new();
        }
        self.payload
            .chunks_exact(4)
            .map(|mut c| c.get_u32())
            .collect()
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf.freeze()
    }

    pub fn encode_into(&self, buf: &mut BytesMut) {
        match &self.header {
            Header::Long {
                ty,
                version,
                dcid,
                scid,
            } => {
                buf.put_u8(LONG_FORM | *ty as u8);
                buf.put_u32(*version);
                buf.put_u8(dcid.len() as u8);
                buf.put_slice(dcid.as_bytes());
                buf.put_u8(scid.len() as u8);
                buf.put_slice(scid.as_bytes());
                buf.put_u16(self.payload.len() as u16);
                buf.put_slice(&self.payload);
            }
            Header::Short { dcid } => {
                buf.put_u8(SHORT_TAG);
                buf.put_slice(dcid.as_bytes());
                buf.put_u16(self.payload.len() as u16);
                buf.put_slice(&self.payload);
            }
            Header::Reset { dcid, token } => {
                buf.put_u8(RESET_TAG);
                buf.put_slice(dcid.as_bytes());
                buf.put_slice(token);
            }
        }
    }

    pub fn encoded_len(&self) -> usize {
        match &self.header {
            Header::Long { dcid, scid, .. } => {
                1 + 4 + 1 + dcid.len() + 1 + scid.len() + 2 + self.payload.len()
            }
            Header::Short { .. } => SHORT_OVERHEAD + self.payload.len(),
            Header::Reset { .. } => RESET_LEN,
        }
    }

    /// Room left for frames in a short packet of at most [`MAX_DATAGRAM`] bytes.
    pub fn short_payload_budget() -> usize {
        MAX_DATAGRAM - SHORT_OVERHEAD
    }

    /// Decodes the first packet in `data`. Returns the packet and the number
    /// of bytes it occupied; the payload shares `data`'s buffer.
    pub fn decode(data: &Bytes) -> Result<(Self, usize)> {
        ensure_len(data, 1)?;
        let first = data[0];
        if first & LONG_FORM == LONG_FORM {
            return Self::decode_long(data);
        }
        match first {
            SHORT_TAG => {
                ensure_len(data, SHORT_OVERHEAD)?;
                let dcid = ConnectionId::new(data.slice(1..1 + CID_LEN));
                let len = (&data[1 + CID_LEN..SHORT_OVERHEAD]).get_u16() as usize;
                ensure_len(data, SHORT_OVERHEAD + len)?;
                let payload = data.slice(SHORT_OVERHEAD..SHORT_OVERHEAD + len);
                Ok((
                    Self {
                        header: Header::Short { dcid },
                        payload,
                    },
                    SHORT_OVERHEAD + len,
                ))
            }
            RESET_TAG => {
                ensure_len(data, RESET_LEN)?;
                let dcid = ConnectionId::new(data.slice(1..1 + CID_LEN));
                let mut token = [0u8; RESET_TOKEN_LEN];
                token.copy_from_slice(&data[1 + CID_LEN..RESET_LEN]);
                Ok((
                    Self {
                        header: Header::Reset { dcid, token },
                        payload: Bytes::new(),
                    },
                    RESET_LEN,
                ))
            }
            other => Err(WireError::UnknownPacketType(other)),
        }
    }

    fn decode_long(data: &Bytes) -> Result<(Self, usize)> {
        let ty = LongType::try_from(data[0] & !LONG_FORM)?;
        ensure_len(data, 6)?; // type + version + dcid_len
        let version = (&data[1..5]).get_u32();
        let mut pos = 5;

        let dcid = read_cid(data, &mut pos)?;
        let scid = read_cid(data, &mut pos)?;

        ensure_len(data, pos + 2)?;
        let len = (&data[pos..pos + 2]).get_u16() as usize;
        pos += 2;
        ensure_len(data, pos + len)?;
        let payload = data.slice(pos..pos + len);
        Ok((
            Self {
                header: Header::Long {
                    ty,
                    version,
                    dcid,
                    scid,
                },
                payload,
            },
            pos + len,
        ))
    }
}

fn read_cid(data: &Bytes, pos: &mut usize) -> Result<ConnectionId> {
    ensure_len(data, *pos + 1)?;
    let len = data[*pos] as usize;
    if len > MAX_CID_LEN {
        return Err(WireError::InvalidCidLength(len));
    }
    *pos += 1;
    ensure_len(data, *pos + len)?;
    let cid = ConnectionId::new(data.slice(*pos..*pos + len));
    *pos += len;
    Ok(cid)
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
