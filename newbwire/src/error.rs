use newbmux::{DecodeError, EngineError};
use thiserror::Error;

/// All errors produced by the reference wire format.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("packet too short: expected at least {expected} bytes, got {actual}")]
    PacketTooShort { expected: usize, actual: usize },

    #[error("unknown packet type: 0x{0:02x}")]
    UnknownPacketType(u8),

    #[error("unknown frame type: 0x{0:02x}")]
    UnknownFrameType(u8),

    #[error("invalid connection id length: {0}")]
    InvalidCidLength(usize),

    #[error("payload too large: {size} bytes exceeds maximum {max}")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("stream offset {offset} plus {len} bytes overflows")]
    OffsetOverflow { offset: u64, len: usize },

    #[error("stream data up to {end} exceeds receive window ending at {limit}")]
    StreamWindowExceeded { end: u64, limit: u64 },

    #[error("out-of-order buffer full: {buffered} bytes exceeds {max}")]
    ReassemblyBufferFull { buffered: usize, max: u64 },

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, WireError>;

impl From<WireError> for DecodeError {
    fn from(err: WireError) -> Self {
        match err {
            WireError::PacketTooShort { expected, actual } => DecodeError::NeedsMoreData {
                needed: expected,
                available: actual,
            },
            other => DecodeError::Malformed(other.to_string()),
        }
    }
}

impl From<WireError> for EngineError {
    fn from(err: WireError) -> Self {
        EngineError::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncation_maps_to_needs_more_data() {
        let err: DecodeError = WireError::PacketTooShort {
            expected: 12,
            actual: 3,
        }
        .into();
        assert_eq!(
            err,
            DecodeError::NeedsMoreData {
                needed: 12,
                available: 3
            }
        );
    }

    #[test]
    fn other_codec_errors_are_malformed() {
        let err: DecodeError = WireError::UnknownPacketType(0x13).into();
        assert_eq!(err, DecodeError::Malformed("unknown packet type: 0x13".into()));
    }
}
