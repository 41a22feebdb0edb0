//! newbwire -- a plaintext reference protocol engine for newbmux.
//!
//! Implements [`newbmux::ProtocolEngine`] over a small QUIC-shaped wire
//! format so the connection layer can be exercised end to end:
//! - **Header codec**: long, short, stateless reset and version
//!   negotiation packets
//! - **Frame codec**: handshake, stream, reset and close frames
//! - **Connections**: a handshake state machine with offset-based stream
//!   reassembly and an idle timer
//!
//! The [`pingpong`] protocol drives the demo binary and the end-to-end tests.
//!
//! Nothing is encrypted. Key material only seeds stateless reset tokens.

pub mod cid;
pub mod connection;
pub mod engine;
pub mod error;
pub mod frame;
pub mod header;
pub mod pingpong;
pub mod reassembly;

pub use cid::{decode_cid, encode_cid, ResetTokenKey};
pub use connection::{Connection, ConnectionState, Role};
pub use engine::PlainEngine;
pub use error::{Result, WireError};
pub use frame::{Frame, FrameType};
pub use header::{Header, LongType, Packet, CID_LEN, SUPPORTED_VERSIONS, VERSION_1};
pub use reassembly::StreamReassembly;
