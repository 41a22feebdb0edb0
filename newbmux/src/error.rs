use thiserror::Error;

/// Failure to locate the next packet inside a datagram.
///
/// Either variant ends demultiplexing of the datagram it was raised for.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("packet truncated: expected at least {needed} bytes, got {available}")]
    NeedsMoreData { needed: usize, available: usize },

    #[error("malformed packet: {0}")]
    Malformed(String),
}

/// Errors reported by a protocol engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("connection attempt rejected: {0}")]
    Rejected(String),

    #[error("stream {0} is not bound to this connection")]
    UnknownStream(u64),

    #[error("connection is closed")]
    ConnectionClosed,

    #[error("stream {0} cannot accept more data")]
    StreamBlocked(u64),

    #[error("key material unusable: {0}")]
    KeyMaterial(String),

    #[error("engine failure: {0}")]
    Internal(String),
}

/// The direction of the I/O operation that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Operation {
    Read,
    Write,
}

/// All errors produced by the connection layer.
#[derive(Debug, Error)]
pub enum NewbError {
    #[error("could not bind UDP socket to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("read failure: {0}")]
    ReadFailure(String),

    #[error("write failure: {0}")]
    WriteFailure(String),

    #[error("new connection rejected: {0}")]
    AcceptRejected(String),

    #[error("handshake did not complete before the connect deadline")]
    ConnectTimeout,

    #[error("could not load key material from {path}: {source}")]
    KeyMaterial {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("handler for the connection is gone")]
    HandlerGone,

    #[error("could not create handler: {0}")]
    Spawn(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl NewbError {
    /// Returns the operation a per-connection failure belongs to, if any.
    pub fn operation(&self) -> Option<Operation> {
        match self {
            NewbError::ReadFailure(_) => Some(Operation::Read),
            NewbError::WriteFailure(_) => Some(Operation::Write),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, NewbError>;
