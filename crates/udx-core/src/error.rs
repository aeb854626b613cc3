//! Error types for the UDX protocol engine.

use std::borrow::Cow;
use thiserror::Error;
use udx_transport::TransportError;

/// Engine errors returned synchronously from API calls
#[derive(Debug, Error)]
pub enum Error {
    /// Argument out of range or otherwise unusable
    #[error("invalid argument: {0}")]
    InvalidArgument(Cow<'static, str>),

    /// Stream is already connected
    #[error("stream already connected")]
    AlreadyConnected,

    /// Stream is not connected
    #[error("stream not connected")]
    NotConnected,

    /// Reading or receiving was already started
    #[error("already started")]
    AlreadyStarted,

    /// Stream handle does not refer to a live stream
    #[error("unknown stream")]
    UnknownStream,

    /// Socket handle does not refer to a live socket
    #[error("unknown socket")]
    UnknownSocket,

    /// Socket is closing and accepts no new work
    #[error("socket is closing")]
    SocketClosing,

    /// Socket is not bound
    #[error("socket not bound")]
    NotBound,

    /// Stream is closed or being torn down
    #[error("stream closed")]
    StreamClosed,

    /// Configuration rejected by validation
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Malformed packet header
    #[error("header error: {0}")]
    Header(#[from] HeaderError),

    /// Socket layer error
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// I/O error from a socket option call
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create an invalid argument error with static context
    #[must_use]
    pub const fn invalid(context: &'static str) -> Self {
        Error::InvalidArgument(Cow::Borrowed(context))
    }
}

/// Wire header errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HeaderError {
    /// Datagram shorter than a header
    #[error("packet too short: expected at least {expected}, got {actual}")]
    TooShort {
        /// Expected minimum size
        expected: usize,
        /// Actual size received
        actual: usize,
    },

    /// First byte is not the protocol magic
    #[error("bad magic byte: 0x{0:02X}")]
    BadMagic(u8),

    /// Unsupported protocol version
    #[error("unsupported version: {0}")]
    BadVersion(u8),

    /// Data offset points past the end of the datagram
    #[error("data offset {offset} exceeds {available} available bytes")]
    OffsetOverflow {
        /// Offset from the header
        offset: usize,
        /// Bytes after the header
        available: usize,
    },
}

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, Error>;
