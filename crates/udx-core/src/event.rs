//! Events reported by the engine.
//!
//! Every notification a caller can observe (data read, writes acknowledged,
//! sends flushed, streams closed) is queued as an [`Event`] while the
//! engine runs and drained by the caller afterwards. Events are never
//! delivered from inside the call that produced them.

use crate::arena::Handle;
use std::fmt;
use std::net::SocketAddr;

/// Stream handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub(crate) Handle);

/// Socket handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketId(pub(crate) Handle);

/// Write request handle, scoped to its stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WriteId(pub(crate) Handle);

/// Unordered send request, unique per engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SendId(pub(crate) u64);

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream#{:?}", self.0)
    }
}

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "socket#{:?}", self.0)
    }
}

impl SendId {
    /// Raw request number
    #[must_use]
    pub fn get(self) -> u64 {
        self.0
    }
}

/// Outcome of a write or send request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// Every byte was acknowledged (writes) or handed to the socket (sends)
    Completed,
    /// The stream or socket closed first
    Cancelled,
}

/// Why a stream closed abnormally
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// A packet hit the transmit limit without being acknowledged
    TimedOut,
    /// The peer destroyed the stream
    ConnectionReset,
    /// The stream it relayed to closed
    RelayTargetClosed,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::TimedOut => write!(f, "timed out"),
            CloseReason::ConnectionReset => write!(f, "connection reset"),
            CloseReason::RelayTargetClosed => write!(f, "relay target closed"),
        }
    }
}

/// Engine notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// In-order stream data
    Read {
        /// Receiving stream
        stream: StreamId,
        /// Payload
        data: Vec<u8>,
    },

    /// The peer ended its write side and all its data has been read
    End {
        /// Receiving stream
        stream: StreamId,
    },

    /// Unordered message
    Message {
        /// Receiving stream
        stream: StreamId,
        /// Payload
        data: Vec<u8>,
    },

    /// Queued bytes fell back below the high watermark
    Drain {
        /// Writing stream
        stream: StreamId,
    },

    /// A write request finished
    WriteAck {
        /// Writing stream
        stream: StreamId,
        /// Request
        write: WriteId,
        /// Outcome
        status: Completion,
        /// The final byte was acknowledged selectively
        sacked: bool,
    },

    /// An unordered message left the socket
    MessageSent {
        /// Sending stream
        stream: StreamId,
        /// Request
        send: SendId,
        /// Outcome
        status: Completion,
    },

    /// The peer acknowledged everything sent before a remote change
    RemoteChanged {
        /// Migrated stream
        stream: StreamId,
    },

    /// The stream closed; no further events follow for it
    Close {
        /// Closed stream
        stream: StreamId,
        /// Set when the close was abnormal
        reason: Option<CloseReason>,
    },

    /// A datagram that is not stream traffic
    SocketRecv {
        /// Receiving socket
        socket: SocketId,
        /// Payload
        data: Vec<u8>,
        /// Sender
        from: SocketAddr,
    },

    /// A raw socket send finished
    SocketSent {
        /// Sending socket
        socket: SocketId,
        /// Request
        send: SendId,
        /// Outcome
        status: Completion,
    },

    /// The socket finished closing
    SocketClose {
        /// Closed socket
        socket: SocketId,
    },
}

/// Firewall decision for a stream packet arriving on a foreign socket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirewallVerdict {
    /// Drop the packet
    Reject,
    /// Process the packet as usual
    Accept,
    /// Connect the stream to the sender through the receiving socket, then
    /// process the packet
    Connect {
        /// Peer's stream id
        remote_id: u32,
    },
}

/// Policy consulted before a stream accepts traffic from a socket other than
/// its own (including before it is connected at all)
pub trait Firewall: Send {
    /// Decide what to do with a packet for `stream` from `from` on `socket`
    fn check(&mut self, stream: StreamId, socket: SocketId, from: SocketAddr) -> FirewallVerdict;
}

impl<F> Firewall for F
where
    F: FnMut(StreamId, SocketId, SocketAddr) -> FirewallVerdict + Send,
{
    fn check(&mut self, stream: StreamId, socket: SocketId, from: SocketAddr) -> FirewallVerdict {
        self(stream, socket, from)
    }
}
