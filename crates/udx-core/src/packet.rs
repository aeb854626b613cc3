//! Outgoing packets.
//!
//! A [`Packet`] owns its encoded datagram: header, optional MTU-probe
//! padding, then payload. Data packets also remember which write fragments
//! their payload came from so an acknowledgement can credit them.

use crate::arena::Handle;
use crate::event::SendId;
use crate::header::{Header, HEADER_SIZE};
use std::net::SocketAddr;

/// IPv4 plus UDP header bytes
pub const IPV4_OVERHEAD: usize = 20 + 8;

/// IPv6 plus UDP header bytes
pub const IPV6_OVERHEAD: usize = 40 + 8;

/// Largest padding a probe can carry (the offset byte)
pub const MAX_PADDING: usize = 255;

/// IP and UDP header bytes in front of a datagram to `dest`
#[must_use]
pub fn ip_overhead(dest: &SocketAddr) -> usize {
    if dest.is_ipv4() {
        IPV4_OVERHEAD
    } else {
        IPV6_OVERHEAD
    }
}

/// Stream payload bytes that fit in one packet of `mtu` to `dest`
#[must_use]
pub fn max_payload(mtu: u16, dest: &SocketAddr) -> usize {
    usize::from(mtu).saturating_sub(ip_overhead(dest) + HEADER_SIZE)
}

/// What a packet carries, and who to notify when it is sent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    /// Ordered stream data (retransmitted until acknowledged)
    Write,
    /// Pure acknowledgement, possibly with SACK ranges
    State,
    /// Stream teardown notice
    Destroy,
    /// Unordered stream message
    Message(SendId),
    /// Raw datagram queued on a socket
    SocketSend(SendId),
    /// Packet forwarded for a relayed stream
    Relay,
}

/// How the last loss of a packet was detected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetransmitKind {
    /// Retransmission timeout
    Slow,
    /// RACK
    Fast,
}

/// Send state of a packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketStatus {
    /// Built but not yet confirmed sent
    Unsent,
    /// On the wire, awaiting acknowledgement
    Inflight,
    /// Declared lost, waiting in the retransmit queue
    Retransmit(RetransmitKind),
}

/// Reference to one buffer of a write request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WbufRef {
    /// Write request in the stream's write arena
    pub write: Handle,
    /// Buffer index within the request
    pub index: u32,
}

/// Slice of a write buffer carried by a packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fragment {
    /// Source buffer
    pub wbuf: WbufRef,
    /// Bytes taken from it
    pub len: usize,
}

/// Encoded datagram plus bookkeeping
#[derive(Debug, Clone)]
pub struct Packet {
    /// Sequence number (stream packets)
    pub seq: u32,
    /// Packet type
    pub kind: PacketKind,
    /// Send state
    pub status: PacketStatus,
    /// Transmissions counted towards the timeout limit
    pub transmits: u8,
    /// Time-to-live override, 0 for the socket default
    pub ttl: u8,
    /// Time the last transmission left the socket
    pub time_sent: u64,
    /// Destination
    pub dest: SocketAddr,
    /// Header, padding and payload
    pub buf: Vec<u8>,
    /// Probe padding bytes after the header
    pub padding: u8,
    /// Marked as an MTU probe
    pub probe: bool,
    /// Write fragments in payload order
    pub frags: Vec<Fragment>,
    /// Position in the retransmit queue
    pub fifo_hint: usize,
}

impl Packet {
    /// Stream packet with `header` followed by `payload`
    #[must_use]
    pub fn stream(kind: PacketKind, header: &Header, payload: &[u8], dest: SocketAddr) -> Self {
        let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
        buf.extend_from_slice(&header.to_bytes());
        buf.extend_from_slice(payload);
        Self::with_buf(kind, header.seq, buf, dest)
    }

    /// Packet around an already encoded datagram
    #[must_use]
    pub fn with_buf(kind: PacketKind, seq: u32, buf: Vec<u8>, dest: SocketAddr) -> Self {
        Self {
            seq,
            kind,
            status: PacketStatus::Unsent,
            transmits: 0,
            ttl: 0,
            time_sent: 0,
            dest,
            buf,
            padding: 0,
            probe: false,
            frags: Vec::new(),
            fifo_hint: 0,
        }
    }

    /// Bytes counted as in flight: header plus payload, padding excluded
    #[must_use]
    pub fn size(&self) -> usize {
        self.buf.len() - usize::from(self.padding)
    }

    /// Payload bytes after header and padding
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        let start = (HEADER_SIZE + usize::from(self.padding)).min(self.buf.len());
        &self.buf[start..]
    }

    /// Pad the packet so the IP datagram is `wanted` bytes.
    ///
    /// Returns false (leaving the packet untouched) if the packet already
    /// uses its offset byte, already reaches `wanted`, or the padding would
    /// not fit in the offset byte.
    pub fn probeify(&mut self, wanted: u16) -> bool {
        if self.probe || self.buf.len() < HEADER_SIZE || self.buf[3] != 0 {
            return false;
        }

        let on_wire = self.size() + ip_overhead(&self.dest);
        let Some(padding) = usize::from(wanted).checked_sub(on_wire) else {
            return false;
        };
        if padding == 0 || padding > MAX_PADDING {
            return false;
        }

        self.buf
            .splice(HEADER_SIZE..HEADER_SIZE, std::iter::repeat_n(0u8, padding));
        self.buf[3] = padding as u8;
        self.padding = padding as u8;
        self.probe = true;
        true
    }

    /// Strip probe padding so the packet can be resent at the confirmed MTU
    pub fn unprobeify(&mut self) {
        if !self.probe {
            return;
        }
        let padding = usize::from(self.padding);
        self.buf.drain(HEADER_SIZE..HEADER_SIZE + padding);
        self.buf[3] = 0;
        self.padding = 0;
        self.probe = false;
    }
}
