//! UDP endpoints owned by the engine.

use crate::arena::{Arena, Handle};
use crate::event::SocketId;
use crate::fifo::Fifo;
use crate::packet::Packet;
use std::net::{IpAddr, SocketAddr};
use udx_transport::DatagramSocket;

/// Address family a socket was bound with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    /// IPv4 only
    V4,
    /// IPv6, accepting IPv4 peers as mapped addresses
    V6,
}

/// A bound datagram socket and its raw send queue
pub(crate) struct Socket {
    pub(crate) id: SocketId,
    pub(crate) io: Box<dyn DatagramSocket>,
    pub(crate) family: Family,
    pub(crate) ttl: u32,
    pub(crate) receiving: bool,
    pub(crate) closing: bool,
    pub(crate) closing_handles: bool,
    pub(crate) send_queue: Fifo<Handle>,
    pub(crate) queued: Arena<Packet>,
}

impl Socket {
    pub(crate) fn new(handle: Handle, io: Box<dyn DatagramSocket>, local: SocketAddr, ttl: u32) -> Self {
        Self {
            id: SocketId(handle),
            io,
            family: if local.is_ipv4() { Family::V4 } else { Family::V6 },
            ttl,
            receiving: false,
            closing: false,
            closing_handles: false,
            send_queue: Fifo::new(4),
            queued: Arena::new(),
        }
    }

    /// Destination as the socket must see it
    pub(crate) fn map_dest(&self, dest: SocketAddr) -> SocketAddr {
        match (self.family, dest) {
            (Family::V6, SocketAddr::V4(v4)) => {
                SocketAddr::new(IpAddr::V6(v4.ip().to_ipv6_mapped()), v4.port())
            }
            _ => dest,
        }
    }

    /// Queue a prebuilt packet for the next writable pass
    pub(crate) fn enqueue(&mut self, pkt: Packet) {
        let key = self.queued.insert(pkt);
        self.send_queue.push(key);
    }
}

/// Sender as callers should see it: IPv4-mapped addresses become IPv4
#[must_use]
pub fn unmap(addr: SocketAddr) -> SocketAddr {
    match addr {
        SocketAddr::V6(v6) => match v6.ip().to_ipv4_mapped() {
            Some(v4) => SocketAddr::new(IpAddr::V4(v4), v6.port()),
            None => addr,
        },
        SocketAddr::V4(_) => addr,
    }
}
