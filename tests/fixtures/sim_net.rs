//! Deterministic in-memory datagram network
//!
//! Every [`SimSocket`] created from one [`SimNetwork`] shares a set of
//! inboxes keyed by address. Datagrams become receivable `latency` ms after
//! they were sent, measured on a [`ManualClock`], so a test controls exactly
//! when packets arrive. A filter can drop, duplicate or delay individual
//! datagrams, and a path MTU can be enforced to exercise MTU probing.
//!
//! # Example
//!
//! ```
//! use udx_core::ManualClock;
//! use udx_integration_tests::fixtures::{SimNetwork, Verdict};
//!
//! let net = SimNetwork::new(ManualClock::new(1));
//! let mut sent = 0u64;
//! // Drop every fifth datagram
//! net.set_filter(move |_| {
//!     sent += 1;
//!     if sent % 5 == 0 { Verdict::Drop } else { Verdict::Deliver }
//! });
//! ```

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use udx_core::packet::ip_overhead;
use udx_core::{Clock, Header, ManualClock};
use udx_transport::{DEFAULT_BUFFER_SIZE, DEFAULT_TTL, DatagramSocket};

/// A datagram as it crossed the network
#[derive(Debug, Clone)]
pub struct Captured {
    /// Sender
    pub from: SocketAddr,
    /// Destination
    pub to: SocketAddr,
    /// Time-to-live the sender used
    pub ttl: u32,
    /// Payload
    pub data: Vec<u8>,
}

impl Captured {
    /// Stream header, if the datagram carries one
    #[must_use]
    pub fn header(&self) -> Option<Header> {
        Header::decode(&self.data).ok()
    }
}

/// What the network does with one datagram
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Deliver after the base latency
    Deliver,
    /// Lose it
    Drop,
    /// Deliver two copies
    Duplicate,
    /// Deliver after the base latency plus this many ms
    Delay(u64),
}

type Filter = Box<dyn FnMut(&Captured) -> Verdict + Send>;

struct InFlight {
    deliver_at: u64,
    order: u64,
    from: SocketAddr,
    data: Vec<u8>,
}

struct NetState {
    clock: ManualClock,
    latency: u64,
    inboxes: HashMap<SocketAddr, Vec<InFlight>>,
    filter: Option<Filter>,
    path_mtu: Option<usize>,
    link_mtu: Option<u32>,
    blocked: bool,
    next_order: u64,
    log: Vec<Captured>,
    dropped: usize,
}

/// Shared simulated network
#[derive(Clone)]
pub struct SimNetwork {
    state: Arc<Mutex<NetState>>,
}

impl SimNetwork {
    /// Network with zero latency on `clock`
    #[must_use]
    pub fn new(clock: ManualClock) -> Self {
        Self {
            state: Arc::new(Mutex::new(NetState {
                clock,
                latency: 0,
                inboxes: HashMap::new(),
                filter: None,
                path_mtu: None,
                link_mtu: None,
                blocked: false,
                next_order: 0,
                log: Vec::new(),
                dropped: 0,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, NetState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attach a socket at `addr`
    #[must_use]
    pub fn socket(&self, addr: SocketAddr) -> SimSocket {
        self.lock().inboxes.entry(addr).or_default();
        SimSocket {
            addr,
            net: self.clone(),
            ttl: AtomicU32::new(DEFAULT_TTL),
            recv_buffer: AtomicUsize::new(DEFAULT_BUFFER_SIZE),
            send_buffer: AtomicUsize::new(DEFAULT_BUFFER_SIZE),
        }
    }

    /// One-way delay in ms
    pub fn set_latency(&self, ms: u64) {
        self.lock().latency = ms;
    }

    /// Decide the fate of every subsequent datagram
    pub fn set_filter(&self, filter: impl FnMut(&Captured) -> Verdict + Send + 'static) {
        self.lock().filter = Some(Box::new(filter));
    }

    /// Deliver everything again
    pub fn clear_filter(&self) {
        self.lock().filter = None;
    }

    /// Silently drop datagrams whose IP size exceeds `mtu`
    pub fn set_path_mtu(&self, mtu: Option<usize>) {
        self.lock().path_mtu = mtu;
    }

    /// Link MTU the sockets report to the engine
    pub fn set_link_mtu(&self, mtu: Option<u32>) {
        self.lock().link_mtu = mtu;
    }

    /// Make every send fail with `WouldBlock`
    pub fn set_blocked(&self, blocked: bool) {
        self.lock().blocked = blocked;
    }

    /// Whether sends currently block
    #[must_use]
    pub fn is_blocked(&self) -> bool {
        self.lock().blocked
    }

    /// Every datagram offered to the network so far, in send order
    #[must_use]
    pub fn log(&self) -> Vec<Captured> {
        self.lock().log.clone()
    }

    /// Forget the send log
    pub fn clear_log(&self) {
        self.lock().log.clear();
    }

    /// Datagrams lost to the filter or the path MTU
    #[must_use]
    pub fn dropped(&self) -> usize {
        self.lock().dropped
    }

    /// Datagrams receivable right now, across all inboxes
    #[must_use]
    pub fn deliverable(&self) -> usize {
        let state = self.lock();
        let now = state.clock.now_ms();
        state
            .inboxes
            .values()
            .flat_map(|inbox| inbox.iter())
            .filter(|p| p.deliver_at <= now)
            .count()
    }

    /// Datagrams still travelling or waiting to be read
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.lock().inboxes.values().map(Vec::len).sum()
    }

    /// Inject a raw datagram, bypassing filter and log
    pub fn inject(&self, from: SocketAddr, to: SocketAddr, data: &[u8]) {
        let mut state = self.lock();
        let deliver_at = state.clock.now_ms();
        let order = state.next_order;
        state.next_order += 1;
        if let Some(inbox) = state.inboxes.get_mut(&to) {
            inbox.push(InFlight {
                deliver_at,
                order,
                from,
                data: data.to_vec(),
            });
        }
    }

    fn send(&self, from: SocketAddr, ttl: u32, data: &[u8], to: SocketAddr) -> io::Result<usize> {
        let mut state = self.lock();
        if state.blocked {
            return Err(io::ErrorKind::WouldBlock.into());
        }

        let captured = Captured {
            from,
            to,
            ttl,
            data: data.to_vec(),
        };
        let verdict = match state.filter.as_mut() {
            Some(filter) => filter(&captured),
            None => Verdict::Deliver,
        };
        state.log.push(captured);

        let too_big = state
            .path_mtu
            .is_some_and(|mtu| data.len() + ip_overhead(&to) > mtu);
        let copies = match verdict {
            _ if too_big => 0,
            Verdict::Drop => 0,
            Verdict::Duplicate => 2,
            Verdict::Deliver | Verdict::Delay(_) => 1,
        };
        if copies == 0 {
            tracing::trace!(%from, %to, len = data.len(), too_big, "datagram dropped");
            state.dropped += 1;
            return Ok(data.len());
        }

        let extra = match verdict {
            Verdict::Delay(ms) => ms,
            _ => 0,
        };
        let deliver_at = state.clock.now_ms() + state.latency + extra;
        for _ in 0..copies {
            let order = state.next_order;
            state.next_order += 1;
            // Unknown destinations swallow the datagram like a real network
            if let Some(inbox) = state.inboxes.get_mut(&to) {
                inbox.push(InFlight {
                    deliver_at,
                    order,
                    from,
                    data: data.to_vec(),
                });
            }
        }
        Ok(data.len())
    }

    fn recv(&self, addr: SocketAddr, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        let mut state = self.lock();
        let now = state.clock.now_ms();
        let inbox = state
            .inboxes
            .get_mut(&addr)
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;

        let next = inbox
            .iter()
            .enumerate()
            .filter(|(_, p)| p.deliver_at <= now)
            .min_by_key(|(_, p)| (p.deliver_at, p.order))
            .map(|(i, _)| i)
            .ok_or_else(|| io::Error::from(io::ErrorKind::WouldBlock))?;

        let packet = inbox.remove(next);
        let len = packet.data.len().min(buf.len());
        buf[..len].copy_from_slice(&packet.data[..len]);
        Ok((len, packet.from))
    }
}

/// One endpoint on a [`SimNetwork`]
pub struct SimSocket {
    addr: SocketAddr,
    net: SimNetwork,
    ttl: AtomicU32,
    recv_buffer: AtomicUsize,
    send_buffer: AtomicUsize,
}

impl DatagramSocket for SimSocket {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.addr)
    }

    fn try_send_to(&self, data: &[u8], dest: SocketAddr) -> io::Result<usize> {
        self.net
            .send(self.addr, self.ttl.load(Ordering::Relaxed), data, dest)
    }

    fn try_recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.net.recv(self.addr, buf)
    }

    fn ttl(&self) -> io::Result<u32> {
        Ok(self.ttl.load(Ordering::Relaxed))
    }

    fn set_ttl(&self, ttl: u32) -> io::Result<()> {
        self.ttl.store(ttl, Ordering::Relaxed);
        Ok(())
    }

    fn recv_buffer_size(&self) -> io::Result<usize> {
        Ok(self.recv_buffer.load(Ordering::Relaxed))
    }

    fn set_recv_buffer_size(&self, size: usize) -> io::Result<()> {
        self.recv_buffer.store(size, Ordering::Relaxed);
        Ok(())
    }

    fn send_buffer_size(&self) -> io::Result<usize> {
        Ok(self.send_buffer.load(Ordering::Relaxed))
    }

    fn set_send_buffer_size(&self, size: usize) -> io::Result<()> {
        self.send_buffer.store(size, Ordering::Relaxed);
        Ok(())
    }

    fn path_mtu(&self, _dest: SocketAddr) -> Option<u32> {
        self.net.lock().link_mtu
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_latency_and_order() {
        let clock = ManualClock::new(1);
        let net = SimNetwork::new(clock.clone());
        net.set_latency(10);
        let a = net.socket(addr("10.0.0.1:1"));
        let b = net.socket(addr("10.0.0.2:2"));

        a.try_send_to(b"one", b.addr).unwrap();
        a.try_send_to(b"two", b.addr).unwrap();

        let mut buf = [0u8; 16];
        assert_eq!(
            b.try_recv_from(&mut buf).unwrap_err().kind(),
            io::ErrorKind::WouldBlock
        );
        clock.advance(10);
        assert_eq!(b.try_recv_from(&mut buf).unwrap(), (3, a.addr));
        assert_eq!(&buf[..3], b"one");
        assert_eq!(b.try_recv_from(&mut buf).unwrap().0, 3);
        assert_eq!(&buf[..3], b"two");
    }

    #[test]
    fn test_filter_and_path_mtu() {
        let net = SimNetwork::new(ManualClock::new(1));
        let a = net.socket(addr("10.0.0.1:1"));
        let b = net.socket(addr("10.0.0.2:2"));
        net.set_filter(|c| {
            if c.data == b"dup" {
                Verdict::Duplicate
            } else if c.data == b"drop" {
                Verdict::Drop
            } else {
                Verdict::Deliver
            }
        });
        net.set_path_mtu(Some(28 + 100));

        a.try_send_to(b"dup", b.addr).unwrap();
        a.try_send_to(b"drop", b.addr).unwrap();
        a.try_send_to(&[0u8; 101], b.addr).unwrap();
        a.try_send_to(&[0u8; 100], b.addr).unwrap();

        assert_eq!(net.log().len(), 4);
        assert_eq!(net.dropped(), 2);
        assert_eq!(net.deliverable(), 3);
    }

    #[test]
    fn test_blocked_send() {
        let net = SimNetwork::new(ManualClock::new(1));
        let a = net.socket(addr("10.0.0.1:1"));
        net.set_blocked(true);
        let err = a.try_send_to(b"x", addr("10.0.0.2:2")).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
        assert!(net.log().is_empty());
    }
}
