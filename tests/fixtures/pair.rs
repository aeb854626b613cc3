//! Two-peer harness over a [`SimNetwork`]
//!
//! Both engines read the same [`ManualClock`]. [`SimPair::pump`] polls the
//! sockets until no datagram is receivable and neither engine wants to
//! write; [`SimPair::tick`] moves time forward by one timer interval, fires
//! both timers and pumps again.
//!
//! # Example
//!
//! ```
//! use udx_core::UdxConfig;
//! use udx_integration_tests::fixtures::SimPair;
//!
//! let mut pair = SimPair::new(UdxConfig::default());
//! let (a, b) = pair.connect(1, 2);
//! pair.a.udx.stream_write_end(a, &[b"hello"]).unwrap();
//! assert!(pair.run_until(5_000, |p| p.b.ended(b)));
//! assert_eq!(pair.b.read_bytes(b), b"hello");
//! ```

use super::sim_net::SimNetwork;
use std::net::SocketAddr;
use udx_core::{CloseReason, Event, ManualClock, SocketId, StreamId, Udx, UdxConfig};

/// Address of peer A
pub const ADDR_A: &str = "10.0.0.1:4001";
/// Address of peer B
pub const ADDR_B: &str = "10.0.0.2:4002";

/// Upper bound on poll rounds per pump, in case something never quiesces
const MAX_PUMP_ROUNDS: usize = 10_000;

/// One engine with a single socket and everything it reported
pub struct Peer {
    /// The engine
    pub udx: Udx,
    /// Its socket
    pub socket: SocketId,
    /// The socket's address
    pub addr: SocketAddr,
    /// Events drained so far
    pub events: Vec<Event>,
}

impl Peer {
    fn new(config: UdxConfig, clock: &ManualClock, net: &SimNetwork, addr: SocketAddr) -> Self {
        let mut udx = Udx::with_clock(config, Box::new(clock.clone())).unwrap();
        let socket = udx.socket_attach(Box::new(net.socket(addr))).unwrap();
        Self {
            udx,
            socket,
            addr,
            events: Vec::new(),
        }
    }

    fn poll(&mut self) {
        if self.udx.socket_is_open(self.socket) {
            self.udx.poll_socket(self.socket, true, true).unwrap();
        }
        self.events.extend(self.udx.drain_events());
    }

    fn wants_write(&self) -> bool {
        self.udx.socket_wants_write(self.socket)
    }

    /// Concatenated in-order data read from `stream`
    #[must_use]
    pub fn read_bytes(&self, stream: StreamId) -> Vec<u8> {
        self.events
            .iter()
            .filter_map(|e| match e {
                Event::Read { stream: s, data } if *s == stream => Some(data.as_slice()),
                _ => None,
            })
            .flatten()
            .copied()
            .collect()
    }

    /// Number of in-order bytes read from `stream`
    #[must_use]
    pub fn read_len(&self, stream: StreamId) -> usize {
        self.events
            .iter()
            .map(|e| match e {
                Event::Read { stream: s, data } if *s == stream => data.len(),
                _ => 0,
            })
            .sum()
    }

    /// Messages received on `stream`
    #[must_use]
    pub fn messages(&self, stream: StreamId) -> Vec<Vec<u8>> {
        self.events
            .iter()
            .filter_map(|e| match e {
                Event::Message { stream: s, data } if *s == stream => Some(data.clone()),
                _ => None,
            })
            .collect()
    }

    /// Close reasons reported for `stream`, one per close event
    #[must_use]
    pub fn closes(&self, stream: StreamId) -> Vec<Option<CloseReason>> {
        self.events
            .iter()
            .filter_map(|e| match e {
                Event::Close { stream: s, reason } if *s == stream => Some(*reason),
                _ => None,
            })
            .collect()
    }

    /// Whether `stream` closed
    #[must_use]
    pub fn closed(&self, stream: StreamId) -> bool {
        !self.closes(stream).is_empty()
    }

    /// Whether the peer's end of `stream` was read
    #[must_use]
    pub fn ended(&self, stream: StreamId) -> bool {
        self.events
            .iter()
            .any(|e| matches!(e, Event::End { stream: s } if *s == stream))
    }

    /// Number of events matching `pred`
    pub fn count(&self, pred: impl Fn(&Event) -> bool) -> usize {
        self.events.iter().filter(|e| pred(e)).count()
    }
}

/// Two peers on one simulated network
pub struct SimPair {
    /// The network
    pub net: SimNetwork,
    /// Shared time
    pub clock: ManualClock,
    /// First peer
    pub a: Peer,
    /// Second peer
    pub b: Peer,
    interval: u64,
}

impl SimPair {
    /// Both peers using `config`
    #[must_use]
    pub fn new(config: UdxConfig) -> Self {
        super::init_tracing();
        let clock = ManualClock::new(1);
        let net = SimNetwork::new(clock.clone());
        let interval = config.timer_interval_ms;
        let a = Peer::new(config.clone(), &clock, &net, ADDR_A.parse().unwrap());
        let b = Peer::new(config, &clock, &net, ADDR_B.parse().unwrap());
        Self {
            net,
            clock,
            a,
            b,
            interval,
        }
    }

    /// Connect stream `a_id` on A with stream `b_id` on B, reading on both
    pub fn connect(&mut self, a_id: u32, b_id: u32) -> (StreamId, StreamId) {
        let a = self.a.udx.stream_init(a_id).unwrap();
        let b = self.b.udx.stream_init(b_id).unwrap();
        self.a
            .udx
            .stream_connect(a, self.a.socket, b_id, self.b.addr)
            .unwrap();
        self.b
            .udx
            .stream_connect(b, self.b.socket, a_id, self.a.addr)
            .unwrap();
        self.a.udx.stream_read_start(a).unwrap();
        self.b.udx.stream_read_start(b).unwrap();
        (a, b)
    }

    /// Exchange datagrams until nothing is receivable and nothing wants out
    pub fn pump(&mut self) {
        for _ in 0..MAX_PUMP_ROUNDS {
            self.a.poll();
            self.b.poll();

            let writing = !self.net.is_blocked() && (self.a.wants_write() || self.b.wants_write());
            if self.net.deliverable() == 0 && !writing {
                return;
            }
        }
    }

    /// Advance one timer interval
    pub fn tick(&mut self) {
        self.clock.advance(self.interval);
        self.a.udx.on_timer();
        self.b.udx.on_timer();
        self.pump();
    }

    /// Pump and tick until `done` holds or `limit_ms` of simulated time pass
    pub fn run_until(&mut self, limit_ms: u64, mut done: impl FnMut(&Self) -> bool) -> bool {
        self.pump();
        let mut elapsed = 0;
        while !done(self) {
            if elapsed >= limit_ms {
                return false;
            }
            self.tick();
            elapsed += self.interval;
        }
        true
    }

    /// Pump and tick for `ms` of simulated time
    pub fn run_for(&mut self, ms: u64) {
        self.run_until(ms, |_| false);
    }
}
