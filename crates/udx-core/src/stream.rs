//! Per-stream protocol state.
//!
//! A [`Stream`] holds everything one reliable connection needs: sequence
//! counters, the sent and received windows, queued writes, congestion and RTT
//! state and the MTU prober. The methods here only touch the stream itself;
//! anything that reaches across streams or sockets (closing, relaying,
//! routing) lives on [`Udx`](crate::Udx).

use crate::arena::{Arena, Handle};
use crate::cirbuf::Cirbuf;
use crate::config::UdxConfig;
use crate::congestion::Congestion;
use crate::error::{Error, Result};
use crate::event::{CloseReason, Completion, Event, Firewall, SendId, StreamId, WriteId};
use crate::fifo::Fifo;
use crate::header::{Header, HeaderFlags, PacketView, push_sack_range};
use crate::mtu::MtuProber;
use crate::packet::{
    self, Fragment, IPV6_OVERHEAD, Packet, PacketKind, PacketStatus, RetransmitKind, WbufRef,
};
use crate::rtt::{Rack, RttEstimator, sent_after};
use crate::seq::{seq_diff, seq_le, seq_lt, seq_max};
use std::collections::VecDeque;
use std::net::SocketAddr;

/// Sequence numbers scanned past `ack` when building SACK ranges
const SACK_SCAN_LIMIT: u32 = 65_536;

/// SACK bytes per acknowledgement packet
const SACK_PAYLOAD_LIMIT: usize = 400;

// ============================================================================
// State
// ============================================================================

/// Connection phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Initialized, no peer yet
    Idle,
    /// Bound to a socket and peer
    Connected,
    /// Torn down; terminal
    Closed,
}

/// Progress of one direction's end of stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndState {
    /// Still open
    Open,
    /// END queued (local) or received out of order (remote)
    Ending,
    /// END acknowledged (local) or read up to (remote)
    Ended,
}

/// Abort progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Teardown {
    /// Not aborted
    Alive,
    /// DESTROY packet queued
    Destroying,
    /// Destroyed locally
    Destroyed,
    /// Destroyed by the peer
    DestroyedRemote,
}

/// Snapshot of a stream's state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamState {
    /// Connection phase
    pub phase: Phase,
    /// Our write side
    pub local_end: EndState,
    /// The peer's write side
    pub remote_end: EndState,
    /// Abort progress
    pub teardown: Teardown,
    /// Read events enabled
    pub reading: bool,
    /// Message events enabled
    pub receiving: bool,
}

/// Counters for observability and tests
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamStats {
    /// Congestion window in packets
    pub cwnd: u32,
    /// Slow start threshold in packets
    pub ssthresh: u32,
    /// Smoothed RTT (ms)
    pub srtt: u32,
    /// RTT variance (ms)
    pub rttvar: u32,
    /// Retransmission timeout (ms)
    pub rto: u32,
    /// Confirmed path MTU
    pub mtu: u16,
    /// Packets in flight
    pub pkts_inflight: u32,
    /// Bytes in flight
    pub inflight: usize,
    /// Retransmissions sent
    pub retransmits: u64,
    /// Next sequence number to send
    pub seq: u32,
    /// Next sequence number expected
    pub ack: u32,
    /// Lowest unacknowledged sequence number
    pub remote_acked: u32,
    /// Write bytes not yet acknowledged
    pub queued_bytes: usize,
}

// ============================================================================
// Writes
// ============================================================================

/// One caller buffer of a write request
#[derive(Debug, Clone)]
pub(crate) struct WriteBuf {
    pub(crate) data: Vec<u8>,
    pub(crate) bytes_inflight: usize,
    pub(crate) bytes_acked: usize,
    pub(crate) is_write_end: bool,
}

impl WriteBuf {
    fn taken(&self) -> bool {
        self.bytes_acked + self.bytes_inflight == self.data.len()
    }
}

/// A write request; completes once every byte is acknowledged
#[derive(Debug, Clone)]
pub(crate) struct WriteRequest {
    pub(crate) serial: u64,
    pub(crate) size: usize,
    pub(crate) bytes_acked: usize,
    pub(crate) bufs: Vec<WriteBuf>,
}

/// Out-of-order data waiting for the gap before it
#[derive(Debug, Clone)]
pub(crate) struct PendingRead {
    pub(crate) flags: HeaderFlags,
    pub(crate) data: Vec<u8>,
}

/// Result of acknowledging one sequence number
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Acked {
    /// Nothing outstanding under that number
    Missing,
    /// A packet was retired
    Delivered,
    /// The stream ended or died; stop processing acks
    Finished,
}

/// What the instance must do after a packet was processed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Disposition {
    Done,
    Close(Option<CloseReason>),
}

// ============================================================================
// Stream
// ============================================================================

/// One reliable ordered connection
pub(crate) struct Stream {
    pub(crate) id: StreamId,
    pub(crate) local_id: u32,
    pub(crate) remote_id: u32,
    pub(crate) socket: Option<Handle>,
    pub(crate) remote_addr: Option<SocketAddr>,

    pub(crate) phase: Phase,
    pub(crate) local_end: EndState,
    pub(crate) remote_end: EndState,
    pub(crate) teardown: Teardown,
    pub(crate) reading: bool,
    pub(crate) receiving: bool,
    pub(crate) want_state: bool,
    pub(crate) want_destroy: bool,

    pub(crate) seq: u32,
    pub(crate) ack: u32,
    pub(crate) remote_acked: u32,
    pub(crate) remote_ended: u32,

    pub(crate) out_of_order: u32,
    pub(crate) pkts_buffered: u32,
    pub(crate) recovery: u32,
    pub(crate) sacks: u32,
    pub(crate) pkts_inflight: u32,
    pub(crate) inflight: usize,
    pub(crate) retransmits: u64,
    pub(crate) rto_timeout: u64,

    pub(crate) rtt: RttEstimator,
    pub(crate) rack: Rack,
    pub(crate) congestion: Congestion,
    pub(crate) mtu: MtuProber,

    pub(crate) outgoing: Cirbuf<Packet>,
    pub(crate) incoming: Cirbuf<PendingRead>,
    pub(crate) retransmit_queue: Fifo<u32>,

    pub(crate) writes: Arena<WriteRequest>,
    pub(crate) write_queue: Fifo<WbufRef>,
    pub(crate) writes_queued_bytes: usize,
    pub(crate) hit_high_watermark: bool,
    next_write_serial: u64,

    pub(crate) messages: Arena<Packet>,
    pub(crate) unordered: Fifo<Handle>,

    pub(crate) remote_changing: bool,
    pub(crate) seq_on_remote_changed: u32,

    pub(crate) relayed: bool,
    pub(crate) relay_to: Option<Handle>,
    pub(crate) relaying: Cirbuf<Handle>,

    pub(crate) firewall: Option<Box<dyn Firewall>>,

    high_watermark: usize,
    max_transmits: u8,
    max_combined_writes: usize,
    mtu_max: u16,
}

impl Stream {
    pub(crate) fn new(handle: Handle, local_id: u32, config: &UdxConfig, now: u64) -> Self {
        let rtt = RttEstimator::new(
            config.initial_rto_ms,
            config.min_rto_ms,
            config.clock_granularity_ms,
        );
        let rto_timeout = now + u64::from(rtt.rto());

        Self {
            id: StreamId(handle),
            local_id,
            remote_id: 0,
            socket: None,
            remote_addr: None,
            phase: Phase::Idle,
            local_end: EndState::Open,
            remote_end: EndState::Open,
            teardown: Teardown::Alive,
            reading: false,
            receiving: false,
            want_state: false,
            want_destroy: false,
            seq: 0,
            ack: 0,
            remote_acked: 0,
            remote_ended: 0,
            out_of_order: 0,
            pkts_buffered: 0,
            recovery: 0,
            sacks: 0,
            pkts_inflight: 0,
            inflight: 0,
            retransmits: 0,
            rto_timeout,
            rtt,
            rack: Rack::default(),
            congestion: Congestion::new(
                config.initial_cwnd,
                config.initial_ssthresh,
                config.max_cwnd,
            ),
            mtu: MtuProber::new(
                config.mtu_base,
                config.mtu_max,
                config.mtu_step,
                config.mtu_max_probes,
            ),
            outgoing: Cirbuf::new(16),
            incoming: Cirbuf::new(16),
            retransmit_queue: Fifo::new(1),
            writes: Arena::new(),
            write_queue: Fifo::new(1),
            writes_queued_bytes: 0,
            hit_high_watermark: false,
            next_write_serial: 0,
            messages: Arena::new(),
            unordered: Fifo::new(1),
            remote_changing: false,
            seq_on_remote_changed: 0,
            relayed: false,
            relay_to: None,
            relaying: Cirbuf::new(2),
            firewall: None,
            high_watermark: config.high_watermark,
            max_transmits: config.max_transmits,
            max_combined_writes: config.max_combined_writes,
            mtu_max: config.mtu_max,
        }
    }

    // ------------------------------------------------------------------------
    // Predicates
    // ------------------------------------------------------------------------

    pub(crate) fn is_connected(&self) -> bool {
        self.phase == Phase::Connected
    }

    /// Destroying, destroyed either way, or closed
    pub(crate) fn is_dead(&self) -> bool {
        self.teardown != Teardown::Alive || self.phase == Phase::Closed
    }

    fn should_read(&self) -> bool {
        self.remote_end != EndState::Ended && !self.is_dead()
    }

    /// Eligible to produce the next packet on its socket
    pub(crate) fn write_wanted(&self) -> bool {
        if !self.is_connected() {
            return false;
        }
        if self.want_state || self.want_destroy {
            return true;
        }
        if self.pkts_inflight >= self.congestion.cwnd() {
            return false;
        }
        if !self.unordered.is_empty() {
            return true;
        }
        !self.is_dead() && (!self.write_queue.is_empty() || !self.retransmit_queue.is_empty())
    }

    /// Anything still waiting to leave through the socket
    pub(crate) fn has_pending_output(&self) -> bool {
        !self.unordered.is_empty()
            || !self.write_queue.is_empty()
            || !self.retransmit_queue.is_empty()
            || self.want_state
            || self.want_destroy
    }

    pub(crate) fn max_payload(&self) -> usize {
        match &self.remote_addr {
            Some(addr) => packet::max_payload(self.mtu.mtu(), addr),
            None => usize::from(self.mtu.mtu())
                .saturating_sub(IPV6_OVERHEAD + crate::header::HEADER_SIZE),
        }
    }

    pub(crate) fn cwnd_bytes(&self) -> usize {
        self.congestion.cwnd() as usize * self.max_payload()
    }

    fn over_watermark(&self) -> bool {
        self.writes_queued_bytes > self.high_watermark + self.cwnd_bytes()
    }

    pub(crate) fn state(&self) -> StreamState {
        StreamState {
            phase: self.phase,
            local_end: self.local_end,
            remote_end: self.remote_end,
            teardown: self.teardown,
            reading: self.reading,
            receiving: self.receiving,
        }
    }

    pub(crate) fn stats(&self) -> StreamStats {
        StreamStats {
            cwnd: self.congestion.cwnd(),
            ssthresh: self.congestion.ssthresh(),
            srtt: self.rtt.srtt(),
            rttvar: self.rtt.rttvar(),
            rto: self.rtt.rto(),
            mtu: self.mtu.mtu(),
            pkts_inflight: self.pkts_inflight,
            inflight: self.inflight,
            retransmits: self.retransmits,
            seq: self.seq,
            ack: self.ack,
            remote_acked: self.remote_acked,
            queued_bytes: self.writes_queued_bytes,
        }
    }

    fn header(&self, flags: HeaderFlags) -> Header {
        Header::new(flags, self.remote_id, self.seq, self.ack)
    }

    // ------------------------------------------------------------------------
    // Addressing
    // ------------------------------------------------------------------------

    /// Bind to `socket` and the peer. `link_mtu` caps the MTU search.
    pub(crate) fn connect(
        &mut self,
        socket: Handle,
        remote_id: u32,
        addr: SocketAddr,
        link_mtu: Option<u32>,
    ) {
        self.phase = Phase::Connected;
        self.remote_id = remote_id;
        self.socket = Some(socket);
        self.remote_addr = Some(addr);
        self.mtu.set_max(self.search_max(link_mtu));
    }

    /// Move to a new socket, peer or remote id.
    ///
    /// Returns true when nothing was in flight, so the change is complete.
    pub(crate) fn change_remote(
        &mut self,
        socket: Handle,
        remote_id: u32,
        addr: SocketAddr,
        link_mtu: Option<u32>,
    ) -> bool {
        self.remote_addr = Some(addr);
        self.remote_id = remote_id;
        self.socket = Some(socket);
        let max = self.search_max(link_mtu);
        self.mtu.reset(max);

        if self.seq != self.remote_acked {
            tracing::debug!(
                "{}: remote changing, waiting for acks up to {} (acked {})",
                self.id,
                self.seq,
                self.remote_acked
            );
            self.remote_changing = true;
            self.seq_on_remote_changed = self.seq;
            false
        } else {
            true
        }
    }

    fn search_max(&self, link_mtu: Option<u32>) -> u16 {
        link_mtu
            .and_then(|mtu| u16::try_from(mtu).ok())
            .map_or(self.mtu_max, |mtu| mtu.min(self.mtu_max))
    }

    // ------------------------------------------------------------------------
    // Writing
    // ------------------------------------------------------------------------

    /// Queue caller buffers as one write request.
    ///
    /// Returns the request and whether the caller may keep writing.
    pub(crate) fn enqueue_write(
        &mut self,
        bufs: &[&[u8]],
        end: bool,
        now: u64,
    ) -> Result<(WriteId, bool)> {
        let mut wbufs: Vec<WriteBuf> = bufs
            .iter()
            .filter(|b| !b.is_empty())
            .map(|b| WriteBuf {
                data: b.to_vec(),
                bytes_inflight: 0,
                bytes_acked: 0,
                is_write_end: false,
            })
            .collect();

        if end {
            if wbufs.is_empty() {
                wbufs.push(WriteBuf {
                    data: Vec::new(),
                    bytes_inflight: 0,
                    bytes_acked: 0,
                    is_write_end: false,
                });
            }
            if let Some(last) = wbufs.last_mut() {
                last.is_write_end = true;
            }
            if self.local_end == EndState::Open {
                self.local_end = EndState::Ending;
            }
        } else {
            if wbufs.is_empty() {
                return Err(Error::invalid("write needs at least one non-empty buffer"));
            }
            if self.inflight == 0 {
                self.rto_timeout = now + u64::from(self.rtt.rto());
            }
        }

        let size = wbufs.iter().map(|b| b.data.len()).sum();
        let count = wbufs.len();
        let serial = self.next_write_serial;
        self.next_write_serial += 1;

        let handle = self.writes.insert(WriteRequest {
            serial,
            size,
            bytes_acked: 0,
            bufs: wbufs,
        });
        for index in 0..count {
            self.write_queue.push(WbufRef {
                write: handle,
                index: index as u32,
            });
        }
        self.writes_queued_bytes += size;

        let more = if self.over_watermark() {
            self.hit_high_watermark = true;
            false
        } else {
            true
        };

        tracing::trace!(
            "{}: write #{} of {} bytes (end={}, queued={})",
            self.id,
            serial,
            size,
            end,
            self.writes_queued_bytes
        );

        Ok((WriteId(handle), more))
    }

    /// Queue an unordered message
    pub(crate) fn enqueue_message(&mut self, data: &[u8], send: SendId) -> Result<()> {
        let dest = self.remote_addr.ok_or(Error::NotConnected)?;
        let flags = HeaderFlags::new().with(HeaderFlags::MESSAGE);
        let pkt = Packet::stream(PacketKind::Message(send), &self.header(flags), data, dest);
        let key = self.messages.insert(pkt);
        self.unordered.push(key);
        Ok(())
    }

    /// Credit `bytes` of one buffer, completing its request when fully acked
    fn credit(
        &mut self,
        wbuf: WbufRef,
        bytes: usize,
        status: Completion,
        sacked: bool,
        events: &mut VecDeque<Event>,
    ) {
        let Some(write) = self.writes.get_mut(wbuf.write) else {
            return;
        };
        if let Some(buf) = write.bufs.get_mut(wbuf.index as usize) {
            if status == Completion::Completed {
                buf.bytes_inflight = buf.bytes_inflight.saturating_sub(bytes);
            }
            buf.bytes_acked += bytes;
        }
        write.bytes_acked += bytes;
        let done = write.bytes_acked >= write.size;

        self.writes_queued_bytes = self.writes_queued_bytes.saturating_sub(bytes);

        if self.hit_high_watermark
            && self.writes_queued_bytes < self.high_watermark + self.cwnd_bytes()
        {
            self.hit_high_watermark = false;
            events.push_back(Event::Drain { stream: self.id });
        }

        if done {
            // Removing the request retires the handle, so a trailing empty
            // buffer can never complete it twice
            self.writes.remove(wbuf.write);
            events.push_back(Event::WriteAck {
                stream: self.id,
                write: WriteId(wbuf.write),
                status,
                sacked,
            });
        }
    }

    // ------------------------------------------------------------------------
    // Packet construction
    // ------------------------------------------------------------------------

    /// Pure acknowledgement carrying SACK ranges for buffered data
    pub(crate) fn build_state_packet(&mut self) -> Option<Packet> {
        let dest = self.remote_addr?;
        let mut sacks = Vec::new();
        let mut range: Option<(u32, u32)> = None;
        let mut ooo = self.out_of_order;
        let mut i = 0;

        while i < SACK_SCAN_LIMIT && ooo > 0 && sacks.len() < SACK_PAYLOAD_LIMIT {
            let seq = self.ack.wrapping_add(1).wrapping_add(i);
            i += 1;
            if !self.incoming.contains(seq) {
                continue;
            }
            ooo -= 1;

            range = match range {
                None => Some((seq, seq.wrapping_add(1))),
                Some((start, end)) if seq == end => Some((start, end.wrapping_add(1))),
                Some((start, end)) => {
                    push_sack_range(&mut sacks, start, end);
                    Some((seq, seq.wrapping_add(1)))
                }
            };
        }
        if let Some((start, end)) = range {
            push_sack_range(&mut sacks, start, end);
        }

        let flags = if sacks.is_empty() {
            HeaderFlags::new()
        } else {
            HeaderFlags::new().with(HeaderFlags::SACK)
        };

        self.want_state = false;
        Some(Packet::stream(
            PacketKind::State,
            &self.header(flags),
            &sacks,
            dest,
        ))
    }

    pub(crate) fn build_destroy_packet(&mut self) -> Option<Packet> {
        let dest = self.remote_addr?;
        let flags = HeaderFlags::new().with(HeaderFlags::DESTROY);
        let pkt = Packet::stream(PacketKind::Destroy, &self.header(flags), &[], dest);
        self.seq = self.seq.wrapping_add(1);
        self.want_destroy = false;
        Some(pkt)
    }

    /// Fill one packet from the head of the write queue
    pub(crate) fn next_data_packet(&mut self) -> Option<Packet> {
        let dest = self.remote_addr?;
        let mut capacity = self.max_payload();
        let mut flags = HeaderFlags::new();
        let mut payload = Vec::with_capacity(capacity);
        let mut frags = Vec::new();

        while capacity > 0 && frags.len() < self.max_combined_writes {
            let Some(wref) = self.write_queue.peek() else {
                break;
            };
            let Some(buf) = self
                .writes
                .get_mut(wref.write)
                .and_then(|w| w.bufs.get_mut(wref.index as usize))
            else {
                tracing::warn!("{}: dropping stale write buffer from queue", self.id);
                self.write_queue.shift();
                continue;
            };

            let offset = buf.bytes_acked + buf.bytes_inflight;
            let len = capacity.min(buf.data.len() - offset);
            payload.extend_from_slice(&buf.data[offset..offset + len]);
            buf.bytes_inflight += len;
            capacity -= len;
            frags.push(Fragment { wbuf: wref, len });

            if !payload.is_empty() {
                flags.insert(HeaderFlags::DATA);
            }
            if buf.taken() {
                if buf.is_write_end {
                    flags.insert(HeaderFlags::END);
                }
                self.write_queue.shift();
            }
        }

        if !flags.intersects(HeaderFlags::DATA | HeaderFlags::END) {
            self.undo_fragments(&frags);
            return None;
        }

        let mut pkt = Packet::stream(PacketKind::Write, &self.header(flags), &payload, dest);
        pkt.frags = frags;
        self.seq = self.seq.wrapping_add(1);

        if let Some(size) = self.mtu.wanted() {
            if pkt.probeify(size) {
                self.mtu.on_probe_sent();
                tracing::debug!(
                    "{}: mtu probe seq={} padded to {}",
                    self.id,
                    pkt.seq,
                    size
                );
            }
        }

        self.pkts_inflight += 1;
        self.inflight += pkt.size();
        Some(pkt)
    }

    /// Next lost packet to resend, counted back into flight
    pub(crate) fn shift_retransmit(&mut self) -> Option<u32> {
        while let Some(seq) = self.retransmit_queue.shift() {
            let Some(pkt) = self.outgoing.get(seq) else {
                continue;
            };
            if matches!(pkt.status, PacketStatus::Retransmit(_)) {
                self.pkts_inflight += 1;
                self.inflight += pkt.size();
                return Some(seq);
            }
        }
        None
    }

    // ------------------------------------------------------------------------
    // Send outcomes
    // ------------------------------------------------------------------------

    /// A fresh data packet could not be sent; roll back its construction
    pub(crate) fn unshift_fresh(&mut self, pkt: Packet) {
        if pkt.seq.wrapping_add(1) == self.seq {
            self.seq = pkt.seq;
        }
        self.pkts_inflight = self.pkts_inflight.saturating_sub(1);
        self.inflight = self.inflight.saturating_sub(pkt.size());
        self.undo_fragments(&pkt.frags);
        if pkt.probe {
            self.mtu.on_probe_unsent();
        }
    }

    /// A retransmission could not be sent; it goes back to the queue head
    pub(crate) fn unshift_retransmit(&mut self, seq: u32) {
        let size = self.outgoing.get(seq).map_or(0, Packet::size);
        self.pkts_inflight = self.pkts_inflight.saturating_sub(1);
        self.inflight = self.inflight.saturating_sub(size);
        self.retransmit_queue.undo();
    }

    fn undo_fragments(&mut self, frags: &[Fragment]) {
        for frag in frags {
            let Some(buf) = self
                .writes
                .get_mut(frag.wbuf.write)
                .and_then(|w| w.bufs.get_mut(frag.wbuf.index as usize))
            else {
                continue;
            };
            if buf.taken() {
                self.write_queue.undo();
            }
            buf.bytes_inflight -= frag.len;
        }
    }

    pub(crate) fn confirm_fresh(&mut self, mut pkt: Packet, now: u64) {
        pkt.transmits = 1;
        pkt.status = PacketStatus::Inflight;
        pkt.time_sent = now;
        let seq = pkt.seq;
        if self.outgoing.set(seq, pkt).is_some() {
            tracing::warn!("{}: replaced outstanding packet seq={}", self.id, seq);
        }
    }

    pub(crate) fn confirm_retransmit(&mut self, seq: u32, now: u64) {
        let Some(pkt) = self.outgoing.get_mut(seq) else {
            return;
        };
        // Fast retransmits do not count towards the timeout limit
        if pkt.transmits == 0 || pkt.status == PacketStatus::Retransmit(RetransmitKind::Slow) {
            pkt.transmits = pkt.transmits.saturating_add(1);
        }
        pkt.status = PacketStatus::Inflight;
        pkt.time_sent = now;
        self.retransmits += 1;
        tracing::trace!(
            "{}: retransmitted seq={} transmits={}",
            self.id,
            seq,
            pkt.transmits
        );
    }

    // ------------------------------------------------------------------------
    // Receiving
    // ------------------------------------------------------------------------

    /// Process a stream packet addressed to us
    pub(crate) fn on_packet(
        &mut self,
        view: &PacketView<'_>,
        now: u64,
        events: &mut VecDeque<Event>,
    ) -> Disposition {
        let header = view.header;
        let flags = header.flags;
        let carries_data = flags.intersects(HeaderFlags::DATA | HeaderFlags::END);

        let sacked = flags.is_sack() && self.process_sacks(view, now, events) > 0;

        let payload = match view.checked_payload() {
            Ok(payload) => payload,
            Err(e) => {
                tracing::trace!("{}: dropping payload: {}", self.id, e);
                return Disposition::Done;
            }
        };

        if seq_le(self.ack, header.seq) {
            if carries_data && !self.incoming.contains(header.seq) && self.should_read() {
                self.process_data(flags, header.seq, payload, events);
            }

            if flags.is_end() {
                if self.remote_end == EndState::Open {
                    self.remote_end = EndState::Ending;
                }
                self.remote_ended = header.seq;
            }

            if flags.is_destroy() {
                tracing::debug!("{}: destroyed by peer", self.id);
                self.teardown = Teardown::DestroyedRemote;
                return Disposition::Close(Some(CloseReason::ConnectionReset));
            }
        }

        if flags.is_message() && self.receiving {
            events.push_back(Event::Message {
                stream: self.id,
                data: payload.to_vec(),
            });
        }

        while self.should_read() {
            let Some(pending) = self.incoming.remove(self.ack) else {
                break;
            };
            self.out_of_order -= 1;
            self.pkts_buffered -= 1;
            self.ack = self.ack.wrapping_add(1);

            if pending.flags.is_data() && self.reading {
                events.push_back(Event::Read {
                    stream: self.id,
                    data: pending.data,
                });
            }
        }

        // Acks for packets we never sent
        if seq_lt(self.seq, header.ack) {
            return Disposition::Done;
        }

        if self.remote_changing && seq_diff(header.ack, self.seq_on_remote_changed) >= 0 {
            tracing::debug!("{}: old remote acked up to {}", self.id, header.ack);
            self.remote_changing = false;
            events.push_back(Event::RemoteChanged { stream: self.id });
        }

        let len = seq_diff(header.ack, self.remote_acked);
        let mut limited = self.recovery > 0;

        for _ in 0..len.max(0) {
            if self.recovery > 0 {
                self.recovery -= 1;
                if self.recovery == 0 {
                    self.congestion.end_recovery();
                    tracing::debug!(
                        "{}: fast recovery ended cwnd={} inflight={}",
                        self.id,
                        self.congestion.cwnd(),
                        self.inflight
                    );
                }
            }

            let seq = self.remote_acked;
            self.remote_acked = seq.wrapping_add(1);

            if self.ack_packet(seq, false, now, events) == Acked::Finished {
                self.want_state = true;
                return Disposition::Close(None);
            }
        }

        // Application limited unless a full packet beyond the queue still fits
        if !limited {
            limited = self.writes_queued_bytes + self.max_payload() < self.cwnd_bytes();
        }

        if len > 0 {
            self.rto_timeout = now + u64::from(self.rtt.rto());
            self.congestion.on_ack(
                len as u32,
                self.rtt.srtt(),
                now,
                limited || self.recovery > 0,
            );
            self.rack_detect_loss(now);
        } else if sacked {
            self.rack_detect_loss(now);
        }

        if carries_data {
            self.want_state = true;
        }

        if self.remote_end == EndState::Ending
            && !self.is_dead()
            && seq_le(self.remote_ended, self.ack)
        {
            self.remote_end = EndState::Ended;
            tracing::debug!("{}: remote ended at {}", self.id, self.remote_ended);
            if self.reading {
                events.push_back(Event::End { stream: self.id });
            }
        } else if self.pkts_inflight > 0 && self.check_timeouts(now) {
            return Disposition::Close(Some(CloseReason::TimedOut));
        }

        Disposition::Done
    }

    fn process_data(
        &mut self,
        flags: HeaderFlags,
        seq: u32,
        payload: &[u8],
        events: &mut VecDeque<Event>,
    ) {
        if seq == self.ack && flags.bits() == HeaderFlags::DATA {
            self.ack = self.ack.wrapping_add(1);
            self.want_state = true;
            if self.reading {
                events.push_back(Event::Read {
                    stream: self.id,
                    data: payload.to_vec(),
                });
            }
            return;
        }

        self.out_of_order += 1;
        self.pkts_buffered += 1;
        self.incoming.set(
            seq,
            PendingRead {
                flags,
                data: payload.to_vec(),
            },
        );
    }

    /// Acknowledge every outstanding packet named by the SACK ranges.
    ///
    /// Returns the number of packets retired, or zero if the stream ended.
    fn process_sacks(
        &mut self,
        view: &PacketView<'_>,
        now: u64,
        events: &mut VecDeque<Event>,
    ) -> u32 {
        let mut n = 0;

        for (start, end) in view.sack_ranges() {
            if seq_diff(end, start) <= 0 {
                continue;
            }
            // Only [remote_acked, seq) can hold anything to retire
            let mut seq = seq_max(start, self.remote_acked);
            let end = if seq_lt(self.seq, end) { self.seq } else { end };

            while seq_lt(seq, end) {
                match self.ack_packet(seq, true, now, events) {
                    Acked::Finished => return 0,
                    Acked::Delivered => n += 1,
                    Acked::Missing => {}
                }
                seq = seq.wrapping_add(1);
            }
        }

        n
    }

    /// Retire the packet `seq`, crediting its write fragments
    pub(crate) fn ack_packet(
        &mut self,
        seq: u32,
        sack: bool,
        now: u64,
        events: &mut VecDeque<Event>,
    ) -> Acked {
        let Some(pkt) = self.outgoing.remove(seq) else {
            if !sack {
                // Selectively acked earlier
                self.sacks = self.sacks.saturating_sub(1);
            }
            return Acked::Missing;
        };

        if let Some(mtu) = self.mtu.on_ack(pkt.probe) {
            tracing::debug!("{}: mtu probe seq={} acked, mtu={}", self.id, seq, mtu);
        }

        if sack {
            self.sacks += 1;
        }

        if matches!(pkt.status, PacketStatus::Retransmit(_)) {
            self.retransmit_queue.remove(seq, pkt.fifo_hint);
        } else {
            self.pkts_inflight = self.pkts_inflight.saturating_sub(1);
            self.inflight = self.inflight.saturating_sub(pkt.size());
        }

        let rtt = u32::try_from(now.saturating_sub(pkt.time_sent)).unwrap_or(u32::MAX);
        let in_flight = pkt.status == PacketStatus::Inflight;
        let first_transmit = pkt.transmits == 1;

        // Retransmitted packets give ambiguous samples
        if in_flight && first_transmit {
            self.rtt.sample(rtt);
        }
        self.rack
            .on_delivered(seq, pkt.time_sent, rtt, first_transmit, in_flight);

        for frag in &pkt.frags {
            self.credit(frag.wbuf, frag.len, Completion::Completed, sack, events);
        }

        if self.is_dead() {
            return Acked::Finished;
        }

        if self.local_end == EndState::Ending
            && self.pkts_inflight == 0
            && self.retransmit_queue.is_empty()
            && self.write_queue.is_empty()
        {
            tracing::debug!("{}: local end acknowledged", self.id);
            self.local_end = EndState::Ended;
            return Acked::Finished;
        }

        Acked::Delivered
    }

    // ------------------------------------------------------------------------
    // Loss detection
    // ------------------------------------------------------------------------

    /// Declare packets lost that were sent well before the latest delivery
    pub(crate) fn rack_detect_loss(&mut self, now: u64) {
        let reo_wnd = u64::from(
            self.rack
                .reo_wnd(self.recovery > 0, self.sacks, self.rtt.srtt()),
        );
        let rack_rtt = u64::from(self.rack.rtt);
        let mut timeout = 0u64;
        let mut resending = 0u32;
        let mut probes_lost = 0u32;

        let mut seq = self.remote_acked;
        while seq != self.seq {
            let current = seq;
            seq = seq.wrapping_add(1);

            let Some(pkt) = self.outgoing.get_mut(current) else {
                continue;
            };
            if pkt.status != PacketStatus::Inflight {
                continue;
            }
            if !sent_after(
                self.rack.time_sent,
                self.rack.next_seq,
                pkt.time_sent,
                pkt.seq.wrapping_add(1),
            ) {
                continue;
            }

            let deadline = pkt.time_sent + rack_rtt + reo_wnd;
            if deadline <= now {
                pkt.status = PacketStatus::Retransmit(RetransmitKind::Fast);
                self.inflight = self.inflight.saturating_sub(pkt.size());
                self.pkts_inflight = self.pkts_inflight.saturating_sub(1);

                if pkt.probe {
                    pkt.unprobeify();
                    self.mtu.on_probe_lost();
                    probes_lost += 1;
                }

                resending += 1;
                pkt.fifo_hint = self.retransmit_queue.push(current);
            } else {
                timeout = timeout.max(deadline - now);
            }
        }

        // Lost probes alone say nothing about congestion
        if resending > probes_lost && self.recovery == 0 {
            self.recovery = seq_diff(self.seq, self.remote_acked).max(0) as u32;
            self.congestion.reduce(false);
            tracing::debug!(
                "{}: fast recovery [{}:{}] lost={} cwnd={} srtt={}",
                self.id,
                self.remote_acked,
                self.seq,
                resending,
                self.congestion.cwnd(),
                self.rtt.srtt()
            );
        }

        self.rack.timeout = (timeout > 0).then(|| now + timeout);
    }

    /// Run RACK and RTO deadlines.
    ///
    /// Returns true if a packet exhausted its transmissions; the stream is
    /// then marked destroyed and must be closed with a timeout.
    pub(crate) fn check_timeouts(&mut self, clock: u64) -> bool {
        if !self.is_connected() {
            return false;
        }
        if self.remote_acked == self.seq && self.write_queue.is_empty() {
            return false;
        }

        let now = if self.inflight > 0 { clock } else { 0 };

        if let Some(deadline) = self.rack.timeout {
            if now >= deadline {
                self.rack_detect_loss(now);
            }
        }

        if now <= self.rto_timeout {
            return false;
        }

        self.recovery = 0;
        self.retransmit_queue.clear();
        self.congestion.reduce(true);
        self.rto_timeout = now + 2 * u64::from(self.rtt.rto());

        tracing::debug!(
            "{}: rto fired [{}:{}] inflight={} cwnd={} srtt={}",
            self.id,
            self.remote_acked,
            self.seq,
            self.inflight,
            self.congestion.cwnd(),
            self.rtt.srtt()
        );

        let mut seq = self.remote_acked;
        while seq_lt(seq, self.seq) {
            let current = seq;
            seq = seq.wrapping_add(1);

            let Some(pkt) = self.outgoing.get_mut(current) else {
                continue;
            };

            match pkt.status {
                PacketStatus::Retransmit(_) => {
                    pkt.fifo_hint = self.retransmit_queue.push(current);
                }
                PacketStatus::Inflight => {
                    if pkt.transmits >= self.max_transmits {
                        tracing::debug!(
                            "{}: seq={} sent {} times, timing out",
                            self.id,
                            current,
                            pkt.transmits
                        );
                        self.teardown = Teardown::Destroyed;
                        return true;
                    }

                    pkt.status = PacketStatus::Retransmit(RetransmitKind::Slow);
                    self.inflight = self.inflight.saturating_sub(pkt.size());
                    self.pkts_inflight = self.pkts_inflight.saturating_sub(1);

                    if pkt.probe {
                        pkt.unprobeify();
                        self.mtu.on_probe_lost();
                    }

                    pkt.fifo_hint = self.retransmit_queue.push(current);
                }
                PacketStatus::Unsent => {}
            }
        }

        false
    }

    // ------------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------------

    /// Cancel every outstanding write and message and drop buffered reads
    pub(crate) fn cancel_pending(&mut self, events: &mut VecDeque<Event>) {
        let mut seq = self.remote_acked;
        while seq != self.seq {
            if let Some(pkt) = self.outgoing.remove(seq) {
                for frag in &pkt.frags {
                    self.credit(frag.wbuf, frag.len, Completion::Cancelled, false, events);
                }
            }
            seq = seq.wrapping_add(1);
        }

        while let Some(wref) = self.write_queue.shift() {
            let remaining = self
                .writes
                .get(wref.write)
                .and_then(|w| w.bufs.get(wref.index as usize))
                .map_or(0, |b| b.data.len() - b.bytes_acked);
            self.credit(wref, remaining, Completion::Cancelled, false, events);
        }

        // Whatever is left never reached the queue in full
        let mut leftover: Vec<_> = self
            .writes
            .iter()
            .map(|(h, w)| (w.serial, h))
            .collect();
        leftover.sort_unstable();
        for (_, handle) in leftover {
            self.writes.remove(handle);
            events.push_back(Event::WriteAck {
                stream: self.id,
                write: WriteId(handle),
                status: Completion::Cancelled,
                sacked: false,
            });
        }

        while let Some(key) = self.unordered.shift() {
            if let Some(pkt) = self.messages.remove(key) {
                if let PacketKind::Message(send) = pkt.kind {
                    events.push_back(Event::MessageSent {
                        stream: self.id,
                        send,
                        status: Completion::Cancelled,
                    });
                }
            }
        }

        self.retransmit_queue.clear();
        self.incoming.drain();
        self.pkts_buffered = 0;
        self.out_of_order = 0;
        self.pkts_inflight = 0;
        self.inflight = 0;
        self.reading = false;
        self.want_state = false;
        self.want_destroy = false;
    }
}
