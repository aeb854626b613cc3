//! The engine instance and its public API.
//!
//! [`Udx`] owns every socket and stream. It performs no I/O of its own
//! accord: a driver (see [`node`](crate::node), or a test harness) calls
//! [`Udx::poll_socket`] when a socket is ready and [`Udx::on_timer`] on a
//! fixed interval, then drains the queued [`Event`]s.

use crate::arena::{Arena, Handle};
use crate::cirbuf::Cirbuf;
use crate::clock::{Clock, MonotonicClock};
use crate::config::UdxConfig;
use crate::error::{Error, Result};
use crate::event::{CloseReason, Completion, Event, Firewall, SendId, SocketId, StreamId, WriteId};
use crate::packet::{Packet, PacketKind};
use crate::socket::Socket;
use crate::stream::{EndState, Phase, Stream, StreamState, StreamStats, Teardown};
use std::collections::VecDeque;
use std::collections::vec_deque;
use std::net::SocketAddr;
use tracing::{debug, info};
use udx_transport::{DatagramSocket, TransportConfig, UdpTransport};

/// Result of queueing a write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteQueued {
    /// Request handle, reported again in [`Event::WriteAck`]
    pub write: WriteId,
    /// False once queued bytes passed the high watermark; wait for
    /// [`Event::Drain`] before writing more
    pub can_continue: bool,
}

/// UDX engine: sockets, streams and the event queue
pub struct Udx {
    pub(crate) config: UdxConfig,
    clock: Box<dyn Clock>,
    pub(crate) streams: Arena<Stream>,
    pub(crate) streams_by_id: Cirbuf<Handle>,
    pub(crate) sockets: Arena<Socket>,
    sockets_open: usize,
    pub(crate) events: VecDeque<Event>,
    next_send_id: u64,
}

impl Udx {
    /// Engine on the monotonic system clock
    ///
    /// # Errors
    /// Returns `Error::InvalidConfig` if the configuration does not validate.
    pub fn new(config: UdxConfig) -> Result<Self> {
        Self::with_clock(config, Box::new(MonotonicClock::new()))
    }

    /// Engine on a caller-supplied clock
    ///
    /// # Errors
    /// Returns `Error::InvalidConfig` if the configuration does not validate.
    pub fn with_clock(config: UdxConfig, clock: Box<dyn Clock>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            clock,
            streams: Arena::new(),
            streams_by_id: Cirbuf::new(16),
            sockets: Arena::new(),
            sockets_open: 0,
            events: VecDeque::new(),
            next_send_id: 0,
        })
    }

    /// Configuration in effect
    #[must_use]
    pub fn config(&self) -> &UdxConfig {
        &self.config
    }

    pub(crate) fn now(&self) -> u64 {
        self.clock.now_ms()
    }

    fn next_send(&mut self) -> SendId {
        let id = SendId(self.next_send_id);
        self.next_send_id += 1;
        id
    }

    // ========================================================================
    // Events and timer
    // ========================================================================

    /// Take the oldest pending event
    pub fn poll_event(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    /// Take every pending event in order
    pub fn drain_events(&mut self) -> vec_deque::Drain<'_, Event> {
        self.events.drain(..)
    }

    /// True while any socket is open; drivers run the timer only then
    #[must_use]
    pub fn timer_active(&self) -> bool {
        self.sockets_open > 0
    }

    /// Run loss and retransmission timeouts of every stream
    pub fn on_timer(&mut self) {
        let now = self.now();
        for handle in self.streams.handles() {
            let timed_out = match self.streams.get_mut(handle) {
                Some(stream) => stream.check_timeouts(now),
                None => continue,
            };
            if timed_out {
                self.close_maybe(handle, Some(CloseReason::TimedOut));
            }
        }
    }

    // ========================================================================
    // Sockets
    // ========================================================================

    /// Bind a UDP socket and register it
    ///
    /// # Errors
    /// Returns `Error::Io` if the socket cannot be bound.
    pub fn socket_bind(&mut self, addr: SocketAddr) -> Result<SocketId> {
        let transport = UdpTransport::bind(
            addr,
            &TransportConfig {
                ttl: self.config.ttl,
                recv_buffer_size: self.config.buffer_size,
                send_buffer_size: self.config.buffer_size,
                dual_stack: true,
            },
        )?;
        self.socket_attach(Box::new(transport))
    }

    /// Register an already bound datagram socket
    ///
    /// # Errors
    /// Returns `Error::Io` if the socket has no local address.
    pub fn socket_attach(&mut self, io: Box<dyn DatagramSocket>) -> Result<SocketId> {
        let local = io.local_addr()?;
        let ttl = io.ttl().unwrap_or(self.config.ttl);
        let handle = self
            .sockets
            .insert_with(|h| Socket::new(h, io, local, ttl));
        self.sockets_open += 1;

        info!("socket#{:?}: bound to {}", handle, local);
        Ok(SocketId(handle))
    }

    fn socket(&self, id: SocketId) -> Result<&Socket> {
        self.sockets.get(id.0).ok_or(Error::UnknownSocket)
    }

    fn socket_mut(&mut self, id: SocketId) -> Result<&mut Socket> {
        self.sockets.get_mut(id.0).ok_or(Error::UnknownSocket)
    }

    /// Address the socket is bound to
    ///
    /// # Errors
    /// Returns `Error::UnknownSocket` or the socket's I/O error.
    pub fn socket_local_addr(&self, id: SocketId) -> Result<SocketAddr> {
        Ok(self.socket(id)?.io.local_addr()?)
    }

    /// Queue a raw datagram with the socket's default TTL
    ///
    /// # Errors
    /// Returns `Error::SocketClosing` once the socket is closing.
    pub fn socket_send(&mut self, id: SocketId, data: &[u8], dest: SocketAddr) -> Result<SendId> {
        self.socket_send_ttl(id, data, dest, 0)
    }

    /// Queue a raw datagram with a TTL override (0 for the default)
    ///
    /// # Errors
    /// Returns `Error::InvalidArgument` if `ttl` exceeds 255 and
    /// `Error::SocketClosing` once the socket is closing.
    pub fn socket_send_ttl(
        &mut self,
        id: SocketId,
        data: &[u8],
        dest: SocketAddr,
        ttl: u32,
    ) -> Result<SendId> {
        let ttl = u8::try_from(ttl).map_err(|_| Error::invalid("ttl must be at most 255"))?;
        if self.socket(id)?.closing {
            return Err(Error::SocketClosing);
        }

        let send = self.next_send();
        let mut pkt = Packet::with_buf(PacketKind::SocketSend(send), 0, data.to_vec(), dest);
        pkt.ttl = ttl;
        self.socket_mut(id)?.enqueue(pkt);
        Ok(send)
    }

    /// Default TTL of the socket
    ///
    /// # Errors
    /// Returns `Error::UnknownSocket`.
    pub fn socket_ttl(&self, id: SocketId) -> Result<u32> {
        Ok(self.socket(id)?.ttl)
    }

    /// Change the default TTL
    ///
    /// # Errors
    /// Returns `Error::InvalidArgument` outside 1..=255.
    pub fn socket_set_ttl(&mut self, id: SocketId, ttl: u32) -> Result<()> {
        if !(1..=255).contains(&ttl) {
            return Err(Error::invalid("ttl must be between 1 and 255"));
        }
        let socket = self.socket_mut(id)?;
        socket.io.set_ttl(ttl)?;
        socket.ttl = ttl;
        Ok(())
    }

    /// Kernel receive buffer size
    ///
    /// # Errors
    /// Returns `Error::UnknownSocket` or the socket's I/O error.
    pub fn socket_recv_buffer_size(&self, id: SocketId) -> Result<usize> {
        Ok(self.socket(id)?.io.recv_buffer_size()?)
    }

    /// Set the kernel receive buffer size
    ///
    /// # Errors
    /// Returns `Error::InvalidArgument` for a zero size.
    pub fn socket_set_recv_buffer_size(&mut self, id: SocketId, size: usize) -> Result<()> {
        if size < 1 {
            return Err(Error::invalid("buffer size must be positive"));
        }
        Ok(self.socket(id)?.io.set_recv_buffer_size(size)?)
    }

    /// Kernel send buffer size
    ///
    /// # Errors
    /// Returns `Error::UnknownSocket` or the socket's I/O error.
    pub fn socket_send_buffer_size(&self, id: SocketId) -> Result<usize> {
        Ok(self.socket(id)?.io.send_buffer_size()?)
    }

    /// Set the kernel send buffer size
    ///
    /// # Errors
    /// Returns `Error::InvalidArgument` for a zero size.
    pub fn socket_set_send_buffer_size(&mut self, id: SocketId, size: usize) -> Result<()> {
        if size < 1 {
            return Err(Error::invalid("buffer size must be positive"));
        }
        Ok(self.socket(id)?.io.set_send_buffer_size(size)?)
    }

    /// Report non-stream datagrams as [`Event::SocketRecv`]
    ///
    /// # Errors
    /// Returns `Error::AlreadyStarted` if already receiving.
    pub fn socket_recv_start(&mut self, id: SocketId) -> Result<()> {
        let socket = self.socket_mut(id)?;
        if socket.receiving {
            return Err(Error::AlreadyStarted);
        }
        socket.receiving = true;
        Ok(())
    }

    /// Stop reporting non-stream datagrams
    ///
    /// # Errors
    /// Returns `Error::UnknownSocket`.
    pub fn socket_recv_stop(&mut self, id: SocketId) -> Result<()> {
        self.socket_mut(id)?.receiving = false;
        Ok(())
    }

    /// Start closing the socket.
    ///
    /// Queued raw sends are cancelled. The socket finishes closing (with
    /// [`Event::SocketClose`]) once no stream on it has anything to send.
    ///
    /// # Errors
    /// Returns `Error::UnknownSocket`.
    pub fn socket_close(&mut self, id: SocketId) -> Result<()> {
        let socket = self.sockets.get_mut(id.0).ok_or(Error::UnknownSocket)?;
        if socket.closing {
            return Ok(());
        }
        socket.closing = true;

        while let Some(key) = socket.send_queue.shift() {
            if let Some(pkt) = socket.queued.remove(key) {
                if let PacketKind::SocketSend(send) = pkt.kind {
                    self.events.push_back(Event::SocketSent {
                        socket: id,
                        send,
                        status: Completion::Cancelled,
                    });
                }
            }
        }

        debug!("{}: closing", id);
        self.maybe_close_handles(id.0);
        Ok(())
    }

    /// Whether the socket has anything to send right now
    #[must_use]
    pub fn socket_wants_write(&self, id: SocketId) -> bool {
        match self.sockets.get(id.0) {
            Some(socket) if !socket.closing_handles => {
                !socket.send_queue.is_empty()
                    || self
                        .streams
                        .iter()
                        .any(|(_, s)| s.socket == Some(id.0) && s.write_wanted())
            }
            _ => false,
        }
    }

    /// Whether the socket is still registered
    #[must_use]
    pub fn socket_is_open(&self, id: SocketId) -> bool {
        self.sockets.contains(id.0)
    }

    pub(crate) fn maybe_close_handles(&mut self, handle: Handle) {
        let Some(socket) = self.sockets.get(handle) else {
            return;
        };
        if !socket.closing || socket.closing_handles || !socket.send_queue.is_empty() {
            return;
        }
        if self
            .streams
            .iter()
            .any(|(_, s)| s.socket == Some(handle) && s.has_pending_output())
        {
            return;
        }

        let id = socket.id;
        self.sockets.remove(handle);
        self.sockets_open -= 1;
        self.events.push_back(Event::SocketClose { socket: id });
        info!("{}: closed ({} open)", id, self.sockets_open);
    }

    // ========================================================================
    // Streams
    // ========================================================================

    /// Create a stream under `local_id`, the id peers address it by
    ///
    /// # Errors
    /// Returns `Error::InvalidArgument` if `local_id` is taken.
    pub fn stream_init(&mut self, local_id: u32) -> Result<StreamId> {
        if let Some(&existing) = self.streams_by_id.get(local_id) {
            if self.streams.contains(existing) {
                return Err(Error::invalid("local stream id in use"));
            }
        }

        let now = self.now();
        let config = &self.config;
        let handle = self
            .streams
            .insert_with(|h| Stream::new(h, local_id, config, now));
        self.streams_by_id.set(local_id, handle);

        debug!("stream#{:?}: initialized with local id {}", handle, local_id);
        Ok(StreamId(handle))
    }

    fn stream(&self, id: StreamId) -> Result<&Stream> {
        self.streams.get(id.0).ok_or(Error::UnknownStream)
    }

    fn stream_mut(&mut self, id: StreamId) -> Result<&mut Stream> {
        self.streams.get_mut(id.0).ok_or(Error::UnknownStream)
    }

    /// Connect to the peer stream `remote_id` at `addr` through `socket`
    ///
    /// # Errors
    /// Returns `Error::AlreadyConnected`, `Error::InvalidArgument` for port 0,
    /// or `Error::SocketClosing`.
    pub fn stream_connect(
        &mut self,
        id: StreamId,
        socket: SocketId,
        remote_id: u32,
        addr: SocketAddr,
    ) -> Result<()> {
        if self.stream(id)?.is_connected() {
            return Err(Error::AlreadyConnected);
        }
        if addr.port() == 0 {
            return Err(Error::invalid("remote port must be non-zero"));
        }
        let sock = self.socket(socket)?;
        if sock.closing {
            return Err(Error::SocketClosing);
        }
        let link_mtu = sock.io.path_mtu(addr);

        let stream = self.stream_mut(id)?;
        stream.connect(socket.0, remote_id, addr, link_mtu);

        debug!(
            "{}: connected to {} (remote id {}) on {}, mtu max {}",
            id,
            addr,
            remote_id,
            socket,
            stream.mtu.max()
        );
        Ok(())
    }

    /// Migrate a connected stream to a new socket, peer or remote id.
    ///
    /// [`Event::RemoteChanged`] follows once everything sent before the
    /// change has been acknowledged.
    ///
    /// # Errors
    /// Returns `Error::NotConnected`, or `Error::InvalidArgument` for port 0.
    pub fn stream_change_remote(
        &mut self,
        id: StreamId,
        socket: SocketId,
        remote_id: u32,
        addr: SocketAddr,
    ) -> Result<()> {
        if !self.stream(id)?.is_connected() {
            return Err(Error::NotConnected);
        }
        if addr.port() == 0 {
            return Err(Error::invalid("remote port must be non-zero"));
        }
        let sock = self.socket(socket)?;
        if sock.closing {
            return Err(Error::SocketClosing);
        }
        let link_mtu = sock.io.path_mtu(addr);

        let stream = self.stream_mut(id)?;
        if stream.change_remote(socket.0, remote_id, addr, link_mtu) {
            self.events.push_back(Event::RemoteChanged { stream: id });
        }
        Ok(())
    }

    /// Forward every packet received for `id` to `target`'s peer
    ///
    /// # Errors
    /// Returns `Error::InvalidArgument` if `id` is already relayed or
    /// `target` is closed.
    pub fn stream_relay_to(&mut self, id: StreamId, target: StreamId) -> Result<()> {
        let stream = self.stream(id)?;
        if stream.relayed {
            return Err(Error::invalid("stream is already relayed"));
        }
        if id == target {
            return Err(Error::invalid("stream cannot relay to itself"));
        }
        let local_id = stream.local_id;

        let Some(target_stream) = self.streams.get_mut(target.0) else {
            return Err(Error::invalid("relay target is closed"));
        };
        target_stream.relaying.set(local_id, id.0);

        let stream = self.stream_mut(id)?;
        stream.relayed = true;
        stream.relay_to = Some(target.0);

        debug!("{}: relaying to {}", id, target);
        Ok(())
    }

    /// Install the policy for packets arriving on other sockets
    ///
    /// # Errors
    /// Returns `Error::UnknownStream`.
    pub fn stream_set_firewall<F>(&mut self, id: StreamId, firewall: F) -> Result<()>
    where
        F: Firewall + 'static,
    {
        self.stream_mut(id)?.firewall = Some(Box::new(firewall));
        Ok(())
    }

    /// Remove the firewall
    ///
    /// # Errors
    /// Returns `Error::UnknownStream`.
    pub fn stream_clear_firewall(&mut self, id: StreamId) -> Result<()> {
        self.stream_mut(id)?.firewall = None;
        Ok(())
    }

    /// Start emitting [`Event::Read`] and [`Event::End`]
    ///
    /// # Errors
    /// Returns `Error::AlreadyStarted` if already reading.
    pub fn stream_read_start(&mut self, id: StreamId) -> Result<()> {
        let stream = self.stream_mut(id)?;
        if stream.reading {
            return Err(Error::AlreadyStarted);
        }
        stream.reading = true;
        Ok(())
    }

    /// Stop emitting reads; data keeps being acknowledged
    ///
    /// # Errors
    /// Returns `Error::UnknownStream`.
    pub fn stream_read_stop(&mut self, id: StreamId) -> Result<()> {
        self.stream_mut(id)?.reading = false;
        Ok(())
    }

    /// Start emitting [`Event::Message`]
    ///
    /// # Errors
    /// Returns `Error::AlreadyStarted` if already receiving.
    pub fn stream_recv_start(&mut self, id: StreamId) -> Result<()> {
        let stream = self.stream_mut(id)?;
        if stream.receiving {
            return Err(Error::AlreadyStarted);
        }
        stream.receiving = true;
        Ok(())
    }

    /// Stop emitting messages
    ///
    /// # Errors
    /// Returns `Error::UnknownStream`.
    pub fn stream_recv_stop(&mut self, id: StreamId) -> Result<()> {
        self.stream_mut(id)?.receiving = false;
        Ok(())
    }

    /// Queue ordered data
    ///
    /// # Errors
    /// Returns `Error::InvalidArgument` when every buffer is empty or the
    /// write side already ended, and `Error::StreamClosed` while tearing down.
    pub fn stream_write(&mut self, id: StreamId, bufs: &[&[u8]]) -> Result<WriteQueued> {
        self.queue_write(id, bufs, false)
    }

    /// Queue ordered data followed by the end of the stream; `bufs` may be
    /// empty
    ///
    /// # Errors
    /// Returns `Error::InvalidArgument` if the write side already ended and
    /// `Error::StreamClosed` while tearing down.
    pub fn stream_write_end(&mut self, id: StreamId, bufs: &[&[u8]]) -> Result<WriteQueued> {
        self.queue_write(id, bufs, true)
    }

    fn queue_write(&mut self, id: StreamId, bufs: &[&[u8]], end: bool) -> Result<WriteQueued> {
        let now = self.now();
        let stream = self.stream_mut(id)?;
        if stream.is_dead() {
            return Err(Error::StreamClosed);
        }
        if stream.local_end != EndState::Open {
            return Err(Error::invalid("write side already ended"));
        }

        let (write, can_continue) = stream.enqueue_write(bufs, end, now)?;
        Ok(WriteQueued {
            write,
            can_continue,
        })
    }

    /// Send an unordered, unreliable message
    ///
    /// # Errors
    /// Returns `Error::NotConnected` or `Error::StreamClosed`.
    pub fn stream_send(&mut self, id: StreamId, data: &[u8]) -> Result<SendId> {
        let stream = self.stream(id)?;
        if stream.is_dead() {
            return Err(Error::StreamClosed);
        }
        if !stream.is_connected() {
            return Err(Error::NotConnected);
        }

        let send = self.next_send();
        self.stream_mut(id)?.enqueue_message(data, send)?;
        Ok(send)
    }

    /// Abort the stream.
    ///
    /// Returns true if a DESTROY packet was queued for the peer; otherwise
    /// the stream closed immediately.
    ///
    /// # Errors
    /// Returns `Error::UnknownStream`.
    pub fn stream_destroy(&mut self, id: StreamId) -> Result<bool> {
        let stream = self.stream_mut(id)?;

        if !stream.is_connected() {
            stream.teardown = Teardown::Destroyed;
            self.close_maybe(id.0, None);
            return Ok(false);
        }

        if stream.teardown == Teardown::Alive {
            stream.teardown = Teardown::Destroying;
        }

        if stream.relayed {
            stream.teardown = Teardown::Destroyed;
            self.close_maybe(id.0, None);
            return Ok(false);
        }

        stream.want_destroy = true;
        debug!("{}: destroy queued", id);
        Ok(true)
    }

    /// Confirmed path MTU
    ///
    /// # Errors
    /// Returns `Error::UnknownStream`.
    pub fn stream_mtu(&self, id: StreamId) -> Result<u16> {
        Ok(self.stream(id)?.mtu.mtu())
    }

    /// Next sequence number to send
    ///
    /// # Errors
    /// Returns `Error::UnknownStream`.
    pub fn stream_seq(&self, id: StreamId) -> Result<u32> {
        Ok(self.stream(id)?.seq)
    }

    /// Override the next sequence number (e.g. after a handshake)
    ///
    /// # Errors
    /// Returns `Error::UnknownStream`.
    pub fn stream_set_seq(&mut self, id: StreamId, seq: u32) -> Result<()> {
        let stream = self.stream_mut(id)?;
        stream.seq = seq;
        stream.remote_acked = seq;
        Ok(())
    }

    /// Next sequence number expected from the peer
    ///
    /// # Errors
    /// Returns `Error::UnknownStream`.
    pub fn stream_ack(&self, id: StreamId) -> Result<u32> {
        Ok(self.stream(id)?.ack)
    }

    /// Override the next expected sequence number
    ///
    /// # Errors
    /// Returns `Error::UnknownStream`.
    pub fn stream_set_ack(&mut self, id: StreamId, ack: u32) -> Result<()> {
        self.stream_mut(id)?.ack = ack;
        Ok(())
    }

    /// Local id peers address the stream by
    ///
    /// # Errors
    /// Returns `Error::UnknownStream`.
    pub fn stream_local_id(&self, id: StreamId) -> Result<u32> {
        Ok(self.stream(id)?.local_id)
    }

    /// Remote address, once connected
    ///
    /// # Errors
    /// Returns `Error::UnknownStream`.
    pub fn stream_remote_addr(&self, id: StreamId) -> Result<Option<SocketAddr>> {
        Ok(self.stream(id)?.remote_addr)
    }

    /// State machine snapshot
    ///
    /// # Errors
    /// Returns `Error::UnknownStream` once the stream closed.
    pub fn stream_state(&self, id: StreamId) -> Result<StreamState> {
        Ok(self.stream(id)?.state())
    }

    /// Congestion, RTT and window counters
    ///
    /// # Errors
    /// Returns `Error::UnknownStream` once the stream closed.
    pub fn stream_stats(&self, id: StreamId) -> Result<StreamStats> {
        Ok(self.stream(id)?.stats())
    }

    /// Number of live streams
    #[must_use]
    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    // ========================================================================
    // Closing
    // ========================================================================

    /// Close `handle` if both sides ended or it was destroyed.
    ///
    /// Pending writes and messages are cancelled, streams relaying through
    /// it are destroyed and [`Event::Close`] is queued. Returns true if the
    /// stream closed.
    pub(crate) fn close_maybe(&mut self, handle: Handle, reason: Option<CloseReason>) -> bool {
        let Some(stream) = self.streams.get_mut(handle) else {
            return false;
        };

        let ended = stream.local_end == EndState::Ended && stream.remote_end == EndState::Ended;
        let destroyed = matches!(
            stream.teardown,
            Teardown::Destroyed | Teardown::DestroyedRemote
        );
        if !ended && !destroyed {
            return false;
        }
        if stream.phase == Phase::Closed {
            return false;
        }
        // A clean close waits until the last acknowledgement went out
        if reason.is_none() && stream.want_state {
            return false;
        }

        stream.phase = Phase::Closed;
        let id = stream.id;
        let local_id = stream.local_id;
        stream.cancel_pending(&mut self.events);
        let relay_to = stream.relay_to.take();
        let relaying: Vec<Handle> = stream.relaying.drain().into_iter().map(|(_, h)| h).collect();

        if self.streams_by_id.get(local_id) == Some(&handle) {
            self.streams_by_id.remove(local_id);
        }

        if let Some(target) = relay_to.and_then(|t| self.streams.get_mut(t)) {
            target.relaying.remove(local_id);
        }

        // Relayed dependents have no queued destroy to send, they close now
        for dependent in relaying {
            if let Some(s) = self.streams.get_mut(dependent) {
                s.relay_to = None;
                s.teardown = Teardown::Destroyed;
                self.close_maybe(dependent, Some(CloseReason::RelayTargetClosed));
            }
        }

        match reason {
            Some(reason) => info!("{}: closed ({})", id, reason),
            None => debug!("{}: closed", id),
        }
        self.events.push_back(Event::Close { stream: id, reason });

        if let Some(socket) = self.streams.remove(handle).and_then(|s| s.socket) {
            self.maybe_close_handles(socket);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn engine() -> Udx {
        Udx::with_clock(UdxConfig::default(), Box::new(ManualClock::new(1))).unwrap()
    }

    #[test]
    fn test_rejects_invalid_config() {
        let config = UdxConfig {
            send_batch_size: 0,
            ..UdxConfig::default()
        };
        assert!(matches!(Udx::new(config), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_duplicate_local_id() {
        let mut udx = engine();
        udx.stream_init(7).unwrap();
        assert!(matches!(udx.stream_init(7), Err(Error::InvalidArgument(_))));
        udx.stream_init(8).unwrap();
        assert_eq!(udx.stream_count(), 2);
    }

    #[test]
    fn test_destroy_unconnected_closes_immediately() {
        let mut udx = engine();
        let id = udx.stream_init(1).unwrap();
        assert!(!udx.stream_destroy(id).unwrap());
        assert_eq!(
            udx.drain_events().collect::<Vec<_>>(),
            vec![Event::Close {
                stream: id,
                reason: None
            }]
        );
        assert!(matches!(udx.stream_state(id), Err(Error::UnknownStream)));
        // the id is free again
        udx.stream_init(1).unwrap();
    }

    #[test]
    fn test_read_start_twice() {
        let mut udx = engine();
        let id = udx.stream_init(1).unwrap();
        udx.stream_read_start(id).unwrap();
        assert!(matches!(udx.stream_read_start(id), Err(Error::AlreadyStarted)));
        udx.stream_read_stop(id).unwrap();
        udx.stream_read_stop(id).unwrap();
        udx.stream_read_start(id).unwrap();
    }

    #[test]
    fn test_send_requires_connection() {
        let mut udx = engine();
        let id = udx.stream_init(1).unwrap();
        assert!(matches!(udx.stream_send(id, b"hi"), Err(Error::NotConnected)));
        assert!(matches!(
            udx.stream_change_remote(id, SocketId(id.0), 2, "127.0.0.1:1".parse().unwrap()),
            Err(Error::NotConnected)
        ));
    }

    #[test]
    fn test_relay_rejects_closed_target() {
        let mut udx = engine();
        let a = udx.stream_init(1).unwrap();
        let b = udx.stream_init(2).unwrap();
        udx.stream_destroy(b).unwrap();
        assert!(matches!(
            udx.stream_relay_to(a, b),
            Err(Error::InvalidArgument(_))
        ));

        let c = udx.stream_init(3).unwrap();
        udx.stream_relay_to(a, c).unwrap();
        assert!(matches!(
            udx.stream_relay_to(a, c),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_closing_relay_target_destroys_relayed_stream() {
        let mut udx = engine();
        let a = udx.stream_init(1).unwrap();
        let b = udx.stream_init(2).unwrap();
        udx.stream_relay_to(a, b).unwrap();
        udx.drain_events().for_each(drop);

        udx.stream_destroy(b).unwrap();
        let closed: Vec<_> = udx
            .drain_events()
            .filter_map(|e| match e {
                Event::Close { stream, .. } => Some(stream),
                _ => None,
            })
            .collect();
        assert_eq!(closed, vec![a, b]);
    }

    #[test]
    fn test_timer_inactive_without_sockets() {
        let mut udx = engine();
        assert!(!udx.timer_active());
        udx.on_timer();
        assert!(udx.poll_event().is_none());
    }
}
