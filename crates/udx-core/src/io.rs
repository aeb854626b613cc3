//! Socket readiness handling: routing received packets and flushing queued
//! output in batches.

use crate::arena::Handle;
use crate::error::{Error, Result};
use crate::event::{CloseReason, Completion, Event, FirewallVerdict, SocketId, StreamId};
use crate::header::{Header, PacketView};
use crate::packet::{Packet, PacketKind};
use crate::seq::seq_max;
use crate::socket::unmap;
use crate::stream::{Disposition, EndState, Teardown};
use crate::udx::Udx;
use std::io;
use std::net::SocketAddr;
use tracing::{debug, trace, warn};
use udx_transport::Datagram;

/// One packet taken off a socket's output for the current batch
enum Outbound {
    /// Raw send or relayed packet in the socket queue
    Queued { key: Handle },
    /// Unordered message in the stream's message arena
    Message { stream: Handle, key: Handle },
    /// Acknowledgement or destroy notice
    Control { stream: Handle, packet: Packet },
    /// First transmission of stream data
    Fresh { stream: Handle, packet: Packet },
    /// Retransmission of `seq` from the stream's outgoing window
    Retransmit { stream: Handle, seq: u32 },
}

impl Udx {
    /// Handle readiness reported by the driver
    ///
    /// # Errors
    /// Returns `Error::UnknownSocket` once the socket closed.
    pub fn poll_socket(&mut self, id: SocketId, readable: bool, writable: bool) -> Result<()> {
        if readable {
            self.on_readable(id)?;
        }
        if writable {
            self.on_writable(id)?;
        }
        self.maybe_close_handles(id.0);
        Ok(())
    }

    // ========================================================================
    // Receive path
    // ========================================================================

    /// Receive until the socket would block
    ///
    /// # Errors
    /// Returns `Error::UnknownSocket` once the socket closed.
    pub fn on_readable(&mut self, id: SocketId) -> Result<()> {
        let mut buf = vec![0u8; self.config.recv_buffer_size];

        loop {
            let socket = self.sockets.get(id.0).ok_or(Error::UnknownSocket)?;
            if socket.closing_handles {
                return Ok(());
            }

            let (len, from) = match socket.io.try_recv_from(&mut buf) {
                Ok(received) => received,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!("{}: receive failed: {}", id, e);
                    return Ok(());
                }
            };

            let data = &buf[..len];
            if self.process_packet(id.0, data, from) {
                continue;
            }

            match self.sockets.get(id.0) {
                Some(socket) if socket.receiving => {
                    self.events.push_back(Event::SocketRecv {
                        socket: id,
                        data: data.to_vec(),
                        from: unmap(from),
                    });
                }
                _ => trace!(
                    "{}: dropped {} byte datagram from {}: {}",
                    id,
                    len,
                    from,
                    hex::encode(&data[..len.min(16)])
                ),
            }
        }
    }

    /// Route one datagram. Returns false if it is not stream traffic.
    fn process_packet(&mut self, sock: Handle, data: &[u8], from: SocketAddr) -> bool {
        let Ok(header) = Header::decode(data) else {
            return false;
        };
        let Some(&handle) = self.streams_by_id.get(header.remote_id) else {
            return false;
        };

        let verdict = {
            let Some(stream) = self.streams.get_mut(handle) else {
                return false;
            };
            if stream.is_dead() {
                return false;
            }
            if stream.socket == Some(sock) {
                None
            } else {
                let id = stream.id;
                stream
                    .firewall
                    .as_mut()
                    .map(|fw| fw.check(id, SocketId(sock), unmap(from)))
            }
        };

        match verdict {
            Some(FirewallVerdict::Reject) => {
                trace!("stream#{:?}: firewall rejected packet from {}", handle, from);
                return true;
            }
            Some(FirewallVerdict::Connect { remote_id }) => {
                match self.stream_connect(StreamId(handle), SocketId(sock), remote_id, unmap(from)) {
                    Ok(()) | Err(Error::AlreadyConnected) => {}
                    Err(e) => {
                        debug!("stream#{:?}: firewall connect failed: {}", handle, e);
                        return true;
                    }
                }
            }
            Some(FirewallVerdict::Accept) | None => {}
        }

        let relay_to = self.streams.get(handle).and_then(|s| s.relay_to);
        if let Some(target) = relay_to {
            self.relay_packet(handle, target, data, &header);
            return true;
        }

        let view = match PacketView::parse(data) {
            Ok(view) => view,
            Err(e) => {
                trace!("stream#{:?}: malformed packet: {}", handle, e);
                return true;
            }
        };

        let now = self.now();
        let Some(stream) = self.streams.get_mut(handle) else {
            return true;
        };
        if let Disposition::Close(reason) = stream.on_packet(&view, now, &mut self.events) {
            self.close_maybe(handle, reason);
        }
        true
    }

    /// Forward a packet received on a relayed stream to the target's peer
    fn relay_packet(&mut self, handle: Handle, target: Handle, data: &[u8], header: &Header) {
        if let Some(stream) = self.streams.get_mut(handle) {
            stream.seq = seq_max(stream.seq, header.seq);
        }

        let route = self
            .streams
            .get(target)
            .and_then(|t| Some((t.socket?, t.remote_addr?, t.remote_id)));

        if let Some((sock, dest, remote_id)) = route {
            if let Some(socket) = self.sockets.get_mut(sock).filter(|s| !s.closing_handles) {
                let mut buf = data.to_vec();
                buf[4..8].copy_from_slice(&remote_id.to_le_bytes());

                match socket.io.try_send_to(&buf, socket.map_dest(dest)) {
                    Ok(_) => {}
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        socket.enqueue(Packet::with_buf(PacketKind::Relay, header.seq, buf, dest));
                    }
                    Err(e) => debug!("stream#{:?}: relay to {} failed: {}", handle, dest, e),
                }
            }
        }

        if header.flags.is_destroy() {
            if let Some(stream) = self.streams.get_mut(handle) {
                stream.teardown = Teardown::DestroyedRemote;
            }
            self.close_maybe(handle, Some(CloseReason::ConnectionReset));
        }
    }

    // ========================================================================
    // Send path
    // ========================================================================

    /// Flush queued output until the socket would block or nothing is left
    ///
    /// # Errors
    /// Returns `Error::UnknownSocket` once the socket closed.
    pub fn on_writable(&mut self, id: SocketId) -> Result<()> {
        let sock = id.0;

        loop {
            if self
                .sockets
                .get(sock)
                .ok_or(Error::UnknownSocket)?
                .closing_handles
            {
                return Ok(());
            }

            let mut batch = Vec::with_capacity(self.config.send_batch_size);
            let mut batch_ttl = None;
            let mut drained = false;

            while batch.len() < self.config.send_batch_size {
                let Some(out) = self.shift_outbound(sock) else {
                    drained = true;
                    break;
                };
                // Every datagram of a batch shares one TTL
                let ttl = self.outbound_ttl(sock, &out);
                match batch_ttl {
                    None => batch_ttl = Some(ttl),
                    Some(current) if current != ttl => {
                        self.unshift(sock, out);
                        break;
                    }
                    Some(_) => {}
                }
                batch.push(out);
            }

            if batch.is_empty() {
                return Ok(());
            }

            let result = self.transmit(sock, &batch, batch_ttl.unwrap_or(0));
            let mut would_block = false;
            let sent = match result {
                Ok(n) => n.min(batch.len()),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    would_block = true;
                    0
                }
                Err(e) => {
                    // Counted as sent and lost; loss detection resends them
                    warn!("{}: send of {} packets failed: {}", id, batch.len(), e);
                    self.on_send_error(&batch);
                    batch.len()
                }
            };

            for out in batch.drain(sent..).rev() {
                self.unshift(sock, out);
            }

            let now = self.now();
            for out in batch {
                self.confirm(sock, out, now);
            }

            if would_block || drained {
                return Ok(());
            }
        }
    }

    fn transmit(&self, sock: Handle, batch: &[Outbound], ttl: u8) -> io::Result<usize> {
        let socket = self
            .sockets
            .get(sock)
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;

        let mut datagrams = Vec::with_capacity(batch.len());
        for out in batch {
            let (data, dest) = self
                .outbound_bytes(sock, out)
                .ok_or_else(|| io::Error::other("queued packet vanished"))?;
            datagrams.push(Datagram {
                data,
                dest: socket.map_dest(dest),
            });
        }

        let adjust = ttl > 0 && u32::from(ttl) != socket.ttl;
        if adjust {
            if let Err(e) = socket.io.set_ttl(u32::from(ttl)) {
                warn!("{}: cannot set ttl {}: {}", socket.id, ttl, e);
            }
        }

        let result = socket.io.try_send_batch(&datagrams);

        if adjust {
            if let Err(e) = socket.io.set_ttl(socket.ttl) {
                warn!("{}: cannot restore ttl {}: {}", socket.id, socket.ttl, e);
            }
        }

        result
    }

    fn outbound_bytes<'a>(&'a self, sock: Handle, out: &'a Outbound) -> Option<(&'a [u8], SocketAddr)> {
        let pkt = match out {
            Outbound::Queued { key } => self.sockets.get(sock)?.queued.get(*key)?,
            Outbound::Message { stream, key } => self.streams.get(*stream)?.messages.get(*key)?,
            Outbound::Control { packet, .. } | Outbound::Fresh { packet, .. } => packet,
            Outbound::Retransmit { stream, seq } => self.streams.get(*stream)?.outgoing.get(*seq)?,
        };
        Some((&pkt.buf, pkt.dest))
    }

    fn outbound_ttl(&self, sock: Handle, out: &Outbound) -> u8 {
        match out {
            Outbound::Queued { key } => self
                .sockets
                .get(sock)
                .and_then(|s| s.queued.get(*key))
                .map_or(0, |p| p.ttl),
            _ => 0,
        }
    }

    /// Take the next packet for `sock`: raw sends first, then the first
    /// stream with something to say
    fn shift_outbound(&mut self, sock: Handle) -> Option<Outbound> {
        let socket = self.sockets.get_mut(sock)?;
        if let Some(key) = socket.send_queue.shift() {
            return Some(Outbound::Queued { key });
        }

        let handle = self
            .streams
            .iter()
            .find(|(_, s)| s.socket == Some(sock) && s.write_wanted())
            .map(|(h, _)| h)?;
        let stream = self.streams.get_mut(handle)?;

        if let Some(key) = stream.unordered.shift() {
            return Some(Outbound::Message { stream: handle, key });
        }

        if stream.want_state {
            if let Some(packet) = stream.build_state_packet() {
                return Some(Outbound::Control { stream: handle, packet });
            }
        }

        if stream.want_destroy {
            if let Some(packet) = stream.build_destroy_packet() {
                return Some(Outbound::Control { stream: handle, packet });
            }
        }

        if stream.is_dead() || stream.pkts_inflight >= stream.congestion.cwnd() {
            return None;
        }

        if let Some(seq) = stream.shift_retransmit() {
            return Some(Outbound::Retransmit { stream: handle, seq });
        }

        stream
            .next_data_packet()
            .map(|packet| Outbound::Fresh { stream: handle, packet })
    }

    /// Put back a packet that did not leave the socket
    fn unshift(&mut self, sock: Handle, out: Outbound) {
        match out {
            Outbound::Queued { .. } => {
                if let Some(socket) = self.sockets.get_mut(sock) {
                    socket.send_queue.undo();
                }
            }
            Outbound::Message { stream, .. } => {
                if let Some(s) = self.streams.get_mut(stream) {
                    s.unordered.undo();
                }
            }
            Outbound::Control { stream, packet } => {
                let Some(s) = self.streams.get_mut(stream) else {
                    return;
                };
                if packet.kind == PacketKind::Destroy {
                    s.want_destroy = true;
                    if packet.seq.wrapping_add(1) == s.seq {
                        s.seq = packet.seq;
                    }
                } else {
                    s.want_state = true;
                }
            }
            Outbound::Fresh { stream, packet } => {
                if let Some(s) = self.streams.get_mut(stream) {
                    s.unshift_fresh(packet);
                }
            }
            Outbound::Retransmit { stream, seq } => {
                if let Some(s) = self.streams.get_mut(stream) {
                    s.unshift_retransmit(seq);
                }
            }
        }
    }

    /// Record a packet as sent and fire its completion
    fn confirm(&mut self, sock: Handle, out: Outbound, now: u64) {
        match out {
            Outbound::Queued { key } => {
                let Some(socket) = self.sockets.get_mut(sock) else {
                    return;
                };
                if let Some(PacketKind::SocketSend(send)) = socket.queued.remove(key).map(|p| p.kind) {
                    self.events.push_back(Event::SocketSent {
                        socket: socket.id,
                        send,
                        status: Completion::Completed,
                    });
                }
            }
            Outbound::Message { stream, key } => {
                let Some(s) = self.streams.get_mut(stream) else {
                    return;
                };
                if let Some(PacketKind::Message(send)) = s.messages.remove(key).map(|p| p.kind) {
                    self.events.push_back(Event::MessageSent {
                        stream: s.id,
                        send,
                        status: Completion::Completed,
                    });
                }
            }
            Outbound::Control { stream, packet } => {
                let Some(s) = self.streams.get_mut(stream) else {
                    return;
                };
                match packet.kind {
                    PacketKind::Destroy => {
                        if s.teardown != Teardown::DestroyedRemote {
                            s.teardown = Teardown::Destroyed;
                        }
                        self.close_maybe(stream, None);
                    }
                    _ => {
                        let finished = s.remote_end == EndState::Ended
                            || matches!(s.teardown, Teardown::Destroyed | Teardown::DestroyedRemote);
                        if finished {
                            self.close_maybe(stream, None);
                        }
                    }
                }
            }
            Outbound::Fresh { stream, packet } => match self.streams.get_mut(stream) {
                Some(s) => s.confirm_fresh(packet, now),
                None => trace!("stream#{:?}: dropping packet seq={} of closed stream", stream, packet.seq),
            },
            Outbound::Retransmit { stream, seq } => {
                if let Some(s) = self.streams.get_mut(stream) {
                    s.confirm_retransmit(seq, now);
                }
            }
        }
    }

    /// The stack refused a batch; probes in it stop the MTU search for now
    fn on_send_error(&mut self, batch: &[Outbound]) {
        for out in batch {
            if let Outbound::Fresh { stream, packet } = out {
                if packet.probe {
                    if let Some(s) = self.streams.get_mut(*stream) {
                        s.mtu.on_send_error();
                    }
                }
            }
        }
    }
}
