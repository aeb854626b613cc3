//! Async UDP transport implementation.
//!
//! A Tokio socket configured through socket2. The engine uses it through the
//! non-blocking [`DatagramSocket`] half while the runtime driver waits on
//! [`Transport::readable`] and [`Transport::writable`].

use crate::TransportConfig;
use crate::transport::{Datagram, DatagramSocket, Transport, TransportError, TransportResult, TransportStats};
use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::io::Interest;
use tokio::net::UdpSocket;

#[derive(Default)]
struct Counters {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    packets_sent: AtomicU64,
    packets_received: AtomicU64,
    send_errors: AtomicU64,
    recv_errors: AtomicU64,
}

impl Counters {
    fn sent(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
    }

    fn received(&self, bytes: usize) {
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
        self.packets_received.fetch_add(1, Ordering::Relaxed);
    }

    fn send_failed(&self, e: &io::Error) {
        if e.kind() != io::ErrorKind::WouldBlock {
            self.send_errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn recv_failed(&self, e: &io::Error) {
        if e.kind() != io::ErrorKind::WouldBlock {
            self.recv_errors.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Async UDP transport using Tokio.
///
/// Cloning is cheap and every clone shares the socket, the closed flag and
/// the statistics.
#[derive(Clone)]
pub struct AsyncUdpTransport {
    socket: Arc<UdpSocket>,
    closed: Arc<AtomicBool>,
    counters: Arc<Counters>,
}

impl AsyncUdpTransport {
    /// Create a new async UDP transport bound to the given address.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    /// Returns `TransportError::BindFailed` if creating or binding the socket fails
    pub async fn bind(addr: SocketAddr, config: &TransportConfig) -> TransportResult<Self> {
        let socket = crate::configured_socket(addr, config)
            .map_err(|e| TransportError::BindFailed(format!("{addr}: {e}")))?;

        let std_socket: std::net::UdpSocket = socket.into();
        let socket = UdpSocket::from_std(std_socket)
            .map_err(|e| TransportError::BindFailed(format!("{addr}: {e}")))?;

        tracing::debug!("udp socket bound to {}", addr);
        Ok(Self::from_socket(socket))
    }

    /// Create from an existing Tokio UdpSocket.
    #[must_use]
    pub fn from_socket(socket: UdpSocket) -> Self {
        Self {
            socket: Arc::new(socket),
            closed: Arc::new(AtomicBool::new(false)),
            counters: Arc::new(Counters::default()),
        }
    }

    fn check_open(&self) -> io::Result<()> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "transport closed"));
        }
        Ok(())
    }

    fn sock_ref(&self) -> socket2::SockRef<'_> {
        socket2::SockRef::from(self.socket.as_ref())
    }
}

impl DatagramSocket for AsyncUdpTransport {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    fn try_send_to(&self, data: &[u8], dest: SocketAddr) -> io::Result<usize> {
        self.check_open()?;
        match self.socket.try_send_to(data, dest) {
            Ok(n) => {
                self.counters.sent(n);
                Ok(n)
            }
            Err(e) => {
                self.counters.send_failed(&e);
                Err(e)
            }
        }
    }

    #[cfg(target_os = "linux")]
    fn try_send_batch(&self, batch: &[Datagram<'_>]) -> io::Result<usize> {
        use std::os::fd::AsRawFd;

        self.check_open()?;
        let fd = self.socket.as_raw_fd();
        match self
            .socket
            .try_io(Interest::WRITABLE, || crate::batch::send_batch(fd, batch))
        {
            Ok(n) => {
                for datagram in &batch[..n] {
                    self.counters.sent(datagram.data.len());
                }
                Ok(n)
            }
            Err(e) => {
                self.counters.send_failed(&e);
                Err(e)
            }
        }
    }

    fn try_recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.check_open()?;
        match self.socket.try_recv_from(buf) {
            Ok((n, from)) => {
                self.counters.received(n);
                Ok((n, from))
            }
            Err(e) => {
                self.counters.recv_failed(&e);
                Err(e)
            }
        }
    }

    fn ttl(&self) -> io::Result<u32> {
        if self.socket.local_addr()?.is_ipv6() {
            self.sock_ref().unicast_hops_v6()
        } else {
            self.socket.ttl()
        }
    }

    fn set_ttl(&self, ttl: u32) -> io::Result<()> {
        if self.socket.local_addr()?.is_ipv6() {
            self.sock_ref().set_unicast_hops_v6(ttl)
        } else {
            self.socket.set_ttl(ttl)
        }
    }

    fn recv_buffer_size(&self) -> io::Result<usize> {
        self.sock_ref().recv_buffer_size()
    }

    fn set_recv_buffer_size(&self, size: usize) -> io::Result<()> {
        self.sock_ref().set_recv_buffer_size(size)
    }

    fn send_buffer_size(&self) -> io::Result<usize> {
        self.sock_ref().send_buffer_size()
    }

    fn set_send_buffer_size(&self, size: usize) -> io::Result<()> {
        self.sock_ref().set_send_buffer_size(size)
    }
}

#[async_trait]
impl Transport for AsyncUdpTransport {
    async fn send_to(&self, buf: &[u8], addr: SocketAddr) -> TransportResult<usize> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(TransportError::Closed);
        }

        match self.socket.send_to(buf, addr).await {
            Ok(sent) => {
                self.counters.sent(sent);
                Ok(sent)
            }
            Err(e) => {
                self.counters.send_failed(&e);
                Err(TransportError::Io(e))
            }
        }
    }

    async fn recv_from(&self, buf: &mut [u8]) -> TransportResult<(usize, SocketAddr)> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(TransportError::Closed);
        }

        match self.socket.recv_from(buf).await {
            Ok((size, addr)) => {
                self.counters.received(size);
                Ok((size, addr))
            }
            Err(e) => {
                self.counters.recv_failed(&e);
                Err(TransportError::Io(e))
            }
        }
    }

    async fn readable(&self) -> TransportResult<()> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(TransportError::Closed);
        }
        self.socket.readable().await?;
        Ok(())
    }

    async fn writable(&self) -> TransportResult<()> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(TransportError::Closed);
        }
        self.socket.writable().await?;
        Ok(())
    }

    async fn close(&self) -> TransportResult<()> {
        self.closed.store(true, Ordering::Relaxed);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    fn stats(&self) -> TransportStats {
        TransportStats {
            bytes_sent: self.counters.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.counters.bytes_received.load(Ordering::Relaxed),
            packets_sent: self.counters.packets_sent.load(Ordering::Relaxed),
            packets_received: self.counters.packets_received.load(Ordering::Relaxed),
            send_errors: self.counters.send_errors.load(Ordering::Relaxed),
            recv_errors: self.counters.recv_errors.load(Ordering::Relaxed),
        }
    }
}
