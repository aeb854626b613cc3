//! Socket abstractions shared by the UDX engine and its drivers.
//!
//! [`DatagramSocket`] is the synchronous, non-blocking seam the stream engine
//! pushes packets through. It never waits: a full kernel queue surfaces as
//! [`io::ErrorKind::WouldBlock`] and the engine retries once the driver
//! reports writability. [`Transport`] adds the async readiness half that a
//! runtime driver needs to know when to call back into the engine.

use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

/// Transport layer errors
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// I/O error from underlying transport
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Transport is closed
    #[error("Transport is closed")]
    Closed,

    /// Address binding failed
    #[error("Failed to bind to address: {0}")]
    BindFailed(String),

    /// Host name resolution failed
    #[error("Lookup failed: {0}")]
    LookupFailed(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// One outgoing datagram of a batch.
#[derive(Debug, Clone, Copy)]
pub struct Datagram<'a> {
    /// Bytes to put on the wire
    pub data: &'a [u8],
    /// Destination address
    pub dest: SocketAddr,
}

/// Non-blocking datagram socket driven by the stream engine.
///
/// Implemented by [`UdpTransport`](crate::udp::UdpTransport),
/// [`AsyncUdpTransport`](crate::udp_async::AsyncUdpTransport) and by the
/// simulated links used in tests.
pub trait DatagramSocket: Send {
    /// Address the socket is bound to.
    ///
    /// # Errors
    /// Returns the underlying socket error.
    fn local_addr(&self) -> io::Result<SocketAddr>;

    /// Send one datagram without blocking.
    ///
    /// # Errors
    /// Returns `WouldBlock` when the kernel queue is full.
    fn try_send_to(&self, data: &[u8], dest: SocketAddr) -> io::Result<usize>;

    /// Send a batch of datagrams, returning how many left the socket.
    ///
    /// Datagrams are sent in order and the first one that fails stops the
    /// batch. The default sends one at a time.
    ///
    /// # Errors
    /// Returns the error of the first datagram if nothing could be sent.
    fn try_send_batch(&self, batch: &[Datagram<'_>]) -> io::Result<usize> {
        let mut sent = 0;
        for datagram in batch {
            match self.try_send_to(datagram.data, datagram.dest) {
                Ok(_) => sent += 1,
                Err(e) if sent == 0 => return Err(e),
                Err(_) => break,
            }
        }
        Ok(sent)
    }

    /// Receive one datagram without blocking.
    ///
    /// # Errors
    /// Returns `WouldBlock` when nothing is queued.
    fn try_recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;

    /// Current time-to-live of outgoing datagrams.
    ///
    /// # Errors
    /// Returns the underlying socket error.
    fn ttl(&self) -> io::Result<u32>;

    /// Change the time-to-live of outgoing datagrams.
    ///
    /// # Errors
    /// Returns the underlying socket error.
    fn set_ttl(&self, ttl: u32) -> io::Result<()>;

    /// Kernel receive buffer size.
    ///
    /// # Errors
    /// Returns the underlying socket error.
    fn recv_buffer_size(&self) -> io::Result<usize>;

    /// Set the kernel receive buffer size.
    ///
    /// # Errors
    /// Returns the underlying socket error.
    fn set_recv_buffer_size(&self, size: usize) -> io::Result<()>;

    /// Kernel send buffer size.
    ///
    /// # Errors
    /// Returns the underlying socket error.
    fn send_buffer_size(&self) -> io::Result<usize>;

    /// Set the kernel send buffer size.
    ///
    /// # Errors
    /// Returns the underlying socket error.
    fn set_send_buffer_size(&self, size: usize) -> io::Result<()>;

    /// MTU of the link towards `dest`, if the platform can tell.
    fn path_mtu(&self, dest: SocketAddr) -> Option<u32> {
        crate::mtu::link_mtu(dest)
    }
}

impl<T: DatagramSocket + Sync + ?Sized> DatagramSocket for Arc<T> {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        (**self).local_addr()
    }

    fn try_send_to(&self, data: &[u8], dest: SocketAddr) -> io::Result<usize> {
        (**self).try_send_to(data, dest)
    }

    fn try_send_batch(&self, batch: &[Datagram<'_>]) -> io::Result<usize> {
        (**self).try_send_batch(batch)
    }

    fn try_recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        (**self).try_recv_from(buf)
    }

    fn ttl(&self) -> io::Result<u32> {
        (**self).ttl()
    }

    fn set_ttl(&self, ttl: u32) -> io::Result<()> {
        (**self).set_ttl(ttl)
    }

    fn recv_buffer_size(&self) -> io::Result<usize> {
        (**self).recv_buffer_size()
    }

    fn set_recv_buffer_size(&self, size: usize) -> io::Result<()> {
        (**self).set_recv_buffer_size(size)
    }

    fn send_buffer_size(&self) -> io::Result<usize> {
        (**self).send_buffer_size()
    }

    fn set_send_buffer_size(&self, size: usize) -> io::Result<()> {
        (**self).set_send_buffer_size(size)
    }

    fn path_mtu(&self, dest: SocketAddr) -> Option<u32> {
        (**self).path_mtu(dest)
    }
}

/// Async readiness and I/O on top of a [`DatagramSocket`].
///
/// # Examples
///
/// ```no_run
/// use udx_transport::transport::Transport;
/// use udx_transport::udp_async::AsyncUdpTransport;
/// use udx_transport::TransportConfig;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let transport = AsyncUdpTransport::bind("127.0.0.1:0".parse()?, &TransportConfig::default()).await?;
///
/// transport.send_to(b"hello", "127.0.0.1:50000".parse()?).await?;
///
/// let mut buf = vec![0u8; 2048];
/// let (size, from) = transport.recv_from(&mut buf).await?;
/// println!("Received {} bytes from {}", size, from);
/// # Ok(())
/// # }
/// ```
#[async_trait]
pub trait Transport: DatagramSocket + Sync {
    /// Send data to a remote address, waiting for socket space.
    ///
    /// # Errors
    /// Returns `TransportError` if the send operation fails
    async fn send_to(&self, buf: &[u8], addr: SocketAddr) -> TransportResult<usize>;

    /// Receive one datagram, waiting until one arrives.
    ///
    /// # Errors
    /// Returns `TransportError` if the receive operation fails
    async fn recv_from(&self, buf: &mut [u8]) -> TransportResult<(usize, SocketAddr)>;

    /// Wait until the socket may have a datagram to read.
    ///
    /// # Errors
    /// Returns `TransportError::Closed` once the transport was closed
    async fn readable(&self) -> TransportResult<()>;

    /// Wait until the socket may accept a datagram.
    ///
    /// # Errors
    /// Returns `TransportError::Closed` once the transport was closed
    async fn writable(&self) -> TransportResult<()>;

    /// Mark the transport closed. Later operations return `Closed`.
    ///
    /// # Errors
    /// Returns `TransportError` if closing fails
    async fn close(&self) -> TransportResult<()>;

    /// Check if the transport is closed.
    fn is_closed(&self) -> bool;

    /// Get transport statistics.
    fn stats(&self) -> TransportStats {
        TransportStats::default()
    }
}

/// Transport statistics
#[derive(Debug, Clone, Default)]
pub struct TransportStats {
    /// Total bytes sent
    pub bytes_sent: u64,
    /// Total bytes received
    pub bytes_received: u64,
    /// Total packets sent
    pub packets_sent: u64,
    /// Total packets received
    pub packets_received: u64,
    /// Send errors
    pub send_errors: u64,
    /// Receive errors
    pub recv_errors: u64,
}

impl TransportStats {
    /// Create new empty statistics
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a successful send
    pub fn record_send(&mut self, bytes: usize) {
        self.bytes_sent += bytes as u64;
        self.packets_sent += 1;
    }

    /// Record a successful receive
    pub fn record_recv(&mut self, bytes: usize) {
        self.bytes_received += bytes as u64;
        self.packets_received += 1;
    }

    /// Record a send error
    pub fn record_send_error(&mut self) {
        self.send_errors += 1;
    }

    /// Record a receive error
    pub fn record_recv_error(&mut self) {
        self.recv_errors += 1;
    }
}
