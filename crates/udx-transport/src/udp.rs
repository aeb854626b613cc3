//! Plain UDP socket transport.
//!
//! A non-blocking std socket set up through socket2. It needs no runtime,
//! which makes it the socket of choice for driving the engine by hand and
//! for benchmarks.

use crate::transport::{Datagram, DatagramSocket};
use crate::TransportConfig;
use std::io;
use std::net::{SocketAddr, UdpSocket};

/// Non-blocking UDP socket
pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    /// Create a new UDP transport bound to the given address
    ///
    /// # Examples
    /// ```no_run
    /// use udx_transport::udp::UdpTransport;
    /// use udx_transport::TransportConfig;
    ///
    /// let transport = UdpTransport::bind("127.0.0.1:0".parse().unwrap(), &TransportConfig::default()).unwrap();
    /// println!("Listening on {}", transport.local_addr().unwrap());
    /// ```
    ///
    /// # Errors
    /// Returns the socket error if creating, configuring or binding fails.
    pub fn bind(addr: SocketAddr, config: &TransportConfig) -> io::Result<Self> {
        let socket = crate::configured_socket(addr, config)?;
        Ok(Self {
            socket: socket.into(),
        })
    }

    /// Get the local address
    ///
    /// # Errors
    /// Returns the socket error.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Borrow the underlying socket
    #[must_use]
    pub fn socket(&self) -> &UdpSocket {
        &self.socket
    }

    fn sock_ref(&self) -> socket2::SockRef<'_> {
        socket2::SockRef::from(&self.socket)
    }
}

impl DatagramSocket for UdpTransport {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    fn try_send_to(&self, data: &[u8], dest: SocketAddr) -> io::Result<usize> {
        self.socket.send_to(data, dest)
    }

    #[cfg(target_os = "linux")]
    fn try_send_batch(&self, batch: &[Datagram<'_>]) -> io::Result<usize> {
        use std::os::fd::AsRawFd;
        crate::batch::send_batch(self.socket.as_raw_fd(), batch)
    }

    fn try_recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.socket.recv_from(buf)
    }

    fn ttl(&self) -> io::Result<u32> {
        if self.socket.local_addr()?.is_ipv6() {
            self.sock_ref().unicast_hops_v6()
        } else {
            self.sock_ref().ttl_v4()
        }
    }

    fn set_ttl(&self, ttl: u32) -> io::Result<()> {
        if self.socket.local_addr()?.is_ipv6() {
            self.sock_ref().set_unicast_hops_v6(ttl)
        } else {
            self.sock_ref().set_ttl_v4(ttl)
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
