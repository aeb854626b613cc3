//! # UDX Transport
//!
//! Datagram socket layer underneath the UDX stream engine.
//!
//! This crate provides:
//! - The [`DatagramSocket`](transport::DatagramSocket) seam the engine drives
//!   (non-blocking send, batched send, receive, TTL and buffer options)
//! - A blocking-free std UDP socket and a Tokio UDP socket configured through socket2
//! - `sendmmsg(2)` batching on Linux
//! - Link MTU queries, host name lookup and network interface watching

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod batch;
pub mod interface;
pub mod lookup;
pub mod mtu;
pub mod transport;
pub mod udp;
pub mod udp_async;

pub use interface::{InterfaceAddress, InterfaceChange, InterfaceWatcher};
pub use lookup::{LookupFamily, lookup};
pub use transport::{
    Datagram, DatagramSocket, Transport, TransportError, TransportResult, TransportStats,
};
pub use udp::UdpTransport;
pub use udp_async::AsyncUdpTransport;

/// Default time-to-live for outgoing datagrams
pub const DEFAULT_TTL: u32 = 64;

/// Default kernel send and receive buffer size in bytes
pub const DEFAULT_BUFFER_SIZE: usize = 212_992;

/// Socket configuration applied at bind time
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Time-to-live (IPv4) or unicast hop limit (IPv6)
    pub ttl: u32,
    /// Receive buffer size
    pub recv_buffer_size: usize,
    /// Send buffer size
    pub send_buffer_size: usize,
    /// Accept IPv4 traffic on IPv6 sockets through mapped addresses
    pub dual_stack: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_TTL,
            recv_buffer_size: DEFAULT_BUFFER_SIZE,
            send_buffer_size: DEFAULT_BUFFER_SIZE,
            dual_stack: true,
        }
    }
}

/// Build a non-blocking, bound socket2 socket from `config`.
pub(crate) fn configured_socket(
    addr: std::net::SocketAddr,
    config: &TransportConfig,
) -> std::io::Result<socket2::Socket> {
    use socket2::{Domain, Protocol, Socket, Type};

    let domain = Domain::for_address(addr);
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;

    if addr.is_ipv6() {
        socket.set_only_v6(!config.dual_stack)?;
        socket.set_unicast_hops_v6(config.ttl)?;
    } else {
        socket.set_ttl_v4(config.ttl)?;
    }

    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;

    // Buffer sizes are best effort, the kernel clamps them to its limits
    if let Err(e) = socket.set_recv_buffer_size(config.recv_buffer_size) {
        tracing::debug!("recv buffer size {} rejected: {}", config.recv_buffer_size, e);
    }
    if let Err(e) = socket.set_send_buffer_size(config.send_buffer_size) {
        tracing::debug!("send buffer size {} rejected: {}", config.send_buffer_size, e);
    }

    Ok(socket)
}
