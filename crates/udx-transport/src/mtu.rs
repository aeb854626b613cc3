//! Link MTU queries.
//!
//! The stream engine caps its path MTU search at the MTU of the local link
//! towards the peer. Linux reports it through `IP_MTU`/`IPV6_MTU` on a
//! connected datagram socket; elsewhere the answer is unknown and the engine
//! falls back to its configured ceiling.

use std::net::SocketAddr;

/// MTU of the local link used to reach `dest`, if it can be determined.
#[cfg(target_os = "linux")]
#[must_use]
pub fn link_mtu(dest: SocketAddr) -> Option<u32> {
    use socket2::{Domain, Protocol, Socket, Type};
    use std::os::fd::AsRawFd;

    if dest.port() == 0 {
        return None;
    }

    let socket = Socket::new(Domain::for_address(dest), Type::DGRAM, Some(Protocol::UDP)).ok()?;
    socket.connect(&dest.into()).ok()?;

    let (level, name) = if dest.is_ipv4() {
        (libc::IPPROTO_IP, libc::IP_MTU)
    } else {
        (libc::IPPROTO_IPV6, libc::IPV6_MTU)
    };

    let mut mtu: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    // SAFETY: `mtu` and `len` are valid for the duration of the call
    let rc = unsafe {
        libc::getsockopt(
            socket.as_raw_fd(),
            level,
            name,
            std::ptr::addr_of_mut!(mtu).cast(),
            &mut len,
        )
    };

    if rc != 0 || mtu <= 0 {
        tracing::trace!("link mtu towards {} unavailable", dest);
        return None;
    }
    Some(mtu as u32)
}

/// MTU of the local link used to reach `dest`, if it can be determined.
#[cfg(not(target_os = "linux"))]
#[must_use]
pub fn link_mtu(_dest: SocketAddr) -> Option<u32> {
    None
}
