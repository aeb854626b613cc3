//! Batched datagram transmission.
//!
//! On Linux a whole batch goes to the kernel in one `sendmmsg(2)` call.
//! Other platforms fall back to one `sendto` per datagram through
//! [`DatagramSocket::try_send_batch`](crate::transport::DatagramSocket::try_send_batch).

use crate::transport::Datagram;

/// Largest batch handed to the kernel in one call
pub const MAX_BATCH: usize = 20;

#[cfg(target_os = "linux")]
mod linux {
    use super::{Datagram, MAX_BATCH};
    use std::io;
    use std::mem;
    use std::net::SocketAddr;
    use std::os::fd::RawFd;
    use std::ptr;

    /// Send up to [`MAX_BATCH`] datagrams with a single `sendmmsg(2)`.
    ///
    /// Returns the number of datagrams the kernel accepted.
    ///
    /// # Errors
    /// Returns the OS error when no datagram was accepted.
    pub fn send_batch(fd: RawFd, batch: &[Datagram<'_>]) -> io::Result<usize> {
        let batch = &batch[..batch.len().min(MAX_BATCH)];
        if batch.is_empty() {
            return Ok(0);
        }

        let mut addrs: Vec<(libc::sockaddr_storage, libc::socklen_t)> =
            batch.iter().map(|d| sockaddr_from(d.dest)).collect();
        let mut iovecs: Vec<libc::iovec> = batch
            .iter()
            .map(|d| libc::iovec {
                iov_base: d.data.as_ptr() as *mut libc::c_void,
                iov_len: d.data.len(),
            })
            .collect();

        let mut msgs: Vec<libc::mmsghdr> = Vec::with_capacity(batch.len());
        for i in 0..batch.len() {
            // SAFETY: msghdr is plain old data, zero is a valid empty header
            let mut hdr: libc::msghdr = unsafe { mem::zeroed() };
            hdr.msg_name = ptr::addr_of_mut!(addrs[i].0).cast();
            hdr.msg_namelen = addrs[i].1;
            hdr.msg_iov = ptr::addr_of_mut!(iovecs[i]);
            hdr.msg_iovlen = 1;
            msgs.push(libc::mmsghdr {
                msg_hdr: hdr,
                msg_len: 0,
            });
        }

        // SAFETY: every header points into `addrs` and `iovecs`, which outlive the call
        let rc = unsafe { libc::sendmmsg(fd, msgs.as_mut_ptr(), msgs.len() as libc::c_uint, 0) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(rc as usize)
    }

    fn sockaddr_from(addr: SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
        // SAFETY: sockaddr_storage is plain old data
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let len = match addr {
            SocketAddr::V4(v4) => {
                let sin = libc::sockaddr_in {
                    sin_family: libc::AF_INET as libc::sa_family_t,
                    sin_port: v4.port().to_be(),
                    sin_addr: libc::in_addr {
                        s_addr: u32::from_ne_bytes(v4.ip().octets()),
                    },
                    sin_zero: [0; 8],
                };
                // SAFETY: sockaddr_storage is large and aligned enough for any sockaddr
                unsafe { ptr::write(ptr::addr_of_mut!(storage).cast(), sin) };
                mem::size_of::<libc::sockaddr_in>()
            }
            SocketAddr::V6(v6) => {
                let sin6 = libc::sockaddr_in6 {
                    sin6_family: libc::AF_INET6 as libc::sa_family_t,
                    sin6_port: v6.port().to_be(),
                    sin6_flowinfo: v6.flowinfo(),
                    sin6_addr: libc::in6_addr {
                        s6_addr: v6.ip().octets(),
                    },
                    sin6_scope_id: v6.scope_id(),
                };
                // SAFETY: as above
                unsafe { ptr::write(ptr::addr_of_mut!(storage).cast(), sin6) };
                mem::size_of::<libc::sockaddr_in6>()
            }
        };
        (storage, len as libc::socklen_t)
    }
}

#[cfg(target_os = "linux")]
pub use linux::send_batch;

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;
    use std::net::{SocketAddr, UdpSocket};
    use std::os::fd::AsRawFd;

    #[test]
    fn test_send_batch_delivers_in_order() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        let dest: SocketAddr = receiver.local_addr().unwrap();
        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();

        let payloads: Vec<Vec<u8>> = (0..5u8).map(|i| vec![i; 10 + i as usize]).collect();
        let batch: Vec<Datagram<'_>> = payloads
            .iter()
            .map(|p| Datagram { data: p, dest })
            .collect();

        let sent = send_batch(sender.as_raw_fd(), &batch).unwrap();
        assert_eq!(sent, 5);

        let mut buf = [0u8; 64];
        for expected in &payloads {
            let (n, from) = receiver.recv_from(&mut buf).unwrap();
            assert_eq!(&buf[..n], expected.as_slice());
            assert_eq!(from, sender.local_addr().unwrap());
        }
    }

    #[test]
    fn test_send_batch_caps_at_max_batch() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        let dest = receiver.local_addr().unwrap();
        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();

        let batch: Vec<Datagram<'_>> = (0..MAX_BATCH + 5)
            .map(|_| Datagram { data: b"x", dest })
            .collect();
        assert_eq!(send_batch(sender.as_raw_fd(), &batch).unwrap(), MAX_BATCH);
        assert_eq!(send_batch(sender.as_raw_fd(), &[]).unwrap(), 0);
    }
}
