//! Network interface enumeration and change notification.
//!
//! [`InterfaceWatcher`] keeps a sorted snapshot of the host's interface
//! addresses and, once started, re-enumerates them on a fixed period,
//! reporting each change over a channel.

use crate::transport::{TransportError, TransportResult};
use std::io;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// One address assigned to a network interface
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InterfaceAddress {
    /// Interface name
    pub name: String,
    /// Assigned address
    pub addr: IpAddr,
    /// Loopback interface
    pub internal: bool,
}

/// Notification sent by a running [`InterfaceWatcher`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InterfaceChange {
    /// The address set differs from the previous snapshot
    Changed(Vec<InterfaceAddress>),
    /// Enumeration failed
    Failed(String),
}

/// List the host's interface addresses, sorted by interface name then address.
///
/// # Errors
/// Returns the OS error if the interface list cannot be read.
#[cfg(unix)]
pub fn interface_addresses() -> io::Result<Vec<InterfaceAddress>> {
    use std::ffi::CStr;
    use std::net::{Ipv4Addr, Ipv6Addr};

    let mut head: *mut libc::ifaddrs = std::ptr::null_mut();
    // SAFETY: getifaddrs writes a list head we free below
    if unsafe { libc::getifaddrs(&mut head) } != 0 {
        return Err(io::Error::last_os_error());
    }

    let mut out = Vec::new();
    let mut cursor = head;
    while !cursor.is_null() {
        // SAFETY: non-null entries of the list stay valid until freeifaddrs
        let ifa = unsafe { &*cursor };
        cursor = ifa.ifa_next;

        if ifa.ifa_addr.is_null() || ifa.ifa_name.is_null() {
            continue;
        }

        // SAFETY: ifa_addr is non-null and its family tells us the concrete layout
        let addr = unsafe {
            match i32::from((*ifa.ifa_addr).sa_family) {
                libc::AF_INET => {
                    let sin = &*ifa.ifa_addr.cast::<libc::sockaddr_in>();
                    IpAddr::V4(Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr)))
                }
                libc::AF_INET6 => {
                    let sin6 = &*ifa.ifa_addr.cast::<libc::sockaddr_in6>();
                    IpAddr::V6(Ipv6Addr::from(sin6.sin6_addr.s6_addr))
                }
                _ => continue,
            }
        };

        // SAFETY: ifa_name is a valid NUL-terminated string
        let name = unsafe { CStr::from_ptr(ifa.ifa_name) }
            .to_string_lossy()
            .into_owned();

        out.push(InterfaceAddress {
            name,
            addr,
            internal: ifa.ifa_flags & libc::IFF_LOOPBACK as libc::c_uint != 0,
        });
    }

    // SAFETY: head came from a successful getifaddrs
    unsafe { libc::freeifaddrs(head) };

    out.sort();
    out.dedup();
    Ok(out)
}

/// List the host's interface addresses.
///
/// # Errors
/// Always fails on platforms without `getifaddrs`.
#[cfg(not(unix))]
pub fn interface_addresses() -> io::Result<Vec<InterfaceAddress>> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "interface enumeration is not supported on this platform",
    ))
}

/// Periodic interface change watcher
pub struct InterfaceWatcher {
    snapshot: Arc<Mutex<Vec<InterfaceAddress>>>,
    task: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl InterfaceWatcher {
    /// Take an initial snapshot of the interface addresses.
    ///
    /// # Errors
    /// Returns the OS error if the interface list cannot be read.
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            snapshot: Arc::new(Mutex::new(interface_addresses()?)),
            task: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    /// Current snapshot
    #[must_use]
    pub fn addresses(&self) -> Vec<InterfaceAddress> {
        self.snapshot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Re-enumerate now. Returns the new list if it differs from the snapshot.
    ///
    /// # Errors
    /// Returns the OS error if the interface list cannot be read.
    pub fn refresh(&self) -> io::Result<Option<Vec<InterfaceAddress>>> {
        refresh_snapshot(&self.snapshot)
    }

    /// Start polling every `frequency`, sending changes to `tx`.
    ///
    /// The first check runs immediately. Restarting replaces the running poller.
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    /// Returns `TransportError::Closed` after [`close`](Self::close) and
    /// `TransportError::InvalidConfig` for a zero frequency.
    pub fn start(
        &self,
        frequency: Duration,
        tx: mpsc::UnboundedSender<InterfaceChange>,
    ) -> TransportResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        if frequency.is_zero() {
            return Err(TransportError::InvalidConfig(
                "interface poll frequency must be non-zero".into(),
            ));
        }

        let snapshot = Arc::clone(&self.snapshot);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(frequency);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let change = match refresh_snapshot(&snapshot) {
                    Ok(Some(addrs)) => InterfaceChange::Changed(addrs),
                    Ok(None) => continue,
                    Err(e) => InterfaceChange::Failed(e.to_string()),
                };
                if tx.send(change).is_err() {
                    break;
                }
            }
        });

        let previous = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
        Ok(())
    }

    /// Stop polling. The snapshot is kept.
    pub fn stop(&self) {
        if let Some(handle) = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }

    /// Stop polling and refuse further starts.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.stop();
    }

    /// Whether [`close`](Self::close) was called
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Drop for InterfaceWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn refresh_snapshot(
    snapshot: &Mutex<Vec<InterfaceAddress>>,
) -> io::Result<Option<Vec<InterfaceAddress>>> {
    let current = interface_addresses()?;
    let mut guard = snapshot.lock().unwrap_or_else(PoisonError::into_inner);
    if *guard == current {
        return Ok(None);
    }
    *guard = current.clone();
    Ok(Some(current))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_interface_addresses_sorted_with_loopback() {
        let addrs = interface_addresses().unwrap();
        assert!(addrs.windows(2).all(|w| w[0] <= w[1]));
        assert!(addrs.iter().any(|a| a.internal && a.addr.is_loopback()));
    }

    #[test]
    fn test_refresh_unchanged() {
        let watcher = InterfaceWatcher::new().unwrap();
        assert!(!watcher.addresses().is_empty());
        assert_eq!(watcher.refresh().unwrap(), None);
    }

    #[test]
    fn test_refresh_detects_stale_snapshot() {
        let watcher = InterfaceWatcher::new().unwrap();
        watcher.snapshot.lock().unwrap().clear();
        let changed = watcher.refresh().unwrap().unwrap();
        assert_eq!(changed, watcher.addresses());
    }

    #[tokio::test]
    async fn test_start_reports_change() {
        let watcher = InterfaceWatcher::new().unwrap();
        watcher.snapshot.lock().unwrap().clear();

        let (tx, mut rx) = mpsc::unbounded_channel();
        watcher.start(Duration::from_millis(10), tx).unwrap();

        let change = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(change, InterfaceChange::Changed(ref a) if !a.is_empty()));
        watcher.stop();
    }

    #[tokio::test]
    async fn test_closed_watcher_refuses_start() {
        let watcher = InterfaceWatcher::new().unwrap();
        watcher.close();
        assert!(watcher.is_closed());

        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(matches!(
            watcher.start(Duration::from_millis(10), tx),
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_zero_frequency_rejected() {
        let watcher = InterfaceWatcher::new().unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(watcher.start(Duration::ZERO, tx).is_err());
    }
}
