//! Host name resolution.

use crate::transport::{TransportError, TransportResult};
use std::net::IpAddr;

/// Address family filter for [`lookup`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LookupFamily {
    /// First address of either family
    #[default]
    Any,
    /// IPv4 only
    V4,
    /// IPv6 only
    V6,
}

impl LookupFamily {
    /// Whether `ip` belongs to this family
    #[must_use]
    pub fn matches(self, ip: &IpAddr) -> bool {
        match self {
            Self::Any => true,
            Self::V4 => ip.is_ipv4(),
            Self::V6 => ip.is_ipv6(),
        }
    }
}

/// Resolve `host` to the first address of the requested family.
///
/// Literal addresses are returned without touching the resolver.
///
/// # Errors
/// Returns `TransportError::LookupFailed` when resolution fails or yields no
/// address of the requested family.
pub async fn lookup(host: &str, family: LookupFamily) -> TransportResult<IpAddr> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        if family.matches(&ip) {
            return Ok(ip);
        }
        return Err(TransportError::LookupFailed(format!(
            "{host}: address family mismatch"
        )));
    }

    let addrs = tokio::net::lookup_host((host, 0))
        .await
        .map_err(|e| TransportError::LookupFailed(format!("{host}: {e}")))?;

    let found = addrs.map(|addr| addr.ip()).find(|ip| family.matches(ip));
    tracing::debug!("lookup {} ({:?}) -> {:?}", host, family, found);
    found.ok_or_else(|| TransportError::LookupFailed(format!("{host}: no matching address")))
}
