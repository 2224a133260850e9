//! Host/port resolution.

use super::error::{Result, TransportError};
use std::net::{SocketAddr, ToSocketAddrs};

/// Resolve `host` and `port` into candidate socket addresses.
///
/// `host` may be numeric (IPv4 or IPv6) or a name. The lookup is a single
/// synchronous call with no retries.
pub fn resolve(host: &str, port: u16) -> Result<Vec<SocketAddr>> {
    if port == 0 {
        return Err(TransportError::InvalidPort(port));
    }

    let addrs: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|e| TransportError::InvalidAddress {
            host: host.to_string(),
            reason: e.to_string(),
        })?
        .collect();

    if addrs.is_empty() {
        return Err(TransportError::InvalidAddress {
            host: host.to_string(),
            reason: "no candidate addresses".to_string(),
        });
    }

    Ok(addrs)
}
