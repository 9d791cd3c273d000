//! Detects requests addressed to the proxy itself.

use socket2::{Domain, Socket, Type};
use std::net::{IpAddr, SocketAddr};

/// Whether `ip` belongs to this machine.
///
/// Loopback and unspecified addresses always do. Any other address counts
/// when a socket can be bound to it.
pub fn is_local_ip(ip: IpAddr) -> bool {
  if ip.is_loopback() || ip.is_unspecified() {
    return true;
  }
  let addr = SocketAddr::new(ip, 0);
  match Socket::new(Domain::for_address(addr), Type::DGRAM, None) {
    Ok(socket) => socket.bind(&addr.into()).is_ok(),
    Err(e) => {
      tracing::debug!("probe socket for {} failed: {}", ip, e);
      false
    }
  }
}

/// Whether a request for `host:port` should go to the local management
/// handler of a proxy listening on `listen_port`.
///
/// A host that does not resolve is not local.
pub async fn is_local_target(host: &str, port: u16, listen_port: u16) -> bool {
  if port != listen_port {
    return false;
  }
  let host = host.trim_start_matches('[').trim_end_matches(']');
  if let Ok(ip) = host.parse::<IpAddr>() {
    return is_local_ip(ip);
  }
  match tokio::net::lookup_host((host, port)).await {
    Ok(mut addrs) => addrs.any(|addr| is_local_ip(addr.ip())),
    Err(e) => {
      tracing::debug!("resolve {} failed, treating as remote: {}", host, e);
      false
    }
  }
}
