//! Local IP Resolution
//!
//! Best-effort guess at the address peers should use to reach this host:
//! connect a throwaway datagram socket to a public address and read the
//! chosen source address. No packet is sent. Callers can always override
//! the result through the container's start options.

use std::net::{IpAddr, Ipv4Addr, UdpSocket};

use tracing::debug;

/// Resolve the local IP peers should dial, falling back to loopback.
pub fn resolve_local_ip() -> IpAddr {
    match try_resolve() {
        Some(ip) => ip,
        None => {
            debug!("local ip resolution failed, falling back to loopback");
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        }
    }
}

fn try_resolve() -> Option<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    Some(socket.local_addr().ok()?.ip())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn always_yields_an_address() {
        let ip = resolve_local_ip();
        assert!(ip.is_ipv4());
    }
}
