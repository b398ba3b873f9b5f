//! # Endpoint Addressing
//!
//! Endpoints are IPv4 `(address, port)` pairs given in textual form. An
//! absent or empty string, or `"0.0.0.0"`, means *any* for a local address
//! and *unknown* for a remote or multicast one.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use crate::error::{Error, Result};

/// Parse a textual IPv4 address; absent, empty and `0.0.0.0` map to
/// [`Ipv4Addr::UNSPECIFIED`].
pub fn parse_ipv4(addr: Option<&str>) -> Result<Ipv4Addr> {
    match addr.map(str::trim) {
        None | Some("") => Ok(Ipv4Addr::UNSPECIFIED),
        Some(s) => s
            .parse()
            .map_err(|_| Error::InvalidArgument("malformed IPv4 address")),
    }
}

/// Local endpoint: any address and/or any port are allowed.
pub fn local_endpoint(addr: Option<&str>, port: u16) -> Result<SocketAddrV4> {
    Ok(SocketAddrV4::new(parse_ipv4(addr)?, port))
}

/// Remote endpoint, `None` when the address or the port is unknown.
pub fn remote_endpoint(addr: Option<&str>, port: u16) -> Result<Option<SocketAddrV4>> {
    let ip = parse_ipv4(addr)?;
    if ip.is_unspecified() || port == 0 {
        return Ok(None);
    }
    Ok(Some(SocketAddrV4::new(ip, port)))
}

/// Remote endpoint of a connection: an address implies a non-zero port.
pub fn peer_endpoint(addr: Option<&str>, port: u16) -> Result<Option<SocketAddrV4>> {
    let ip = parse_ipv4(addr)?;
    if ip.is_unspecified() {
        return Ok(None);
    }
    if port == 0 {
        return Err(Error::InvalidArgument("remote port 0 with a remote address"));
    }
    Ok(Some(SocketAddrV4::new(ip, port)))
}

/// IPv4 view of a socket address; `None` for IPv6 or the unspecified
/// endpoint.
pub fn known_v4(addr: SocketAddr) -> Option<SocketAddrV4> {
    match addr {
        SocketAddr::V4(v4) if !v4.ip().is_unspecified() && v4.port() != 0 => Some(v4),
        _ => None,
    }
}

/// Endpoints of a UDP socket at creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpEndpoint {
    /// Local address and port; port 0 lets the system allocate one.
    pub local: SocketAddrV4,
    /// Default destination, if known.
    pub remote: Option<SocketAddrV4>,
    /// Multicast group to receive from.
    pub multicast: Option<Ipv4Addr>,
}

impl UdpEndpoint {
    /// Any local address, ephemeral port, no remote.
    pub fn any() -> Self {
        UdpEndpoint {
            local: SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0),
            remote: None,
            multicast: None,
        }
    }

    /// Build from textual endpoints.
    pub fn parse(
        local_addr: Option<&str>,
        local_port: u16,
        remote_addr: Option<&str>,
        remote_port: u16,
        mcast_addr: Option<&str>,
    ) -> Result<Self> {
        let multicast = match parse_ipv4(mcast_addr)? {
            ip if ip.is_unspecified() => None,
            ip if ip.is_multicast() => Some(ip),
            _ => return Err(Error::InvalidArgument("not a multicast address")),
        };
        Ok(UdpEndpoint {
            local: local_endpoint(local_addr, local_port)?,
            remote: remote_endpoint(remote_addr, remote_port)?,
            multicast,
        })
    }

    pub fn with_local(mut self, local: SocketAddrV4) -> Self {
        self.local = local;
        self
    }

    pub fn with_remote(mut self, remote: SocketAddrV4) -> Self {
        self.remote = Some(remote);
        self
    }
}

impl Default for UdpEndpoint {
    fn default() -> Self {
        Self::any()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn any_forms() {
        assert_eq!(parse_ipv4(None).unwrap(), Ipv4Addr::UNSPECIFIED);
        assert_eq!(parse_ipv4(Some("")).unwrap(), Ipv4Addr::UNSPECIFIED);
        assert_eq!(parse_ipv4(Some("0.0.0.0")).unwrap(), Ipv4Addr::UNSPECIFIED);
        assert!(parse_ipv4(Some("300.1.1.1")).is_err());
        assert!(parse_ipv4(Some("host.example")).is_err());
    }

    #[test]
    fn unknown_remote() {
        assert_eq!(remote_endpoint(Some("0.0.0.0"), 5000).unwrap(), None);
        assert_eq!(remote_endpoint(Some("10.0.0.1"), 0).unwrap(), None);
        assert_eq!(
            remote_endpoint(Some("10.0.0.1"), 5000).unwrap(),
            Some("10.0.0.1:5000".parse().unwrap())
        );
    }

    #[test]
    fn peer_needs_port() {
        assert!(peer_endpoint(Some("10.0.0.1"), 0).is_err());
        assert_eq!(peer_endpoint(None, 0).unwrap(), None);
    }

    #[test]
    fn udp_endpoint_parse() {
        let ep = UdpEndpoint::parse(Some("127.0.0.1"), 0, Some(""), 0, Some("239.1.2.3")).unwrap();
        assert_eq!(ep.local, "127.0.0.1:0".parse().unwrap());
        assert_eq!(ep.remote, None);
        assert_eq!(ep.multicast, Some(Ipv4Addr::new(239, 1, 2, 3)));
        assert!(UdpEndpoint::parse(None, 0, None, 0, Some("10.0.0.1")).is_err());
    }
}
