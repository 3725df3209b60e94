//! Socket addresses of simulated radios.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// Address and port of one end of a radio's UDP stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint(SocketAddr);

impl Endpoint {
    #[must_use]
    pub const fn new(addr: IpAddr, port: u16) -> Self {
        Self(SocketAddr::new(addr, port))
    }

    /// Loopback on `port`; port 0 lets the OS choose.
    #[must_use]
    pub const fn localhost(port: u16) -> Self {
        Self::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    /// Endpoint of radio `radio` when radios are numbered up from
    /// `base_port`. A base of 0 gives every radio an ephemeral port.
    #[must_use]
    pub fn radio(addr: IpAddr, base_port: u16, radio: usize) -> Self {
        let port = match base_port {
            0 => 0,
            base => u16::try_from(radio).map_or(u16::MAX, |r| base.saturating_add(r)),
        };
        Self::new(addr, port)
    }

    #[must_use]
    pub const fn ip(&self) -> IpAddr {
        self.0.ip()
    }

    #[must_use]
    pub const fn port(&self) -> u16 {
        self.0.port()
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self(addr)
    }
}

impl From<Endpoint> for SocketAddr {
    fn from(endpoint: Endpoint) -> Self {
        endpoint.0
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn radios_count_up_from_the_base() {
        let addr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7));
        assert_eq!(Endpoint::radio(addr, 8000, 0).port(), 8000);
        assert_eq!(Endpoint::radio(addr, 8000, 3).port(), 8003);
        assert_eq!(Endpoint::radio(addr, 8000, 3).ip(), addr);
        assert_eq!(Endpoint::radio(addr, u16::MAX, 1).port(), u16::MAX);
    }

    #[test]
    fn zero_base_stays_ephemeral() {
        assert_eq!(Endpoint::radio(IpAddr::V4(Ipv4Addr::LOCALHOST), 0, 5), Endpoint::localhost(0));
    }

    #[test]
    fn displays_as_socket_addr() {
        let addr: SocketAddr = "127.0.0.1:9003".parse().unwrap();
        assert_eq!(Endpoint::from(addr).to_string(), "127.0.0.1:9003");
        assert_eq!(SocketAddr::from(Endpoint::localhost(9003)), addr);
    }
}
