use std::net::{IpAddr, SocketAddr};

/// Protocol a packet was sent or received over. Carried alongside the
/// address since the session layer treats the same peer differently
/// depending on transport (relay-over-TCP counts double against RTT
/// hysteresis, per the endpoint-switching rules).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Udp,
    Tcp,
}

/// A network endpoint: either bare v4/v6 address or a full socket address.
/// Mirrors the original's `NetworkAddress` union without the C union.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub addr: IpAddr,
    pub port: u16,
    pub protocol: Protocol,
}

impl Endpoint {
    pub fn new(addr: IpAddr, port: u16, protocol: Protocol) -> Self {
        Self { addr, port, protocol }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.addr, self.port)
    }
}

impl From<(SocketAddr, Protocol)> for Endpoint {
    fn from((addr, protocol): (SocketAddr, Protocol)) -> Self {
        Self {
            addr: addr.ip(),
            port: addr.port(),
            protocol,
        }
    }
}
