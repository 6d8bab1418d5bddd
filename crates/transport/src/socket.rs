use async_trait::async_trait;

use crate::address::Endpoint;
use crate::Result;

/// One datagram in or out, paired with the endpoint it came from or is
/// bound for. Mirrors the original `NetworkPacket`'s `(data, len, address,
/// protocol)` tuple.
#[derive(Debug, Clone)]
pub struct Packet {
    pub data: Vec<u8>,
    pub endpoint: Endpoint,
}

/// The socket boundary every transport wrapper implements: raw UDP,
/// TCP-obfuscated, and SOCKS5 all present the same async send/recv surface
/// so the session's receive loop can `tokio::select!` across every open
/// socket without caring which kind it is.
#[async_trait]
pub trait Socket: Send + Sync {
    async fn send(&self, packet: &Packet) -> Result<()>;
    async fn recv(&self) -> Result<Packet>;
    fn local_endpoint(&self) -> Option<Endpoint>;
}
