use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::address::Endpoint;
use crate::socket::{Packet, Socket};
use crate::{Error, Result};

/// An in-memory socket pair for tests: whatever is sent on one end shows up
/// on the other's `recv`, with no actual network traffic. Lets session
/// integration tests exercise the handshake and reliability layers without
/// binding real ports.
pub struct LoopbackSocket {
    local: Endpoint,
    outbox: mpsc::UnboundedSender<Packet>,
    inbox: tokio::sync::Mutex<mpsc::UnboundedReceiver<Packet>>,
}

impl LoopbackSocket {
    /// Creates a connected pair: packets sent on `a` are delivered to `b`'s
    /// `recv` and vice versa, with the `endpoint` on each arriving packet
    /// set to the sender's own local endpoint.
    pub fn pair(endpoint_a: Endpoint, endpoint_b: Endpoint) -> (Self, Self) {
        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();
        let a = Self {
            local: endpoint_a,
            outbox: tx_b,
            inbox: tokio::sync::Mutex::new(rx_a),
        };
        let b = Self {
            local: endpoint_b,
            outbox: tx_a,
            inbox: tokio::sync::Mutex::new(rx_b),
        };
        (a, b)
    }
}

#[async_trait]
impl Socket for LoopbackSocket {
    async fn send(&self, packet: &Packet) -> Result<()> {
        let mut forwarded = packet.clone();
        forwarded.endpoint = self.local;
        self.outbox
            .send(forwarded)
            .map_err(|_| Error::ConnectionClosed)
    }

    async fn recv(&self) -> Result<Packet> {
        self.inbox
            .lock()
            .await
            .recv()
            .await
            .ok_or(Error::ConnectionClosed)
    }

    fn local_endpoint(&self) -> Option<Endpoint> {
        Some(self.local)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Protocol;
    use std::net::{IpAddr, Ipv4Addr};

    #[tokio::test]
    async fn pair_delivers_packets_with_sender_endpoint() {
        let endpoint_a = Endpoint::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 1000, Protocol::Udp);
        let endpoint_b = Endpoint::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 2000, Protocol::Udp);
        let (a, b) = LoopbackSocket::pair(endpoint_a, endpoint_b);

        a.send(&Packet {
            data: b"hello".to_vec(),
            endpoint: endpoint_b,
        })
        .await
        .unwrap();

        let received = b.recv().await.unwrap();
        assert_eq!(received.data, b"hello");
        assert_eq!(received.endpoint, endpoint_a);
    }
}
