use async_trait::async_trait;
use tokio::net::UdpSocket as TokioUdpSocket;

use crate::address::{Endpoint, Protocol};
use crate::socket::{Packet, Socket};
use crate::{Error, Result};

/// A thin wrapper over `tokio::net::UdpSocket` exposing the [`Socket`]
/// trait. One instance is shared by every UDP endpoint the session talks
/// to; the remote address comes from each outgoing [`Packet`].
pub struct UdpSocket {
    inner: TokioUdpSocket,
}

impl UdpSocket {
    pub async fn bind(local_port: u16) -> Result<Self> {
        let inner = TokioUdpSocket::bind(("0.0.0.0", local_port))
            .await
            .map_err(Error::Io)?;
        Ok(Self { inner })
    }

    pub fn local_port(&self) -> Result<u16> {
        self.inner.local_addr().map(|a| a.port()).map_err(Error::Io)
    }
}

#[async_trait]
impl Socket for UdpSocket {
    async fn send(&self, packet: &Packet) -> Result<()> {
        self.inner
            .send_to(&packet.data, packet.endpoint.socket_addr())
            .await
            .map_err(Error::Io)?;
        Ok(())
    }

    async fn recv(&self) -> Result<Packet> {
        let mut buf = vec![0u8; 2048];
        let (size, from) = self.inner.recv_from(&mut buf).await.map_err(Error::Io)?;
        buf.truncate(size);
        Ok(Packet {
            data: buf,
            endpoint: Endpoint::from((from, Protocol::Udp)),
        })
    }

    fn local_endpoint(&self) -> Option<Endpoint> {
        self.inner
            .local_addr()
            .ok()
            .map(|a| Endpoint::from((a, Protocol::Udp)))
    }
}
