use async_trait::async_trait;
use parking_lot::Mutex;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket as TokioUdpSocket};

use crate::address::{Endpoint, Protocol};
use crate::socket::{Packet, Socket};
use crate::{Error, Result};

const VERSION: u8 = 5;
const METHOD_NO_AUTH: u8 = 0;
const METHOD_USER_PASS: u8 = 2;
const METHOD_NONE_ACCEPTABLE: u8 = 0xff;
const CMD_UDP_ASSOCIATE: u8 = 3;
const ATYP_IPV4: u8 = 1;
const ATYP_IPV6: u8 = 4;

/// RFC 1928 negotiation followed by a `UDP ASSOCIATE` request, used to
/// relay the call's UDP traffic through a SOCKS5 proxy. The control
/// connection is kept open for the lifetime of the association; datagrams
/// are exchanged on a locally bound UDP socket wrapped in the SOCKS5 UDP
/// request header.
pub struct Socks5Socket {
    _control: Mutex<TcpStream>,
    udp: TokioUdpSocket,
    relay_addr: SocketAddr,
}

impl Socks5Socket {
    pub async fn connect(proxy: SocketAddr, username: Option<&str>, password: Option<&str>) -> Result<Self> {
        let mut control = TcpStream::connect(proxy).await.map_err(Error::Io)?;
        negotiate_methods(&mut control, username.is_some()).await?;
        if let (Some(user), Some(pass)) = (username, password) {
            authenticate(&mut control, user, pass).await?;
        }

        let udp = TokioUdpSocket::bind(("0.0.0.0", 0)).await.map_err(Error::Io)?;
        let local_addr = udp.local_addr().map_err(Error::Io)?;
        let relay_addr = request_udp_associate(&mut control, local_addr).await?;

        Ok(Self {
            _control: Mutex::new(control),
            udp,
            relay_addr,
        })
    }

    fn frame_request(data: &[u8], dest: &Endpoint) -> Vec<u8> {
        let mut out = vec![0, 0, 0];
        match dest.addr {
            IpAddr::V4(ip) => {
                out.push(ATYP_IPV4);
                out.extend_from_slice(&ip.octets());
            }
            IpAddr::V6(ip) => {
                out.push(ATYP_IPV6);
                out.extend_from_slice(&ip.octets());
            }
        }
        out.extend_from_slice(&dest.port.to_be_bytes());
        out.extend_from_slice(data);
        out
    }

    fn parse_reply(buf: &[u8]) -> Result<(Endpoint, &[u8])> {
        if buf.len() < 4 {
            return Err(Error::Protocol("short socks5 udp reply"));
        }
        let atyp = buf[3];
        let (addr, port_offset, header_len) = match atyp {
            ATYP_IPV4 => {
                if buf.len() < 10 {
                    return Err(Error::Protocol("short socks5 ipv4 udp reply"));
                }
                (IpAddr::V4(Ipv4Addr::new(buf[4], buf[5], buf[6], buf[7])), 8, 10)
            }
            ATYP_IPV6 => {
                if buf.len() < 22 {
                    return Err(Error::Protocol("short socks5 ipv6 udp reply"));
                }
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&buf[4..20]);
                (IpAddr::V6(octets.into()), 20, 22)
            }
            _ => return Err(Error::Protocol("unsupported socks5 address type")),
        };
        let port = u16::from_be_bytes([buf[port_offset], buf[port_offset + 1]]);
        Ok((Endpoint::new(addr, port, Protocol::Udp), &buf[header_len..]))
    }
}

#[async_trait]
impl Socket for Socks5Socket {
    async fn send(&self, packet: &Packet) -> Result<()> {
        let framed = Self::frame_request(&packet.data, &packet.endpoint);
        self.udp.send_to(&framed, self.relay_addr).await.map_err(Error::Io)?;
        Ok(())
    }

    async fn recv(&self) -> Result<Packet> {
        let mut buf = vec![0u8; 2048];
        let (size, _from) = self.udp.recv_from(&mut buf).await.map_err(Error::Io)?;
        buf.truncate(size);
        let (endpoint, payload) = Self::parse_reply(&buf)?;
        Ok(Packet {
            data: payload.to_vec(),
            endpoint,
        })
    }

    fn local_endpoint(&self) -> Option<Endpoint> {
        self.udp
            .local_addr()
            .ok()
            .map(|a| Endpoint::from((a, Protocol::Udp)))
    }
}

async fn negotiate_methods(stream: &mut TcpStream, offer_user_pass: bool) -> Result<()> {
    let methods: &[u8] = if offer_user_pass {
        &[METHOD_NO_AUTH, METHOD_USER_PASS]
    } else {
        &[METHOD_NO_AUTH]
    };
    let mut greeting = vec![VERSION, methods.len() as u8];
    greeting.extend_from_slice(methods);
    stream.write_all(&greeting).await.map_err(Error::Io)?;

    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await.map_err(Error::Io)?;
    if reply[0] != VERSION || reply[1] == METHOD_NONE_ACCEPTABLE {
        return Err(Error::Protocol("socks5 proxy rejected all auth methods"));
    }
    Ok(())
}

async fn authenticate(stream: &mut TcpStream, username: &str, password: &str) -> Result<()> {
    let mut req = vec![1u8, username.len() as u8];
    req.extend_from_slice(username.as_bytes());
    req.push(password.len() as u8);
    req.extend_from_slice(password.as_bytes());
    stream.write_all(&req).await.map_err(Error::Io)?;

    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await.map_err(Error::Io)?;
    if reply[1] != 0 {
        return Err(Error::Protocol("socks5 proxy authentication failed"));
    }
    Ok(())
}

async fn request_udp_associate(stream: &mut TcpStream, local: SocketAddr) -> Result<SocketAddr> {
    let mut req = vec![VERSION, CMD_UDP_ASSOCIATE, 0];
    match local.ip() {
        IpAddr::V4(ip) => {
            req.push(ATYP_IPV4);
            req.extend_from_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            req.push(ATYP_IPV6);
            req.extend_from_slice(&ip.octets());
        }
    }
    req.extend_from_slice(&local.port().to_be_bytes());
    stream.write_all(&req).await.map_err(Error::Io)?;

    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await.map_err(Error::Io)?;
    if header[0] != VERSION || header[1] != 0 {
        return Err(Error::Protocol("socks5 udp associate request refused"));
    }
    let addr = match header[3] {
        ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            stream.read_exact(&mut octets).await.map_err(Error::Io)?;
            IpAddr::V4(octets.into())
        }
        ATYP_IPV6 => {
            let mut octets = [0u8; 16];
            stream.read_exact(&mut octets).await.map_err(Error::Io)?;
            IpAddr::V6(octets.into())
        }
        _ => return Err(Error::Protocol("unsupported socks5 address type")),
    };
    let mut port_buf = [0u8; 2];
    stream.read_exact(&mut port_buf).await.map_err(Error::Io)?;
    Ok(SocketAddr::new(addr, u16::from_be_bytes(port_buf)))
}
