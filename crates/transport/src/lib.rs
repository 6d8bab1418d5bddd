//! ## Socket abstraction
//!
//! `Send`/`Receive`/`Open`/`Close` plus cross-platform multiplexing in the
//! original becomes a `Socket` trait object and `tokio::select!` here: raw
//! UDP, TCP-obfuscated, and SOCKS5 all expose the same async send/recv
//! surface so the session's receive loop doesn't need to know which kind of
//! socket it's talking to.

pub mod address;
pub mod loopback;
pub mod socket;
pub mod socks5;
pub mod tcp_obfuscated;
pub mod udp;

pub use address::{Endpoint, Protocol};
pub use loopback::LoopbackSocket;
pub use socket::{Packet, Socket};
pub use socks5::Socks5Socket;
pub use tcp_obfuscated::TcpObfuscatedSocket;
pub use udp::UdpSocket;

#[derive(Debug)]
pub enum Error {
    Io(std::io::Error),
    ConnectionClosed,
    Protocol(&'static str),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Io(e) => write!(f, "transport io error: {e}"),
            Error::ConnectionClosed => write!(f, "connection closed"),
            Error::Protocol(msg) => write!(f, "protocol error: {msg}"),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
