//! ## Wire framing and cryptographic facade
//!
//! This crate is the "ambient" layer the session state machine is built on:
//! little-endian byte streams with the TL length prefix, the buffer pool and
//! blocking queue primitives, the crypto facade (AES-IGE/AES-CTR/SHA/CSPRNG),
//! and the legacy / MTProto-2 packet framing itself.
//!
//! Nothing in this crate understands sequence numbers, endpoints, or jitter;
//! it only encodes and decodes bytes.

pub mod bytestream;
pub mod buffer_pool;
pub mod blocking_queue;
pub mod crypto;
pub mod packet;
pub mod reassembler;

use std::str::Utf8Error;

#[derive(Debug)]
pub enum Error {
    /// Not enough bytes remained in the source to satisfy the read.
    EndOfBuffer,
    /// The bytes did not form a valid packet of the requested kind.
    InvalidInput,
    /// A message authentication check failed.
    IntegrityFailed,
    Utf8Error(Utf8Error),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<Utf8Error> for Error {
    fn from(value: Utf8Error) -> Self {
        Self::Utf8Error(value)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
