use async_trait::async_trait;
use codec::crypto::{AesCtrState, CryptoProvider};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::address::{Endpoint, Protocol};
use crate::socket::{Packet, Socket};
use crate::{Error, Result};

const HANDSHAKE_LEN: usize = 64;

/// First-4-byte patterns a real handshake must not collide with, so a
/// passive observer can't fingerprint the stream as this protocol by
/// comparing against other well-known plaintext headers.
const DISALLOWED_PREFIXES: [u32; 5] = [0x44414548, 0x54534f50, 0x20544547, 0x4954504f, 0xeeeeeeee];

fn is_valid_handshake_prefix(bytes: &[u8]) -> bool {
    if bytes[0] == 0xef {
        return false;
    }
    let prefix = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    !DISALLOWED_PREFIXES.contains(&prefix)
}

/// Generates a 64-byte obfuscation handshake satisfying the wire
/// constraints (§4.5): bytes 0..4 avoid a small set of recognizable
/// plaintext headers, and bytes 56..59 are non-zero (used by the peer as a
/// protocol-version marker).
fn generate_handshake(crypto: &dyn CryptoProvider) -> [u8; HANDSHAKE_LEN] {
    let mut handshake = [0u8; HANDSHAKE_LEN];
    loop {
        crypto.rand_bytes(&mut handshake);
        if is_valid_handshake_prefix(&handshake) && handshake[56..59].iter().any(|&b| b != 0) {
            break;
        }
    }
    handshake
}

fn derive_ctr_states(handshake: &[u8; HANDSHAKE_LEN]) -> (AesCtrState, AesCtrState) {
    let mut encrypt_key = [0u8; 32];
    encrypt_key.copy_from_slice(&handshake[8..40]);
    let mut encrypt_iv = [0u8; 16];
    encrypt_iv.copy_from_slice(&handshake[40..56]);

    let mut reversed = [0u8; 48];
    for (i, byte) in reversed.iter_mut().enumerate() {
        *byte = handshake[55 - i];
    }
    let mut decrypt_key = [0u8; 32];
    decrypt_key.copy_from_slice(&reversed[0..32]);
    let mut decrypt_iv = [0u8; 16];
    decrypt_iv.copy_from_slice(&reversed[32..48]);

    (
        AesCtrState::new(&encrypt_key, &encrypt_iv),
        AesCtrState::new(&decrypt_key, &decrypt_iv),
    )
}

/// Wraps a TCP stream with the obfuscation handshake: the first 56
/// handshake bytes go out in the clear, after which every byte in both
/// directions is AES-CTR keystreamed with independently derived encrypt
/// and decrypt states.
pub struct TcpObfuscatedSocket {
    stream: Mutex<TcpStream>,
    encrypt: Mutex<AesCtrState>,
    decrypt: Mutex<AesCtrState>,
    peer: Endpoint,
}

impl TcpObfuscatedSocket {
    pub async fn connect(crypto: &dyn CryptoProvider, peer: Endpoint) -> Result<Self> {
        let mut stream = TcpStream::connect(peer.socket_addr()).await.map_err(Error::Io)?;
        let handshake = generate_handshake(crypto);
        stream.write_all(&handshake).await.map_err(Error::Io)?;
        let (encrypt, decrypt) = derive_ctr_states(&handshake);
        Ok(Self {
            stream: Mutex::new(stream),
            encrypt: Mutex::new(encrypt),
            decrypt: Mutex::new(decrypt),
            peer,
        })
    }
}

#[async_trait]
impl Socket for TcpObfuscatedSocket {
    async fn send(&self, packet: &Packet) -> Result<()> {
        let mut buf = packet.data.clone();
        self.encrypt.lock().apply(&mut buf);
        let mut stream = self.stream.lock();
        stream.write_all(&buf).await.map_err(Error::Io)
    }

    async fn recv(&self) -> Result<Packet> {
        let mut buf = vec![0u8; 2048];
        let size = {
            let mut stream = self.stream.lock();
            stream.read(&mut buf).await.map_err(Error::Io)?
        };
        if size == 0 {
            return Err(Error::ConnectionClosed);
        }
        buf.truncate(size);
        self.decrypt.lock().apply(&mut buf);
        Ok(Packet {
            data: buf,
            endpoint: Endpoint::new(self.peer.addr, self.peer.port, Protocol::Tcp),
        })
    }

    fn local_endpoint(&self) -> Option<Endpoint> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use codec::crypto::DefaultCrypto;

    #[test]
    fn handshake_avoids_disallowed_prefixes_and_has_nonzero_marker() {
        for _ in 0..64 {
            let handshake = generate_handshake(&DefaultCrypto);
            assert_ne!(handshake[0], 0xef);
            assert!(handshake[56..59].iter().any(|&b| b != 0));
        }
    }

    #[test]
    fn ctr_states_derived_from_same_handshake_are_mirror_images() {
        let handshake = generate_handshake(&DefaultCrypto);
        let (mut enc_a, mut dec_a) = derive_ctr_states(&handshake);
        let (mut enc_b, _dec_b) = derive_ctr_states(&handshake);

        let mut plaintext = b"hello obfuscated world!!".to_vec();
        let original = plaintext.clone();
        enc_a.apply(&mut plaintext);
        assert_ne!(plaintext, original);

        // encrypting again with a fresh identical-keyed state reproduces
        // the same ciphertext, so the handshake deterministically selects
        // the keystream.
        let mut plaintext2 = original.clone();
        enc_b.apply(&mut plaintext2);
        assert_eq!(plaintext, plaintext2);

        dec_a.apply(&mut plaintext);
        assert_ne!(plaintext, original, "decrypt state must differ from encrypt state");
    }
}
