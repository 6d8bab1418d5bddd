//! Legacy and MTProto-2 packet framing (§4.9).
//!
//! Both formats share the same outer envelope: 16 B call-id/peer-tag, 8 B
//! key fingerprint, 16 B message key, then `AES-IGE` of an inner payload.
//! What differs is how the message key is derived and how the inner bytes
//! are laid out; [`kdf1`](crate::crypto::kdf1) and
//! [`kdf2`](crate::crypto::kdf2) do the derivation, this module does the
//! framing around it.

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::bytestream::{Reader, Writer};
use crate::crypto::{self, CryptoProvider};
use crate::{Error, Result};

pub const CALL_ID_LEN: usize = 16;
pub const KEY_FINGERPRINT_LEN: usize = 8;
pub const MSG_KEY_LEN: usize = 16;

/// `PKT_*` wire type tags. Carried as the first byte of the inner frame in
/// both formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum PacketType {
    Init = 1,
    InitAck = 2,
    StreamData = 3,
    LanEndpoint = 4,
    NetworkChanged = 5,
    Ping = 6,
    Pong = 7,
    StreamDataX2 = 8,
    StreamDataX3 = 9,
    Nop = 10,
    StreamState = 11,
    StreamEc = 12,
}

/// Extra types carried inside a packet's extras list (peer protocol >= 6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum ExtraType {
    StreamFlags = 1,
    StreamCsd = 2,
    LanEndpoint = 3,
    NetworkChanged = 4,
    GroupCallKey = 5,
    RequestGroup = 6,
    Ipv6Endpoint = 7,
}

/// `pflags` bits in the legacy and MTProto-2 simple-block header.
pub mod pflag {
    pub const HAS_CALL_ID: u8 = 1;
    pub const HAS_PROTO: u8 = 2;
    pub const HAS_EXTRA: u8 = 4;
    pub const HAS_RECENT_RECV: u8 = 32;
}

/// One `len ∥ type ∥ data` extra attached to an outgoing packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extra {
    pub kind: u8,
    pub data: Vec<u8>,
}

/// The decoded contents of a packet's simple block, common to both framing
/// formats once the outer encryption is stripped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimpleBlock {
    pub packet_type: u8,
    pub last_remote_seq: u32,
    pub seq: u32,
    pub recent_recv_mask: u32,
    pub extras: Vec<Extra>,
    pub payload: Vec<u8>,
}

/// Encodes a [`SimpleBlock`]'s fixed fields and extras, followed by its
/// TL-length-prefixed inner payload. Does not include the random id/padding
/// that precede it in the wire format; callers add that (it's identical
/// between the legacy and MTProto-2 layouts) before encryption.
pub fn encode_simple_block(block: &SimpleBlock, peer_version: u8) -> Vec<u8> {
    let mut w = Writer::new();
    w.write_u8(block.packet_type);
    w.write_u32(block.last_remote_seq);
    w.write_u32(block.seq);
    w.write_u32(block.recent_recv_mask);

    if peer_version >= 6 {
        let mut flags = 0u8;
        if !block.extras.is_empty() {
            flags |= pflag::HAS_EXTRA;
        }
        w.write_u8(flags);
        if !block.extras.is_empty() {
            w.write_u8(block.extras.len() as u8);
            for extra in &block.extras {
                w.write_tl_length((extra.data.len() + 1) as u32);
                w.write_u8(extra.kind);
                w.write_bytes(&extra.data);
            }
        }
    }

    w.write_tl_bytes(&block.payload);
    w.as_slice().to_vec()
}

/// Inverse of [`encode_simple_block`].
pub fn decode_simple_block(bytes: &[u8], peer_version: u8) -> Result<SimpleBlock> {
    let mut r = Reader::new(bytes);
    let packet_type = r.read_u8()?;
    let last_remote_seq = r.read_u32()?;
    let seq = r.read_u32()?;
    let recent_recv_mask = r.read_u32()?;

    let mut extras = Vec::new();
    if peer_version >= 6 {
        let flags = r.read_u8()?;
        if flags & pflag::HAS_EXTRA != 0 {
            let count = r.read_u8()?;
            for _ in 0..count {
                let len = r.read_tl_length()? as usize;
                if len == 0 {
                    return Err(Error::InvalidInput);
                }
                let raw = r.read_bytes(len)?;
                extras.push(Extra {
                    kind: raw[0],
                    data: raw[1..].to_vec(),
                });
            }
        }
    }

    let payload = r.read_tl_bytes()?.to_vec();

    Ok(SimpleBlock {
        packet_type,
        last_remote_seq,
        seq,
        recent_recv_mask,
        extras,
        payload,
    })
}

/// Pads `data` up to a multiple of 16 bytes by appending cryptographically
/// random bytes, returning the padded buffer. `min_extra` is the minimum
/// number of padding bytes to add before rounding.
fn pad_to_block(crypto: &dyn CryptoProvider, data: &[u8], min_extra: usize) -> Vec<u8> {
    let mut out = data.to_vec();
    let target = {
        let base = out.len() + min_extra;
        (base + 15) / 16 * 16
    };
    let mut pad = vec![0u8; target - out.len()];
    crypto.rand_bytes(&mut pad);
    out.extend_from_slice(&pad);
    out
}

/// The legacy packet envelope: 16 B call-id/peer-tag, 8 B key fingerprint,
/// 16 B `msgHash`, then `AES-IGE` of the length-prefixed simple block.
pub struct LegacyPacket;

impl LegacyPacket {
    /// Encrypts `block` into the full wire envelope. `tag` is the 16-byte
    /// call-id or peer-tag that opens every packet. `is_outgoing` selects
    /// which side of KDF1's `x` offset this call uses: `true` for packets
    /// this peer sends, `false` for packets it receives, so the two ends
    /// of a call derive complementary, not identical, keys.
    pub fn encode(
        crypto: &dyn CryptoProvider,
        key: &[u8; crypto::KEY_LEN],
        tag: &[u8; CALL_ID_LEN],
        block: &SimpleBlock,
        peer_version: u8,
        is_outgoing: bool,
    ) -> Vec<u8> {
        let inner = encode_simple_block(block, peer_version);

        let mut plain = Writer::new();
        plain.write_u32(inner.len() as u32);
        plain.write_bytes(&inner);
        let padded = pad_to_block(crypto, plain.as_slice(), 0);

        let msg_hash = crypto.sha1(&padded);
        let mut msg_key = [0u8; MSG_KEY_LEN];
        msg_key.copy_from_slice(&msg_hash[4..20]);

        let (aes_key, aes_iv) = crypto::kdf1(crypto, &msg_key, key, is_outgoing);
        let ciphertext = crypto.aes_ige_encrypt(&padded, &aes_key, &aes_iv);

        let mut out = Writer::new();
        out.write_bytes(tag);
        out.write_bytes(&crypto::key_fingerprint(crypto, key));
        out.write_bytes(&msg_key);
        out.write_bytes(&ciphertext);
        out.as_slice().to_vec()
    }

    /// Decrypts and validates a legacy packet. Returns the simple block and
    /// the raw random-id/pflags prefix that preceded it (the session layer
    /// ignores these but may log them). `is_outgoing` has the same meaning
    /// as in [`encode`](Self::encode): pass `false` to decode a packet
    /// received from the peer.
    pub fn decode(
        crypto: &dyn CryptoProvider,
        key: &[u8; crypto::KEY_LEN],
        bytes: &[u8],
        peer_version: u8,
        is_outgoing: bool,
    ) -> Result<SimpleBlock> {
        if bytes.len() < CALL_ID_LEN + KEY_FINGERPRINT_LEN + MSG_KEY_LEN {
            return Err(Error::EndOfBuffer);
        }
        let mut r = Reader::new(bytes);
        let _tag = r.read_bytes(CALL_ID_LEN)?;
        let _fingerprint = r.read_bytes(KEY_FINGERPRINT_LEN)?;
        let msg_key: [u8; MSG_KEY_LEN] = r.read_bytes(MSG_KEY_LEN)?.try_into().unwrap();
        let ciphertext = r.read_bytes(r.remaining())?;
        if ciphertext.len() % 16 != 0 || ciphertext.is_empty() {
            return Err(Error::InvalidInput);
        }

        let (aes_key, aes_iv) = crypto::kdf1(crypto, &msg_key, key, is_outgoing);
        let padded = crypto.aes_ige_decrypt(ciphertext, &aes_key, &aes_iv);

        let msg_hash = crypto.sha1(&padded);
        if msg_hash[4..20] != msg_key[..] {
            return Err(Error::IntegrityFailed);
        }

        let mut inner_r = Reader::new(&padded);
        let inner_len = inner_r.read_u32()? as usize;
        let inner = inner_r.read_bytes(inner_len)?;
        decode_simple_block(inner, peer_version)
    }
}

/// The MTProto-2 packet envelope: same outer layout as [`LegacyPacket`] but
/// a SHA-256-derived `msgKey` and an inner length prefix ahead of the
/// simple block, per §4.9.
pub struct Mtproto2Packet;

impl Mtproto2Packet {
    /// `is_outgoing` selects KDF2's `x` offset the same way it does for
    /// [`LegacyPacket::encode`]: `true` for packets this peer sends.
    pub fn encode(
        crypto: &dyn CryptoProvider,
        key: &[u8; crypto::KEY_LEN],
        tag: &[u8; CALL_ID_LEN],
        block: &SimpleBlock,
        peer_version: u8,
        is_outgoing: bool,
    ) -> Vec<u8> {
        let inner = encode_simple_block(block, peer_version);

        let mut plain = Writer::new();
        plain.write_u32(inner.len() as u32);
        plain.write_bytes(&inner);
        // 12-28 random padding bytes, rounded to a block boundary.
        let padded = pad_to_block(crypto, plain.as_slice(), 12);

        let x = if is_outgoing { 0usize } else { 8usize };
        let mut hash_input = Vec::with_capacity(36 + padded.len() - 4);
        hash_input.extend_from_slice(&key[88 + x..120 + x]);
        hash_input.extend_from_slice(&padded[4..]);
        let sha256 = crypto.sha256(&hash_input);
        let mut msg_key = [0u8; MSG_KEY_LEN];
        msg_key.copy_from_slice(&sha256[8..24]);

        let (aes_key, aes_iv) = crypto::kdf2(crypto, &msg_key, key, is_outgoing);
        let ciphertext = crypto.aes_ige_encrypt(&padded, &aes_key, &aes_iv);

        let mut out = Writer::new();
        out.write_bytes(tag);
        out.write_bytes(&crypto::key_fingerprint(crypto, key));
        out.write_bytes(&msg_key);
        out.write_bytes(&ciphertext);
        out.as_slice().to_vec()
    }

    /// `is_outgoing` has the same meaning as in [`encode`](Self::encode):
    /// pass `false` to decode a packet received from the peer.
    pub fn decode(
        crypto: &dyn CryptoProvider,
        key: &[u8; crypto::KEY_LEN],
        bytes: &[u8],
        peer_version: u8,
        is_outgoing: bool,
    ) -> Result<SimpleBlock> {
        if bytes.len() < CALL_ID_LEN + KEY_FINGERPRINT_LEN + MSG_KEY_LEN {
            return Err(Error::EndOfBuffer);
        }
        let mut r = Reader::new(bytes);
        let _tag = r.read_bytes(CALL_ID_LEN)?;
        let _fingerprint = r.read_bytes(KEY_FINGERPRINT_LEN)?;
        let msg_key: [u8; MSG_KEY_LEN] = r.read_bytes(MSG_KEY_LEN)?.try_into().unwrap();
        let ciphertext = r.read_bytes(r.remaining())?;
        if ciphertext.len() % 16 != 0 || ciphertext.is_empty() {
            return Err(Error::InvalidInput);
        }

        let (aes_key, aes_iv) = crypto::kdf2(crypto, &msg_key, key, is_outgoing);
        let padded = crypto.aes_ige_decrypt(ciphertext, &aes_key, &aes_iv);
        if padded.len() < 4 {
            return Err(Error::InvalidInput);
        }

        let x = if is_outgoing { 0usize } else { 8usize };
        let mut hash_input = Vec::with_capacity(36 + padded.len() - 4);
        hash_input.extend_from_slice(&key[88 + x..120 + x]);
        hash_input.extend_from_slice(&padded[4..]);
        let sha256 = crypto.sha256(&hash_input);
        if sha256[8..24] != msg_key[..] {
            return Err(Error::IntegrityFailed);
        }

        let mut inner_r = Reader::new(&padded);
        let inner_len = inner_r.read_u32()? as usize;
        let inner = inner_r.read_bytes(inner_len)?;
        decode_simple_block(inner, peer_version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::DefaultCrypto;

    fn sample_key() -> [u8; crypto::KEY_LEN] {
        let mut key = [0u8; crypto::KEY_LEN];
        for (i, byte) in key.iter_mut().enumerate() {
            *byte = (i % 256) as u8;
        }
        key
    }

    fn sample_block() -> SimpleBlock {
        SimpleBlock {
            packet_type: PacketType::StreamData.into(),
            last_remote_seq: 41,
            seq: 42,
            recent_recv_mask: 0xFFFF_FFFF,
            extras: vec![Extra {
                kind: ExtraType::LanEndpoint.into(),
                data: vec![1, 2, 3, 4],
            }],
            payload: b"opus frame".to_vec(),
        }
    }

    #[test]
    fn simple_block_roundtrips_with_extras() {
        let block = sample_block();
        let encoded = encode_simple_block(&block, 6);
        let decoded = decode_simple_block(&encoded, 6).unwrap();
        assert_eq!(decoded, block);
    }

    #[test]
    fn simple_block_omits_pflags_for_old_peers() {
        let mut block = sample_block();
        block.extras.clear();
        let encoded = encode_simple_block(&block, 5);
        let decoded = decode_simple_block(&encoded, 5).unwrap();
        assert_eq!(decoded, block);
    }

    #[test]
    fn legacy_packet_round_trips() {
        let crypto = DefaultCrypto;
        let key = sample_key();
        let tag = [0x7Au8; CALL_ID_LEN];
        let block = sample_block();

        let encoded = LegacyPacket::encode(&crypto, &key, &tag, &block, 6, true);
        let decoded = LegacyPacket::decode(&crypto, &key, &encoded, 6, true).unwrap();
        assert_eq!(decoded, block);
    }

    /// The receiving peer decodes with the complementary KDF offset
    /// (§4.9 KDF1/KDF2 `x`): one side's `is_outgoing=true` packet is the
    /// other side's `is_outgoing=false` inbound packet, and vice versa.
    #[test]
    fn legacy_packet_round_trips_with_flipped_direction() {
        let crypto = DefaultCrypto;
        let key = sample_key();
        let tag = [0x7Au8; CALL_ID_LEN];
        let block = sample_block();

        let encoded = LegacyPacket::encode(&crypto, &key, &tag, &block, 6, false);
        let decoded = LegacyPacket::decode(&crypto, &key, &encoded, 6, false).unwrap();
        assert_eq!(decoded, block);

        // Decoding the same bytes with the wrong direction must not
        // silently succeed with the wrong plaintext.
        assert!(LegacyPacket::decode(&crypto, &key, &encoded, 6, true).is_err());
    }

    #[test]
    fn legacy_packet_rejects_tampered_ciphertext() {
        let crypto = DefaultCrypto;
        let key = sample_key();
        let tag = [0x7Au8; CALL_ID_LEN];
        let block = sample_block();

        let mut encoded = LegacyPacket::encode(&crypto, &key, &tag, &block, 6, true);
        let last = encoded.len() - 1;
        encoded[last] ^= 0xFF;
        assert!(LegacyPacket::decode(&crypto, &key, &encoded, 6, true).is_err());
    }

    #[test]
    fn mtproto2_packet_round_trips() {
        let crypto = DefaultCrypto;
        let key = sample_key();
        let tag = [0x7Bu8; CALL_ID_LEN];
        let block = sample_block();

        let encoded = Mtproto2Packet::encode(&crypto, &key, &tag, &block, 6, true);
        let decoded = Mtproto2Packet::decode(&crypto, &key, &encoded, 6, true).unwrap();
        assert_eq!(decoded, block);
    }

    #[test]
    fn mtproto2_packet_round_trips_with_flipped_direction() {
        let crypto = DefaultCrypto;
        let key = sample_key();
        let tag = [0x7Bu8; CALL_ID_LEN];
        let block = sample_block();

        let encoded = Mtproto2Packet::encode(&crypto, &key, &tag, &block, 6, false);
        let decoded = Mtproto2Packet::decode(&crypto, &key, &encoded, 6, false).unwrap();
        assert_eq!(decoded, block);
        assert!(Mtproto2Packet::decode(&crypto, &key, &encoded, 6, true).is_err());
    }

    #[test]
    fn mtproto2_and_legacy_keys_are_not_interchangeable() {
        let crypto = DefaultCrypto;
        let key = sample_key();
        let tag = [0x7Cu8; CALL_ID_LEN];
        let block = sample_block();

        let encoded = LegacyPacket::encode(&crypto, &key, &tag, &block, 6, true);
        assert!(Mtproto2Packet::decode(&crypto, &key, &encoded, 6, true).is_err());
    }
}
