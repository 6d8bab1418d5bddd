//! Crypto facade.
//!
//! Key material is a caller-supplied 256-byte shared secret; everything
//! else in this module is a deterministic, synchronous, in-memory
//! operation over it. The facade is a trait so a caller can swap in a
//! hardware-backed or audited provider without touching the session or
//! codec layers; [`DefaultCrypto`] is the RustCrypto-backed implementation
//! the rest of this crate and the session crate use by default.

use aes::cipher::{generic_array::GenericArray, BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes256;
use rand::RngCore;
use sha1::{Digest as Sha1Digest, Sha1};
use sha2::{Digest as Sha2Digest, Sha256};

/// The caller-supplied call key: 256 raw bytes, never transmitted.
pub const KEY_LEN: usize = 256;

pub trait CryptoProvider: Send + Sync {
    fn rand_bytes(&self, out: &mut [u8]);
    fn sha1(&self, msg: &[u8]) -> [u8; 20];
    fn sha256(&self, msg: &[u8]) -> [u8; 32];
    fn aes_ige_encrypt(&self, input: &[u8], key: &[u8; 32], iv: &[u8; 32]) -> Vec<u8>;
    fn aes_ige_decrypt(&self, input: &[u8], key: &[u8; 32], iv: &[u8; 32]) -> Vec<u8>;
}

/// The default crypto provider: RustCrypto `aes`/`sha1`/`sha2` plus the
/// `rand` crate's thread-local CSPRNG.
#[derive(Default, Clone, Copy)]
pub struct DefaultCrypto;

impl CryptoProvider for DefaultCrypto {
    fn rand_bytes(&self, out: &mut [u8]) {
        rand::rng().fill_bytes(out);
    }

    fn sha1(&self, msg: &[u8]) -> [u8; 20] {
        let mut hasher = Sha1::new();
        hasher.update(msg);
        hasher.finalize().into()
    }

    fn sha256(&self, msg: &[u8]) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(msg);
        hasher.finalize().into()
    }

    fn aes_ige_encrypt(&self, input: &[u8], key: &[u8; 32], iv: &[u8; 32]) -> Vec<u8> {
        aes_ige(input, key, iv, true)
    }

    fn aes_ige_decrypt(&self, input: &[u8], key: &[u8; 32], iv: &[u8; 32]) -> Vec<u8> {
        aes_ige(input, key, iv, false)
    }
}

fn xor16(a: &[u8], b: &[u8]) -> [u8; 16] {
    let mut out = [0u8; 16];
    for i in 0..16 {
        out[i] = a[i] ^ b[i];
    }
    out
}

/// AES-256 in Infinite Garble Extension mode, as used by both MTProto
/// framing formats (§4.9). `input` must be a multiple of 16 bytes; the
/// caller is responsible for padding (the legacy and MTProto-2 inner
/// layouts both pad to a block boundary before calling this).
fn aes_ige(input: &[u8], key: &[u8; 32], iv: &[u8; 32], encrypt: bool) -> Vec<u8> {
    assert_eq!(input.len() % 16, 0, "AES-IGE input must be block-aligned");

    let mut iv_prev = [0u8; 16];
    let mut iv_cur = [0u8; 16];
    if encrypt {
        // c_0 = iv[0..16], m_0 = iv[16..32]
        iv_cur.copy_from_slice(&iv[0..16]);
        iv_prev.copy_from_slice(&iv[16..32]);
    } else {
        // for decryption the roles are swapped: m_0 = iv[16..32] feeds the
        // ciphertext side, c_0 = iv[0..16] feeds the plaintext side.
        iv_prev.copy_from_slice(&iv[0..16]);
        iv_cur.copy_from_slice(&iv[16..32]);
    }

    let key_arr = GenericArray::from_slice(key);
    let mut out = Vec::with_capacity(input.len());

    if encrypt {
        let cipher = Aes256::new(key_arr);
        for chunk in input.chunks(16) {
            let mut block = GenericArray::clone_from_slice(&xor16(chunk, &iv_prev));
            cipher.encrypt_block(&mut block);
            let c = xor16(&block, &iv_cur);
            iv_prev.copy_from_slice(chunk);
            iv_cur.copy_from_slice(&c);
            out.extend_from_slice(&c);
        }
    } else {
        let cipher = Aes256::new(key_arr);
        for chunk in input.chunks(16) {
            let mut block = GenericArray::clone_from_slice(&xor16(chunk, &iv_cur));
            cipher.decrypt_block(&mut block);
            let m = xor16(&block, &iv_prev);
            iv_cur.copy_from_slice(chunk);
            iv_prev.copy_from_slice(&m);
            out.extend_from_slice(&m);
        }
    }

    out
}

/// Stateful AES-256-CTR stream, matching the `aes_ctr_encrypt(inout, len,
/// key[32], iv[16], ecount[16], num_state*)` contract: encryption and
/// decryption are the same XOR-with-keystream operation, and the state can
/// be fed any number of bytes across multiple calls (used by the
/// TCP-obfuscated transport, which streams arbitrary-sized reads/writes).
pub struct AesCtrState {
    cipher: Aes256,
    counter: [u8; 16],
    ecount: [u8; 16],
    num: usize,
}

impl AesCtrState {
    pub fn new(key: &[u8; 32], iv: &[u8; 16]) -> Self {
        let key_arr = GenericArray::from_slice(key);
        Self {
            cipher: Aes256::new(key_arr),
            counter: *iv,
            ecount: [0u8; 16],
            num: 0,
        }
    }

    fn increment_counter(&mut self) {
        for byte in self.counter.iter_mut().rev() {
            *byte = byte.wrapping_add(1);
            if *byte != 0 {
                break;
            }
        }
    }

    /// Applies the keystream to `data` in place.
    pub fn apply(&mut self, data: &mut [u8]) {
        for byte in data.iter_mut() {
            if self.num == 0 {
                let mut block = GenericArray::clone_from_slice(&self.counter);
                self.cipher.encrypt_block(&mut block);
                self.ecount.copy_from_slice(&block);
                self.increment_counter();
            }
            *byte ^= self.ecount[self.num];
            self.num = (self.num + 1) % 16;
        }
    }
}

/// KDF1: the legacy (MTProto 1.0-derived) key derivation. Four overlapping
/// SHA-1 rounds over windows of the shared secret, keyed by the message
/// hash, producing 32 key bytes followed by 32 IV bytes.
pub fn kdf1(crypto: &dyn CryptoProvider, msg_key: &[u8; 16], key: &[u8; 256], outgoing: bool) -> ([u8; 32], [u8; 32]) {
    let x = if outgoing { 0usize } else { 8usize };

    let mut buf = Vec::with_capacity(48);
    buf.extend_from_slice(msg_key);
    buf.extend_from_slice(&key[x..x + 32]);
    let sha1_a = crypto.sha1(&buf);

    buf.clear();
    buf.extend_from_slice(&key[32 + x..32 + x + 16]);
    buf.extend_from_slice(msg_key);
    buf.extend_from_slice(&key[48 + x..48 + x + 16]);
    let sha1_b = crypto.sha1(&buf);

    buf.clear();
    buf.extend_from_slice(&key[64 + x..64 + x + 32]);
    buf.extend_from_slice(msg_key);
    let sha1_c = crypto.sha1(&buf);

    buf.clear();
    buf.extend_from_slice(msg_key);
    buf.extend_from_slice(&key[96 + x..96 + x + 32]);
    let sha1_d = crypto.sha1(&buf);

    let mut aes_key = [0u8; 32];
    aes_key[0..8].copy_from_slice(&sha1_a[0..8]);
    aes_key[8..20].copy_from_slice(&sha1_b[8..20]);
    aes_key[20..32].copy_from_slice(&sha1_c[4..16]);

    let mut aes_iv = [0u8; 32];
    aes_iv[0..12].copy_from_slice(&sha1_a[8..20]);
    aes_iv[12..20].copy_from_slice(&sha1_b[0..8]);
    aes_iv[20..24].copy_from_slice(&sha1_c[16..20]);
    aes_iv[24..32].copy_from_slice(&sha1_d[0..8]);

    (aes_key, aes_iv)
}

/// KDF2: the MTProto-2 key derivation (§4.9). `x = 0` for packets we send,
/// `x = 8` for packets we receive.
pub fn kdf2(crypto: &dyn CryptoProvider, msg_key: &[u8; 16], key: &[u8; 256], outgoing: bool) -> ([u8; 32], [u8; 32]) {
    let x = if outgoing { 0usize } else { 8usize };

    let mut buf_a = Vec::with_capacity(52);
    buf_a.extend_from_slice(msg_key);
    buf_a.extend_from_slice(&key[x..x + 36]);
    let sha256_a = crypto.sha256(&buf_a);

    let mut buf_b = Vec::with_capacity(52);
    buf_b.extend_from_slice(&key[x + 40..x + 76]);
    buf_b.extend_from_slice(msg_key);
    let sha256_b = crypto.sha256(&buf_b);

    let mut aes_key = [0u8; 32];
    aes_key[0..8].copy_from_slice(&sha256_a[0..8]);
    aes_key[8..24].copy_from_slice(&sha256_b[8..24]);
    aes_key[24..32].copy_from_slice(&sha256_a[24..32]);

    let mut aes_iv = [0u8; 32];
    aes_iv[0..8].copy_from_slice(&sha256_b[0..8]);
    aes_iv[8..24].copy_from_slice(&sha256_a[8..24]);
    aes_iv[24..32].copy_from_slice(&sha256_b[24..32]);

    (aes_key, aes_iv)
}

/// `keyFingerprint = SHA1(key)[12..20]`.
pub fn key_fingerprint(crypto: &dyn CryptoProvider, key: &[u8; 256]) -> [u8; 8] {
    let digest = crypto.sha1(key);
    let mut out = [0u8; 8];
    out.copy_from_slice(&digest[12..20]);
    out
}

/// `callID = SHA256(key)[16..32]`.
pub fn call_id(crypto: &dyn CryptoProvider, key: &[u8; 256]) -> [u8; 16] {
    let digest = crypto.sha256(key);
    let mut out = [0u8; 16];
    out.copy_from_slice(&digest[16..32]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aes_ige_round_trips() {
        let crypto = DefaultCrypto;
        let mut key = [0u8; 32];
        let mut iv = [0u8; 32];
        crypto.rand_bytes(&mut key);
        crypto.rand_bytes(&mut iv);

        let plaintext = b"0123456789abcdef0123456789ABCDEF"[..32].to_vec();
        let ciphertext = crypto.aes_ige_encrypt(&plaintext, &key, &iv);
        assert_eq!(ciphertext.len(), plaintext.len());
        assert_ne!(ciphertext, plaintext);

        let decrypted = crypto.aes_ige_decrypt(&ciphertext, &key, &iv);
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn aes_ctr_is_an_involution() {
        let mut key = [0u8; 32];
        let mut iv = [0u8; 16];
        DefaultCrypto.rand_bytes(&mut key);
        DefaultCrypto.rand_bytes(&mut iv);

        let plaintext = b"the quick brown fox jumps".to_vec();
        let mut buf = plaintext.clone();

        let mut enc = AesCtrState::new(&key, &iv);
        enc.apply(&mut buf);
        assert_ne!(buf, plaintext);

        let mut dec = AesCtrState::new(&key, &iv);
        dec.apply(&mut buf);
        assert_eq!(buf, plaintext);
    }

    #[test]
    fn aes_ctr_works_across_multiple_small_calls() {
        let mut key = [0u8; 32];
        let mut iv = [0u8; 16];
        DefaultCrypto.rand_bytes(&mut key);
        DefaultCrypto.rand_bytes(&mut iv);

        let plaintext = b"a stream cipher must compose across boundaries".to_vec();

        let mut whole = plaintext.clone();
        AesCtrState::new(&key, &iv).apply(&mut whole);

        let mut piecewise = plaintext.clone();
        let mut state = AesCtrState::new(&key, &iv);
        for chunk in piecewise.chunks_mut(7) {
            state.apply(chunk);
        }

        assert_eq!(whole, piecewise);
    }

    #[test]
    fn key_fingerprint_and_call_id_are_distinct_slices() {
        let key = [0xAAu8; 256];
        let fp = key_fingerprint(&DefaultCrypto, &key);
        let cid = call_id(&DefaultCrypto, &key);
        assert_eq!(fp.len(), 8);
        assert_eq!(cid.len(), 16);
    }

    #[test]
    fn kdf1_and_kdf2_differ_for_outgoing_vs_incoming() {
        let key = [0xAAu8; 256];
        let msg_key = [0x11u8; 16];
        let (k_out, iv_out) = kdf1(&DefaultCrypto, &msg_key, &key, true);
        let (k_in, iv_in) = kdf1(&DefaultCrypto, &msg_key, &key, false);
        assert_ne!(k_out, k_in);
        assert_ne!(iv_out, iv_in);

        let (k2_out, _) = kdf2(&DefaultCrypto, &msg_key, &key, true);
        let (k2_in, _) = kdf2(&DefaultCrypto, &msg_key, &key, false);
        assert_ne!(k2_out, k2_in);
    }
}
