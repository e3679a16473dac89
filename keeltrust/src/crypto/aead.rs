// Direction ciphers: ChaCha20-Poly1305 with counter nonces and a
// deterministic HKDF ratchet.
//
// Each session direction owns one DirectionKey. Nonces are a 96-bit
// big-endian counter, so a key must never outlive u64::MAX seal or open
// operations; the transport rekeys long before that on byte volume.

use chacha20poly1305::aead::Aead;
use chacha20poly1305::{ChaCha20Poly1305, Key, KeyInit, Nonce};
use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::Zeroize;

use crate::error::{KeelTrustError, Result};

/// Poly1305 authentication tag length appended to every sealed buffer.
pub const POLY1305_TAG_LEN: usize = 16;

/// Wire identifier of the only negotiable cipher suite.
pub const CIPHER_SUITE_CHACHA20POLY1305: u8 = 0x01;

const DIRECTION_INFO: &[u8] = b"keel direction key v1";
const REKEY_INFO: &[u8] = b"keel outer rekey v1";

/// Derive a direction key from an ECDH shared secret and the two ephemeral
/// public keys that produced it, ordered initiator first.
pub fn derive_direction_key(
    shared_secret: &[u8; 32],
    initiator_pub: &[u8; 33],
    acceptor_pub: &[u8; 33],
) -> Result<[u8; 32]> {
    let mut salt = [0u8; 66];
    salt[..33].copy_from_slice(initiator_pub);
    salt[33..].copy_from_slice(acceptor_pub);

    let hk = Hkdf::<Sha256>::new(Some(&salt), shared_secret);
    let mut key = [0u8; 32];
    hk.expand(DIRECTION_INFO, &mut key)
        .map_err(|e| KeelTrustError::KeyGeneration(format!("HKDF expand failed: {e}")))?;
    Ok(key)
}

// ── Direction state ──────────────────────────────────────────────────────

/// Symmetric state for one direction of a session: key, cipher instance,
/// nonce counter, and sealed-byte accounting for the rekey policy.
pub struct DirectionKey {
    key: [u8; 32],
    cipher: ChaCha20Poly1305,
    nonce_counter: u64,
    bytes_processed: u64,
}

impl DirectionKey {
    pub fn new(key: [u8; 32]) -> Self {
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
        Self {
            key,
            cipher,
            nonce_counter: 0,
            bytes_processed: 0,
        }
    }

    fn next_nonce(&mut self) -> Result<[u8; 12]> {
        if self.nonce_counter == u64::MAX {
            return Err(KeelTrustError::NonceExhausted);
        }
        let mut nonce = [0u8; 12];
        nonce[4..].copy_from_slice(&self.nonce_counter.to_be_bytes());
        self.nonce_counter += 1;
        Ok(nonce)
    }

    /// Seal a buffer. The ciphertext is `plaintext.len() + POLY1305_TAG_LEN`
    /// bytes.
    pub fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = self.next_nonce()?;
        let out = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|e| KeelTrustError::Encryption(e.to_string()))?;
        self.bytes_processed = self.bytes_processed.saturating_add(plaintext.len() as u64);
        Ok(out)
    }

    /// Open a sealed buffer. Both halves of a direction advance their nonce
    /// counter in lockstep, one step per sealed frame.
    pub fn open(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let nonce = self.next_nonce()?;
        let out = self
            .cipher
            .decrypt(Nonce::from_slice(&nonce), ciphertext)
            .map_err(|e| KeelTrustError::Decryption(e.to_string()))?;
        self.bytes_processed = self.bytes_processed.saturating_add(out.len() as u64);
        Ok(out)
    }

    /// Total plaintext bytes processed under the current key.
    pub fn bytes_processed(&self) -> u64 {
        self.bytes_processed
    }

    /// Replace the key with `HKDF(current key)` and reset the counters.
    /// Deterministic, so both endpoints of a direction stay in sync when
    /// they ratchet at the same point in the frame stream.
    pub fn ratchet(&mut self) -> Result<()> {
        let hk = Hkdf::<Sha256>::new(None, &self.key);
        let mut next = [0u8; 32];
        hk.expand(REKEY_INFO, &mut next)
            .map_err(|e| KeelTrustError::KeyGeneration(format!("HKDF expand failed: {e}")))?;

        self.key.zeroize();
        self.key = next;
        self.cipher = ChaCha20Poly1305::new(Key::from_slice(&self.key));
        self.nonce_counter = 0;
        self.bytes_processed = 0;
        Ok(())
    }
}

impl Drop for DirectionKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}
