//! Authenticated envelope for persisted state.
//!
//! Uses XChaCha20-Poly1305 with a random 192-bit nonce per seal.
//! Wire format:
//!   [ nonce (24 bytes) | ciphertext + tag (16 bytes) ]
//!
//! The envelope carries no schema; callers agree on the serialized shape.

use std::fmt;
use std::sync::Arc;

use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use rand::RngCore;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::error::EnvelopeError;
use crate::keys::KeyManager;

pub const KEY_LEN: usize = 32;
pub const NONCE_SIZE: usize = 24;
pub const TAG_SIZE: usize = 16;

/// The process symmetric key. Lives only in memory and is wiped on drop.
pub struct EncryptionKey(Zeroizing<[u8; KEY_LEN]>);

impl EncryptionKey {
    pub fn generate() -> Self {
        let mut bytes = Zeroizing::new([0u8; KEY_LEN]);
        OsRng.fill_bytes(&mut bytes[..]);
        Self(bytes)
    }

    /// Accepts the bytes only if they are exactly one key long.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != KEY_LEN {
            return None;
        }
        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        key.copy_from_slice(bytes);
        Some(Self(key))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// Short public identifier for logs and status output.
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(&self.0[..]);
        hex::encode(&digest[..8])
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("EncryptionKey")
            .field(&self.fingerprint())
            .finish()
    }
}

/// Seal `plaintext` under `key` with a fresh random nonce.
pub fn seal(key: &EncryptionKey, plaintext: &[u8]) -> Result<Vec<u8>, EnvelopeError> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
    let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|_| EnvelopeError::Encrypt)?;

    let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Open an envelope produced by [`seal`]. Never returns partial plaintext.
pub fn open(key: &EncryptionKey, envelope: &[u8]) -> Result<Zeroizing<Vec<u8>>, EnvelopeError> {
    if envelope.len() < NONCE_SIZE {
        return Err(EnvelopeError::CorruptEnvelope);
    }
    let (nonce_bytes, ciphertext) = envelope.split_at(NONCE_SIZE);
    let nonce = XNonce::from_slice(nonce_bytes);
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
    let plaintext = cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| EnvelopeError::AuthenticationFailed)?;
    Ok(Zeroizing::new(plaintext))
}

/// Envelope codec bound to whatever key the [`KeyManager`] currently holds.
///
/// The key reference is fetched at the start of every operation, so a
/// rotation in between two calls is picked up by the second one.
#[derive(Clone)]
pub struct EnvelopeCodec {
    keys: Arc<KeyManager>,
}

impl EnvelopeCodec {
    pub fn new(keys: Arc<KeyManager>) -> Self {
        Self { keys }
    }

    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, EnvelopeError> {
        let key = self.keys.current_key().ok_or(EnvelopeError::NoKey)?;
        seal(&key, plaintext)
    }

    pub fn open(&self, envelope: &[u8]) -> Result<Zeroizing<Vec<u8>>, EnvelopeError> {
        let key = self.keys.current_key().ok_or(EnvelopeError::NoKey)?;
        open(&key, envelope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_roundtrip() {
        let key = EncryptionKey::generate();
        for plaintext in [&b""[..], b"hello", &[0xAB; 4096][..]] {
            let sealed = seal(&key, plaintext).unwrap();
            let opened = open(&key, &sealed).unwrap();
            assert_eq!(opened.as_slice(), plaintext);
        }
    }

    #[test]
    fn envelope_overhead_is_constant() {
        let key = EncryptionKey::generate();
        for len in [0usize, 1, 17, 1000] {
            let sealed = seal(&key, &vec![7u8; len]).unwrap();
            assert_eq!(sealed.len(), NONCE_SIZE + len + TAG_SIZE);
        }
    }

    #[test]
    fn every_flipped_bit_is_detected() {
        let key = EncryptionKey::generate();
        let sealed = seal(&key, b"{\"5551234\":\"Alice\"}").unwrap();
        for byte in NONCE_SIZE..sealed.len() {
            for bit in 0..8 {
                let mut tampered = sealed.clone();
                tampered[byte] ^= 1 << bit;
                assert_eq!(
                    open(&key, &tampered).unwrap_err(),
                    EnvelopeError::AuthenticationFailed
                );
            }
        }
    }

    #[test]
    fn wrong_key_fails_authentication() {
        let sealed = seal(&EncryptionKey::generate(), b"secret").unwrap();
        let err = open(&EncryptionKey::generate(), &sealed).unwrap_err();
        assert_eq!(err, EnvelopeError::AuthenticationFailed);
    }

    #[test]
    fn short_envelope_is_corrupt() {
        let key = EncryptionKey::generate();
        assert_eq!(
            open(&key, &[0u8; NONCE_SIZE - 1]).unwrap_err(),
            EnvelopeError::CorruptEnvelope
        );
    }

    #[test]
    fn nonces_are_fresh() {
        let key = EncryptionKey::generate();
        let a = seal(&key, b"same").unwrap();
        let b = seal(&key, b"same").unwrap();
        assert_ne!(a[..NONCE_SIZE], b[..NONCE_SIZE]);
    }

    #[test]
    fn key_length_is_enforced() {
        assert!(EncryptionKey::from_slice(&[1u8; 31]).is_none());
        assert!(EncryptionKey::from_slice(&[1u8; 33]).is_none());
        let key = EncryptionKey::from_slice(&[1u8; 32]).unwrap();
        assert_eq!(key.fingerprint().len(), 16);
    }
}
