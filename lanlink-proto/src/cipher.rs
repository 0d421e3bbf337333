//! Optional symmetric payload encryption.
//!
//! The cipher covers the payload only; the 4-byte wire header stays in
//! the clear so peers can frame before deciding to decrypt. Each sealed
//! payload is `nonce(12) || ciphertext || tag(16)`, ChaCha20-Poly1305
//! with a key derived from the shared secret by SHA-256.

use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use sha2::{Digest, Sha256};

use crate::error::ProtoError;

/// Bytes a sealed payload grows by: prefixed nonce plus the tag.
pub const OVERHEAD: usize = 12 + 16;

/// Payload cipher shared by both directions of a connection.
pub struct PayloadCipher {
    cipher: ChaCha20Poly1305,
}

impl PayloadCipher {
    /// Derive a cipher from a shared secret.
    pub fn new(secret: &str) -> Self {
        let digest = Sha256::digest(secret.as_bytes());
        let key = Key::from_slice(digest.as_slice());
        Self {
            cipher: ChaCha20Poly1305::new(key),
        }
    }

    /// Encrypt a payload, prefixing the fresh nonce.
    pub fn seal(&self, plain: &[u8]) -> Result<Vec<u8>, ProtoError> {
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let sealed = self
            .cipher
            .encrypt(&nonce, plain)
            .map_err(|_| ProtoError::Cipher)?;
        let mut out = Vec::with_capacity(OVERHEAD + plain.len());
        out.extend_from_slice(nonce.as_slice());
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    /// Decrypt a sealed payload.
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, ProtoError> {
        if sealed.len() < OVERHEAD {
            return Err(ProtoError::Cipher);
        }
        let (nonce, body) = sealed.split_at(12);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), body)
            .map_err(|_| ProtoError::Cipher)
    }
}

impl std::fmt::Debug for PayloadCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PayloadCipher")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open_roundtrip() {
        let cipher = PayloadCipher::new("swordfish");
        let plain = b"raw ethernet frame bytes".to_vec();
        let sealed = cipher.seal(&plain).unwrap();
        assert_eq!(sealed.len(), plain.len() + OVERHEAD);
        assert_ne!(&sealed[12..12 + plain.len()], &plain[..]);
        assert_eq!(cipher.open(&sealed).unwrap(), plain);
    }

    #[test]
    fn test_open_rejects_tamper() {
        let cipher = PayloadCipher::new("swordfish");
        let mut sealed = cipher.seal(b"frame").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(matches!(cipher.open(&sealed), Err(ProtoError::Cipher)));
    }

    #[test]
    fn test_open_rejects_wrong_secret() {
        let sealed = PayloadCipher::new("one").seal(b"frame").unwrap();
        assert!(matches!(
            PayloadCipher::new("two").open(&sealed),
            Err(ProtoError::Cipher)
        ));
    }

    #[test]
    fn test_open_rejects_truncated() {
        let cipher = PayloadCipher::new("swordfish");
        assert!(matches!(cipher.open(&[0u8; 11]), Err(ProtoError::Cipher)));
    }
}
