//! AES-256-GCM envelope encryption for vaultsearch
//!
//! All persisted artifacts use the same envelope layout:
//! `nonce (12 bytes) || ciphertext || tag (16 bytes)`.
//! A fresh random nonce is drawn per seal; the GCM tag authenticates the
//! whole ciphertext, so any byte flip fails the open loudly.

use aes_gcm::{
    aead::{Aead, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use rand::RngCore;
use thiserror::Error;

/// AES-256 key length.
pub const KEY_LEN: usize = 32;

/// 96-bit GCM nonce.
pub const NONCE_LEN: usize = 12;

/// GCM authentication tag length.
pub const TAG_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Encryption failed: {0}")]
    Encryption(String),
    #[error("Decryption failed (authentication tag mismatch): {0}")]
    Decryption(String),
    #[error("Envelope too short: {len} bytes (minimum {min})")]
    EnvelopeTooShort { len: usize, min: usize },
}

/// AES-256-GCM seal/open utilities.
pub struct Crypto;

impl Crypto {
    /// Seal plaintext into a `nonce || ciphertext || tag` envelope with a
    /// fresh random nonce.
    pub fn seal(key: &[u8; KEY_LEN], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let cipher =
            Aes256Gcm::new_from_slice(key).map_err(|e| CryptoError::Encryption(e.to_string()))?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| CryptoError::Encryption(e.to_string()))?;

        let mut envelope = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        envelope.extend_from_slice(&nonce_bytes);
        envelope.extend_from_slice(&ciphertext);
        Ok(envelope)
    }

    /// Open a sealed envelope. Fails if the tag does not authenticate,
    /// which covers both a wrong key and a tampered or truncated file.
    pub fn open(key: &[u8; KEY_LEN], envelope: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let min = NONCE_LEN + TAG_LEN;
        if envelope.len() < min {
            return Err(CryptoError::EnvelopeTooShort {
                len: envelope.len(),
                min,
            });
        }

        let cipher =
            Aes256Gcm::new_from_slice(key).map_err(|e| CryptoError::Decryption(e.to_string()))?;

        let nonce = Nonce::from_slice(&envelope[..NONCE_LEN]);

        cipher
            .decrypt(nonce, &envelope[NONCE_LEN..])
            .map_err(|e| CryptoError::Decryption(e.to_string()))
    }
}
