//! Bundle Payload Decryption
//!
//! AES-256-GCM with a 12-byte nonce prepended to the ciphertext and the
//! 16-byte authentication tag trailing it. Decryption is authenticated: a tag
//! mismatch raises, never returns garbage plaintext.
//!
//! Ordering invariant: the coordinator decrypts only after patch
//! reconstruction and hash/signature verification, because the server computes
//! hash and signature over the artifact exactly as transmitted.

use crate::error::{OtaError, Result};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};

const NONCE_LEN: usize = 12;

pub struct CryptoStore {
    key: [u8; 32],
}

impl CryptoStore {
    /// Build from a 64-char hex key.
    pub fn from_hex_key(key_hex: &str) -> Result<Self> {
        let bytes = hex::decode(key_hex)
            .map_err(|e| OtaError::InvalidKey(format!("encryption key not hex: {}", e)))?;
        let key: [u8; 32] = bytes
            .try_into()
            .map_err(|_| OtaError::InvalidKey("AES-256 key must be 32 bytes".into()))?;
        Ok(Self { key })
    }

    /// Authenticated decryption of a nonce-prefixed payload.
    pub fn decrypt(&self, payload: &[u8]) -> Result<Vec<u8>> {
        if payload.len() < NONCE_LEN {
            return Err(OtaError::Decryption(format!(
                "payload too small for nonce ({} bytes)",
                payload.len()
            )));
        }

        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|e| OtaError::InvalidKey(e.to_string()))?;

        let (nonce_bytes, ciphertext) = payload.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);

        cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| OtaError::Decryption("authentication tag mismatch".into()))
    }
}
