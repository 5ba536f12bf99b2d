//! Artifact Signature Verification
//!
//! Ed25519 detached signatures over the exact bytes that were hash-verified
//! (post-patch, pre-decryption). The backend ships signatures base64-encoded
//! and public keys as 32-byte hex.

use crate::error::{OtaError, Result};
use base64::Engine as _;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use tracing::debug;

pub struct SignatureVerifier {
    public_key: Option<VerifyingKey>,
}

impl SignatureVerifier {
    /// Build from the configured hex public key. `None` disables signature
    /// checking entirely (explicit opt-out).
    pub fn from_config(public_key_hex: Option<&str>) -> Result<Self> {
        let public_key = match public_key_hex {
            Some(hex_key) => {
                let bytes = hex::decode(hex_key)
                    .map_err(|e| OtaError::InvalidKey(format!("signing key not hex: {}", e)))?;
                let key_array: [u8; 32] = bytes
                    .try_into()
                    .map_err(|_| OtaError::InvalidKey("signing key must be 32 bytes".into()))?;
                let key = VerifyingKey::from_bytes(&key_array)
                    .map_err(|e| OtaError::InvalidKey(format!("invalid Ed25519 key: {}", e)))?;
                Some(key)
            }
            None => None,
        };
        Ok(Self { public_key })
    }

    pub fn is_enabled(&self) -> bool {
        self.public_key.is_some()
    }

    /// Verify a detached base64 signature over `data`.
    ///
    /// With a configured key, a missing or malformed signature is a hard
    /// failure, never "unsigned, allow". Without a key the check is skipped.
    pub fn verify(&self, data: &[u8], signature_b64: Option<&str>) -> Result<()> {
        let Some(public_key) = &self.public_key else {
            debug!("no signing key configured, skipping signature verification");
            return Ok(());
        };

        let signature_b64 = signature_b64
            .filter(|s| !s.is_empty())
            .ok_or_else(|| OtaError::SignatureInvalid("signature missing from offer".into()))?;

        let sig_bytes = base64::engine::general_purpose::STANDARD
            .decode(signature_b64)
            .map_err(|e| OtaError::SignatureInvalid(format!("signature not base64: {}", e)))?;

        let sig_array: [u8; 64] = sig_bytes
            .try_into()
            .map_err(|_| OtaError::SignatureInvalid("signature must be 64 bytes".into()))?;
        let signature = Signature::from_bytes(&sig_array);

        public_key
            .verify(data, &signature)
            .map_err(|_| OtaError::SignatureInvalid("signature does not match artifact".into()))
    }
}
