//! OTA Engine Error Types

use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum OtaError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Integrity check failed: expected {expected}, got {actual}")]
    Integrity { expected: String, actual: String },

    #[error("Signature verification failed: {0}")]
    SignatureInvalid(String),

    #[error("Corrupt patch: {0}")]
    PatchCorrupt(String),

    #[error("Decryption failed: {0}")]
    Decryption(String),

    #[error("Extraction failed: {0}")]
    Extraction(String),

    #[error("No saved base artifact for differential patch")]
    MissingBaseArtifact,

    #[error("Invalid key material: {0}")]
    InvalidKey(String),

    #[error("Certificate pinning setup failed: {0}")]
    Pinning(String),

    #[error("State error: {0}")]
    State(String),
}

pub type Result<T> = std::result::Result<T, OtaError>;
