//! Content Hash Verification
//!
//! SHA-256 digests over update artifacts. A mismatch always aborts the
//! pipeline; there is no tolerated-warning mode.

use crate::error::{OtaError, Result};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

/// SHA-256 digest of an in-memory artifact, lowercase hex.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Streaming SHA-256 of a file, lowercase hex.
pub fn sha256_file(path: &Path) -> Result<String> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();

    let mut buffer = [0u8; 8192];
    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Compare an artifact's digest against the expected value, case-insensitive.
pub fn verify(data: &[u8], expected_hex: &str) -> bool {
    sha256_hex(data).eq_ignore_ascii_case(expected_hex)
}

/// Like [`verify`] but returns the typed error the pipeline aborts with.
pub fn verify_file(path: &Path, expected_hex: &str) -> Result<()> {
    let actual = sha256_file(path)?;
    if !actual.eq_ignore_ascii_case(expected_hex) {
        return Err(OtaError::Integrity {
            expected: expected_hex.to_string(),
            actual,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const HELLO_SHA256: &str = "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";

    #[test]
    fn test_sha256_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"hello world").unwrap();
        file.flush().unwrap();

        assert_eq!(sha256_file(file.path()).unwrap(), HELLO_SHA256);
    }

    #[test]
    fn test_verify_case_insensitive() {
        assert!(verify(b"hello world", HELLO_SHA256));
        assert!(verify(b"hello world", &HELLO_SHA256.to_uppercase()));
    }

    #[test]
    fn test_rejects_single_bit_mutation() {
        let mut data = b"hello world".to_vec();
        data[0] ^= 0x01;
        assert!(!verify(&data, HELLO_SHA256));
    }

    #[test]
    fn test_verify_file_mismatch() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"hello world").unwrap();
        file.flush().unwrap();

        let result = verify_file(file.path(), "00".repeat(32).as_str());
        assert!(matches!(result, Err(OtaError::Integrity { .. })));
    }

    #[test]
    fn test_verify_file_unreadable() {
        let result = verify_file(Path::new("/nonexistent/artifact.zip"), HELLO_SHA256);
        assert!(matches!(result, Err(OtaError::Io(_))));
    }
}
