//! Engine Configuration
//!
//! Constructed once by the host application at process start and passed by
//! reference into every operation. There is no ambient global state.

use serde::{Deserialize, Serialize};

/// Certificate pin for a single domain.
///
/// `spki_sha256` is the lowercase hex SHA-256 digest of the server leaf
/// certificate's SubjectPublicKeyInfo (DER).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertificatePin {
    pub domain: String,
    pub spki_sha256: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OtaConfig {
    /// Base URL of the release-management API, without trailing slash.
    pub api_url: String,
    /// Application identifier, also sent as the `X-App-Key` header.
    pub app_id: String,
    #[serde(default = "default_channel")]
    pub channel: String,
    /// Platform tag sent with update checks (`android`, `ios`).
    #[serde(default = "default_platform")]
    pub platform: String,
    /// AES-256 key as 64 hex chars. Absent means bundles are never encrypted.
    #[serde(default)]
    pub encryption_key: Option<String>,
    /// Ed25519 public key as 64 hex chars. Absent means signature checking is
    /// deliberately disabled; this is an explicit opt-out, not a fallback.
    #[serde(default)]
    pub signing_public_key: Option<String>,
    /// Optional certificate pin applied to all pipeline HTTP traffic.
    #[serde(default)]
    pub certificate_pin: Option<CertificatePin>,
    /// Consecutive unconfirmed boots tolerated before rollback.
    #[serde(default = "default_boot_threshold")]
    pub boot_threshold: u32,
    /// Retained crash records before the oldest is evicted.
    #[serde(default = "default_max_crash_records")]
    pub max_crash_records: usize,
    /// Delivery attempts before a queued report is dropped (with a log line).
    #[serde(default = "default_max_report_attempts")]
    pub max_report_attempts: u32,
}

fn default_channel() -> String {
    "production".to_string()
}

fn default_platform() -> String {
    std::env::consts::OS.to_string()
}

fn default_boot_threshold() -> u32 {
    2
}

fn default_max_crash_records() -> usize {
    20
}

fn default_max_report_attempts() -> u32 {
    5
}

impl OtaConfig {
    pub fn new(api_url: impl Into<String>, app_id: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into(),
            app_id: app_id.into(),
            channel: default_channel(),
            platform: default_platform(),
            encryption_key: None,
            signing_public_key: None,
            certificate_pin: None,
            boot_threshold: default_boot_threshold(),
            max_crash_records: default_max_crash_records(),
            max_report_attempts: default_max_report_attempts(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_minimal_json() {
        let config: OtaConfig = serde_json::from_str(
            r#"{"api_url": "https://ota.example.com/api", "app_id": "app-1"}"#,
        )
        .unwrap();
        assert_eq!(config.channel, "production");
        assert_eq!(config.boot_threshold, 2);
        assert_eq!(config.max_crash_records, 20);
        assert!(config.signing_public_key.is_none());
    }

    #[test]
    fn test_pin_roundtrip() {
        let mut config = OtaConfig::new("https://ota.example.com/api", "app-1");
        config.certificate_pin = Some(CertificatePin {
            domain: "ota.example.com".to_string(),
            spki_sha256: "ab".repeat(32),
        });
        let json = serde_json::to_string(&config).unwrap();
        let parsed: OtaConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.certificate_pin.unwrap().domain, "ota.example.com");
    }
}
