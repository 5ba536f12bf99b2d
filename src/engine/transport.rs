//! Pinned HTTP Transport
//!
//! Every HTTP call in the update pipeline (check, download, report) goes
//! through this client rather than a shared default one. When a certificate
//! pin is configured, the TLS handshake validates the chain against WebPKI as
//! usual and then additionally requires the leaf certificate's
//! SubjectPublicKeyInfo to hash to the pinned value for the pinned domain.

use crate::config::CertificatePin;
use crate::error::{OtaError, Result};
use futures_util::StreamExt;
use reqwest::header::CONTENT_LENGTH;
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[derive(Debug)]
pub struct DownloadResult {
    pub path: PathBuf,
    pub bytes_downloaded: u64,
}

pub struct PinnedTransport {
    client: reqwest::Client,
}

impl PinnedTransport {
    pub fn new(pin: Option<&CertificatePin>) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .user_agent(concat!("HotPatch-Client/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(10))
            .read_timeout(Duration::from_secs(30));

        if let Some(pin) = pin {
            let tls = pinned_tls_config(pin)?;
            builder = builder.use_preconfigured_tls(tls);
        }

        let client = builder
            .build()
            .map_err(|e| OtaError::Pinning(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// Stream a download into `dest`, reporting `(downloaded, total)` progress.
    /// `dest` is written through a `.partial` sibling and renamed on success,
    /// so an interrupted download never leaves a plausible-looking artifact.
    pub async fn download<F>(&self, url: &str, dest: &Path, mut on_progress: F) -> Result<DownloadResult>
    where
        F: FnMut(u64, u64),
    {
        let partial_path = dest.with_extension("partial");
        if let Some(parent) = partial_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = File::create(&partial_path)?;

        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(OtaError::State(format!(
                "download returned HTTP {}",
                response.status()
            )));
        }

        let total_size = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(0);

        let mut downloaded: u64 = 0;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk)?;
            downloaded += chunk.len() as u64;
            on_progress(downloaded, total_size);
        }

        file.flush()?;
        drop(file);
        fs::rename(&partial_path, dest)?;
        debug!(url, bytes = downloaded, "download complete");

        Ok(DownloadResult {
            path: dest.to_path_buf(),
            bytes_downloaded: downloaded,
        })
    }
}

fn pinned_tls_config(pin: &CertificatePin) -> Result<rustls::ClientConfig> {
    let expected = hex::decode(&pin.spki_sha256)
        .map_err(|e| OtaError::Pinning(format!("pin is not hex: {}", e)))?;
    if expected.len() != 32 {
        return Err(OtaError::Pinning("pin must be a SHA-256 digest (32 bytes)".into()));
    }

    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let webpki = rustls::client::WebPkiServerVerifier::builder(Arc::new(roots))
        .build()
        .map_err(|e| OtaError::Pinning(format!("verifier build failed: {}", e)))?;

    let verifier = PinnedCertVerifier {
        inner: webpki,
        domain: pin.domain.to_ascii_lowercase(),
        expected_spki_sha256: expected,
    };

    let config = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_no_client_auth();
    Ok(config)
}

/// WebPKI validation first, then SPKI pin enforcement for the pinned domain.
#[derive(Debug)]
struct PinnedCertVerifier {
    inner: Arc<rustls::client::WebPkiServerVerifier>,
    domain: String,
    expected_spki_sha256: Vec<u8>,
}

impl rustls::client::danger::ServerCertVerifier for PinnedCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &rustls::pki_types::CertificateDer<'_>,
        intermediates: &[rustls::pki_types::CertificateDer<'_>],
        server_name: &rustls::pki_types::ServerName<'_>,
        ocsp_response: &[u8],
        now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        let verified = self.inner.verify_server_cert(
            end_entity,
            intermediates,
            server_name,
            ocsp_response,
            now,
        )?;

        let is_pinned_domain = match server_name {
            rustls::pki_types::ServerName::DnsName(dns) => {
                dns.as_ref().eq_ignore_ascii_case(&self.domain)
            }
            _ => false,
        };
        if is_pinned_domain {
            let spki = spki_from_cert_der(end_entity.as_ref())
                .map_err(|e| rustls::Error::General(e.to_string()))?;
            let digest = Sha256::digest(spki);
            if digest.as_slice() != self.expected_spki_sha256.as_slice() {
                return Err(rustls::Error::General(
                    "certificate pin mismatch for pinned domain".into(),
                ));
            }
        }

        Ok(verified)
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

/// Extract the SubjectPublicKeyInfo TLV from an X.509 certificate in DER.
///
/// TBSCertificate fields before the SPKI: optional `[0]` version, serial
/// number, signature algorithm, issuer, validity, subject.
fn spki_from_cert_der(cert: &[u8]) -> Result<&[u8]> {
    let (_, tbs_and_rest) = der_enter(cert, 0x30)?;
    let (_, mut fields) = der_enter(tbs_and_rest, 0x30)?;

    // Optional explicit version tag.
    if fields.first() == Some(&0xA0) {
        fields = der_skip(fields)?;
    }
    // serialNumber, signature, issuer, validity, subject.
    for _ in 0..5 {
        fields = der_skip(fields)?;
    }

    let (tlv, _) = der_tlv(fields, 0x30)?;
    Ok(tlv)
}

/// Parse one TLV with the expected tag, returning `(whole_tlv, rest)`.
fn der_tlv(data: &[u8], expected_tag: u8) -> Result<(&[u8], &[u8])> {
    let (header_len, value_len) = der_header(data)?;
    if data[0] != expected_tag {
        return Err(OtaError::Pinning(format!(
            "unexpected DER tag {:#04x}, wanted {:#04x}",
            data[0], expected_tag
        )));
    }
    let total = header_len + value_len;
    if total > data.len() {
        return Err(OtaError::Pinning("DER value truncated".into()));
    }
    Ok((&data[..total], &data[total..]))
}

/// Parse one TLV header and return the slice of its value.
fn der_enter(data: &[u8], expected_tag: u8) -> Result<(&[u8], &[u8])> {
    let (tlv, rest) = der_tlv(data, expected_tag)?;
    let (header_len, _) = der_header(tlv)?;
    Ok((rest, &tlv[header_len..]))
}

/// Skip one TLV of any tag.
fn der_skip(data: &[u8]) -> Result<&[u8]> {
    let (header_len, value_len) = der_header(data)?;
    let total = header_len + value_len;
    if total > data.len() {
        return Err(OtaError::Pinning("DER value truncated".into()));
    }
    Ok(&data[total..])
}

/// Decode a DER tag + length, returning `(header_len, value_len)`.
fn der_header(data: &[u8]) -> Result<(usize, usize)> {
    if data.len() < 2 {
        return Err(OtaError::Pinning("DER header truncated".into()));
    }
    let first_len = data[1] as usize;
    if first_len < 0x80 {
        return Ok((2, first_len));
    }
    let num_bytes = first_len & 0x7F;
    if num_bytes == 0 || num_bytes > 4 || data.len() < 2 + num_bytes {
        return Err(OtaError::Pinning("unsupported DER length encoding".into()));
    }
    let mut value_len: usize = 0;
    for &b in &data[2..2 + num_bytes] {
        value_len = (value_len << 8) | b as usize;
    }
    Ok((2 + num_bytes, value_len))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spki_extraction_matches_rcgen() {
        let certified = rcgen::generate_simple_self_signed(vec!["ota.example.com".into()]).unwrap();
        let cert_der = certified.cert.der();
        let expected_spki = certified.key_pair.public_key_der();

        let spki = spki_from_cert_der(cert_der.as_ref()).unwrap();
        assert_eq!(spki, expected_spki.as_slice());
    }

    #[test]
    fn test_pinned_config_accepts_valid_pin() {
        let certified = rcgen::generate_simple_self_signed(vec!["ota.example.com".into()]).unwrap();
        let pin = CertificatePin {
            domain: "ota.example.com".into(),
            spki_sha256: hex::encode(Sha256::digest(certified.key_pair.public_key_der())),
        };
        assert!(pinned_tls_config(&pin).is_ok());
    }

    #[test]
    fn test_bad_pin_value_rejected() {
        let pin = CertificatePin {
            domain: "ota.example.com".into(),
            spki_sha256: "not-hex".into(),
        };
        assert!(matches!(pinned_tls_config(&pin), Err(OtaError::Pinning(_))));

        let short_pin = CertificatePin {
            domain: "ota.example.com".into(),
            spki_sha256: "abcd".into(),
        };
        assert!(pinned_tls_config(&short_pin).is_err());
    }

    #[test]
    fn test_garbage_cert_der_rejected() {
        assert!(spki_from_cert_der(&[0x02, 0x01, 0x01]).is_err());
        assert!(spki_from_cert_der(&[]).is_err());
    }

    #[test]
    fn test_transport_without_pin_builds() {
        assert!(PinnedTransport::new(None).is_ok());
    }
}
