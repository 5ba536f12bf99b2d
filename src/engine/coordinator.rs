//! Update Orchestration
//!
//! Drives the full transaction: check, download, optional patch
//! reconstruction, hash and signature verification, optional decryption,
//! extraction into scratch space and finally the atomic slot swap. Apply
//! transactions are strictly serialized; any failure before the swap leaves
//! `active`, `previous` and the installed metadata untouched.

use crate::config::OtaConfig;
use crate::engine::crypto::CryptoStore;
use crate::engine::reporter::{InstallReporter, InstallStatus};
use crate::engine::signature::SignatureVerifier;
use crate::engine::slots::{InstalledMetadata, SlotLayout};
use crate::engine::transport::PinnedTransport;
use crate::engine::{hash, patch};
use crate::error::{OtaError, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Transient update offer from the backend; consumed once per check cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateOffer {
    pub version: String,
    pub hash: String,
    #[serde(default)]
    pub signature: Option<String>,
    pub bundle_url: String,
    #[serde(default)]
    pub mandatory: bool,
    #[serde(default)]
    pub is_encrypted: bool,
    #[serde(default)]
    pub is_patch: bool,
    #[serde(default)]
    pub base_version: Option<String>,
    #[serde(alias = "id", alias = "release_id")]
    pub release_id: String,
    #[serde(default)]
    pub rollout_percentage: Option<u8>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApplyOutcome {
    pub version: String,
    pub release_id: String,
    /// Mandatory updates ask the host to reload immediately; otherwise the
    /// new bundle takes effect on the next app start.
    pub reload_required: bool,
}

pub struct UpdateCoordinator {
    config: OtaConfig,
    slots: Arc<SlotLayout>,
    transport: Arc<PinnedTransport>,
    reporter: Arc<InstallReporter>,
    signature_verifier: SignatureVerifier,
    crypto: Option<CryptoStore>,
    apply_lock: tokio::sync::Mutex<()>,
}

impl UpdateCoordinator {
    pub fn new(
        config: OtaConfig,
        slots: Arc<SlotLayout>,
        transport: Arc<PinnedTransport>,
        reporter: Arc<InstallReporter>,
    ) -> Result<Self> {
        let signature_verifier =
            SignatureVerifier::from_config(config.signing_public_key.as_deref())?;
        let crypto = match config.encryption_key.as_deref() {
            Some(key_hex) => Some(CryptoStore::from_hex_key(key_hex)?),
            None => None,
        };
        Ok(Self {
            config,
            slots,
            transport,
            reporter,
            signature_verifier,
            crypto,
            apply_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Query the backend for an update. Network or parse failures are logged
    /// and yield `None`; the natural retry is the next app launch.
    pub async fn check_for_update(
        &self,
        current_version: &str,
        device_id: &str,
    ) -> Option<UpdateOffer> {
        if let Err(e) = fs::write(self.slots.device_id_path(), device_id) {
            warn!(error = %e, "failed to persist device id");
        }

        let url = format!("{}/update/check", self.config.api_url);
        let response = self
            .transport
            .client()
            .get(&url)
            .query(&[
                ("appId", self.config.app_id.as_str()),
                ("deviceId", device_id),
                ("version", current_version),
                ("platform", self.config.platform.as_str()),
                ("channel", self.config.channel.as_str()),
            ])
            .header("X-App-Key", &self.config.app_id)
            .send()
            .await;

        let body: serde_json::Value = match response {
            Ok(resp) => match resp.error_for_status() {
                Ok(resp) => match resp.json().await {
                    Ok(body) => body,
                    Err(e) => {
                        warn!(error = %e, "update check returned unparseable body");
                        return None;
                    }
                },
                Err(e) => {
                    warn!(error = %e, "update check rejected");
                    return None;
                }
            },
            Err(e) => {
                warn!(error = %e, "update check failed");
                return None;
            }
        };

        // The check round-trip worked; use the window to retry queued reports.
        self.reporter.flush_pending().await;

        if !body
            .get("updateAvailable")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
        {
            debug!("no update available");
            return None;
        }

        let offer: UpdateOffer = match serde_json::from_value(body) {
            Ok(offer) => offer,
            Err(e) => {
                warn!(error = %e, "malformed update offer");
                return None;
            }
        };

        if !is_newer_version(&offer.version, current_version) {
            debug!(
                offered = %offer.version,
                current = %current_version,
                "offer does not advance the installed version, ignoring"
            );
            return None;
        }

        info!(version = %offer.version, release_id = %offer.release_id, "update offered");
        Some(offer)
    }

    /// Apply an update as a single serialized transaction.
    pub async fn apply_update(&self, offer: &UpdateOffer) -> Result<ApplyOutcome> {
        self.apply_update_with_progress(offer, |_, _| {}).await
    }

    pub async fn apply_update_with_progress<F>(
        &self,
        offer: &UpdateOffer,
        on_progress: F,
    ) -> Result<ApplyOutcome>
    where
        F: FnMut(u64, u64),
    {
        let _guard = self.apply_lock.lock().await;

        // Leftover scratch from an abandoned transaction is untrusted.
        self.slots.clear_pending()?;
        let pending = self.slots.pending_dir();

        // 1. Download the artifact exactly as transmitted.
        let download_path = pending.join("bundle.download");
        let download = self
            .transport
            .download(&offer.bundle_url, &download_path, on_progress)
            .await?;
        let mut artifact = fs::read(&download_path)?;

        // 2. Differential patch: reconstruct against the saved base artifact.
        if offer.is_patch {
            let installed = self.slots.load_metadata();
            if let (Some(base_version), Some(metadata)) = (&offer.base_version, &installed) {
                if base_version != &metadata.version {
                    return Err(OtaError::State(format!(
                        "patch expects base {} but {} is installed",
                        base_version, metadata.version
                    )));
                }
            }
            let base_path = self.slots.base_artifact_path();
            if !base_path.exists() {
                return Err(OtaError::MissingBaseArtifact);
            }
            let base = fs::read(&base_path)?;
            info!(version = %offer.version, "reconstructing bundle from differential patch");
            artifact = patch::apply(&base, &artifact)?;
        }

        // 3. Integrity, then authenticity, over the (possibly reconstructed)
        //    bytes. Decryption only happens after both pass.
        let actual_hash = hash::sha256_hex(&artifact);
        if !actual_hash.eq_ignore_ascii_case(&offer.hash) {
            return Err(OtaError::Integrity {
                expected: offer.hash.clone(),
                actual: actual_hash,
            });
        }
        self.signature_verifier
            .verify(&artifact, offer.signature.as_deref())?;

        // 4. Decryption.
        if offer.is_encrypted {
            let crypto = self
                .crypto
                .as_ref()
                .ok_or_else(|| OtaError::InvalidKey("offer is encrypted but no key configured".into()))?;
            artifact = crypto.decrypt(&artifact)?;
        }

        // 5. Extract into scratch. Nothing so far has touched the real slots.
        let final_artifact = pending.join("bundle.final");
        fs::write(&final_artifact, &artifact)?;
        let stage_dir = pending.join("stage");
        extract_zip(&artifact, &stage_dir)?;

        // 6. Atomic swap plus metadata and future patch base.
        let metadata = InstalledMetadata {
            version: offer.version.clone(),
            content_hash: offer.hash.to_lowercase(),
            release_id: offer.release_id.clone(),
            installed_at: Utc::now(),
        };
        self.slots.promote(&stage_dir, &metadata, &final_artifact)?;
        let _ = self.slots.clear_pending();

        // 7. Fire-and-forget delivery report.
        if let Some(device_id) = self.stored_device_id() {
            self.reporter
                .report(
                    &device_id,
                    &offer.release_id,
                    InstallStatus::Applied,
                    offer.is_patch,
                    download.bytes_downloaded,
                )
                .await;
            self.reporter.flush_pending().await;
        }

        info!(version = %offer.version, mandatory = offer.mandatory, "update applied");
        Ok(ApplyOutcome {
            version: offer.version.clone(),
            release_id: offer.release_id.clone(),
            reload_required: offer.mandatory,
        })
    }

    fn stored_device_id(&self) -> Option<String> {
        fs::read_to_string(self.slots.device_id_path())
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }
}

/// Extract a zip artifact into `target_dir`, rejecting entries that would
/// escape it.
fn extract_zip(artifact: &[u8], target_dir: &Path) -> Result<()> {
    fs::create_dir_all(target_dir)?;
    let mut archive = zip::ZipArchive::new(Cursor::new(artifact))
        .map_err(|e| OtaError::Extraction(format!("unreadable archive: {}", e)))?;

    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|e| OtaError::Extraction(format!("bad archive entry: {}", e)))?;
        let Some(relative) = entry.enclosed_name() else {
            return Err(OtaError::Extraction(format!(
                "archive entry escapes bundle dir: {}",
                entry.name()
            )));
        };
        let out_path = target_dir.join(relative);

        if entry.is_dir() {
            fs::create_dir_all(&out_path)?;
        } else {
            if let Some(parent) = out_path.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut out_file = fs::File::create(&out_path)?;
            std::io::copy(&mut entry, &mut out_file)
                .map_err(|e| OtaError::Extraction(format!("failed to extract {}: {}", entry.name(), e)))?;
        }
    }
    Ok(())
}

/// Dotted-numeric version comparison; `a` strictly newer than `b`.
pub fn is_newer_version(a: &str, b: &str) -> bool {
    let parse = |v: &str| -> Vec<u32> {
        v.trim_start_matches('v')
            .split('.')
            .filter_map(|s| s.parse().ok())
            .collect()
    };
    parse(a) > parse(b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    #[test]
    fn test_version_comparison() {
        assert!(is_newer_version("1.0.1", "1.0.0"));
        assert!(is_newer_version("v1.1.0", "1.0.9"));
        assert!(!is_newer_version("1.0.0", "1.0.0"));
        assert!(!is_newer_version("0.9.9", "1.0.0"));
    }

    #[test]
    fn test_offer_accepts_id_or_release_id() {
        let offer: UpdateOffer = serde_json::from_str(
            r#"{"version": "1.0.1", "hash": "aa", "bundleUrl": "https://x/b.zip", "id": "rel-9"}"#,
        )
        .unwrap();
        assert_eq!(offer.release_id, "rel-9");
        assert!(!offer.mandatory);
        assert!(!offer.is_patch);

        let offer: UpdateOffer = serde_json::from_str(
            r#"{"version": "1.0.1", "hash": "aa", "bundleUrl": "https://x/b.zip", "release_id": "rel-9"}"#,
        )
        .unwrap();
        assert_eq!(offer.release_id, "rel-9");
    }

    fn zip_bytes(name: &str, contents: &[u8]) -> Vec<u8> {
        let mut cursor = Cursor::new(Vec::new());
        let mut writer = zip::ZipWriter::new(&mut cursor);
        writer.start_file(name, SimpleFileOptions::default()).unwrap();
        writer.write_all(contents).unwrap();
        writer.finish().unwrap();
        cursor.into_inner()
    }

    #[test]
    fn test_extract_zip() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = zip_bytes("main.jsbundle", b"console.log('hi')");
        extract_zip(&artifact, dir.path()).unwrap();
        assert_eq!(
            fs::read(dir.path().join("main.jsbundle")).unwrap(),
            b"console.log('hi')"
        );
    }

    #[test]
    fn test_extract_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = zip_bytes("../evil.txt", b"nope");
        assert!(matches!(
            extract_zip(&artifact, dir.path()),
            Err(OtaError::Extraction(_))
        ));
    }

    #[test]
    fn test_extract_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            extract_zip(b"not a zip", dir.path()),
            Err(OtaError::Extraction(_))
        ));
    }
}
