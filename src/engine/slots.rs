//! Bundle Slot Layout
//!
//! Manages the on-disk layout for OTA bundles and the atomic slot swap.
//! Three logical slots live under the host-provided app-private directory:
//! `ota/bundle/` (active), `ota/previous/` (last known-good) and
//! `ota/pending/` (scratch). Exactly one slot is active at a time; `previous`
//! may be absent on a fresh install.
//!
//! All fallible work (download, reconstruction, extraction) happens in the
//! pending area; `promote` and `roll_back` are the only routines that touch
//! `active`/`previous`, and they mutate via renames only.

use crate::error::{OtaError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Record describing the bundle currently in the active slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstalledMetadata {
    pub version: String,
    pub content_hash: String,
    pub release_id: String,
    pub installed_at: DateTime<Utc>,
}

pub struct SlotLayout {
    ota_dir: PathBuf,
}

impl SlotLayout {
    /// `base_dir` is the app-private storage root provided by the host.
    pub fn new(base_dir: &Path) -> Self {
        Self {
            ota_dir: base_dir.join("ota"),
        }
    }

    pub fn init(&self) -> Result<()> {
        fs::create_dir_all(&self.ota_dir)?;
        fs::create_dir_all(self.pending_dir())?;
        fs::create_dir_all(self.crash_logs_dir())?;
        Ok(())
    }

    pub fn active_dir(&self) -> PathBuf {
        self.ota_dir.join("bundle")
    }

    pub fn previous_dir(&self) -> PathBuf {
        self.ota_dir.join("previous")
    }

    pub fn pending_dir(&self) -> PathBuf {
        self.ota_dir.join("pending")
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.ota_dir.join("metadata.json")
    }

    pub fn previous_metadata_path(&self) -> PathBuf {
        self.ota_dir.join("previous_metadata.json")
    }

    /// Saved copy of the active artifact, the base for future diffs.
    pub fn base_artifact_path(&self) -> PathBuf {
        self.ota_dir.join("bundle.zip")
    }

    pub fn previous_artifact_path(&self) -> PathBuf {
        self.ota_dir.join("previous.zip")
    }

    pub fn boot_state_path(&self) -> PathBuf {
        self.ota_dir.join("crash_meta.json")
    }

    pub fn crash_logs_dir(&self) -> PathBuf {
        self.ota_dir.join("crash_logs")
    }

    pub fn pending_reports_path(&self) -> PathBuf {
        self.ota_dir.join("pending_reports.json")
    }

    pub fn device_id_path(&self) -> PathBuf {
        self.ota_dir.join("device_id")
    }

    pub fn load_metadata(&self) -> Option<InstalledMetadata> {
        let path = self.metadata_path();
        if !path.exists() {
            return None;
        }
        match fs::read_to_string(&path).map_err(OtaError::from).and_then(|content| {
            serde_json::from_str::<InstalledMetadata>(&content).map_err(OtaError::from)
        }) {
            Ok(metadata) => Some(metadata),
            Err(e) => {
                warn!(error = %e, "installed metadata unreadable, treating as absent");
                None
            }
        }
    }

    fn write_json_atomic<T: Serialize>(&self, path: &Path, value: &T) -> Result<()> {
        let content = serde_json::to_string_pretty(value)?;
        let temp_path = path.with_extension("tmp");
        fs::write(&temp_path, &content)?;
        fs::rename(&temp_path, path)?;
        Ok(())
    }

    pub fn write_metadata(&self, metadata: &InstalledMetadata) -> Result<()> {
        self.write_json_atomic(&self.metadata_path(), metadata)
    }

    /// Path of the active bundle directory, only when an installed, well-formed
    /// metadata record gates it.
    pub fn active_bundle_path(&self) -> Option<PathBuf> {
        let active = self.active_dir();
        if active.is_dir() && self.load_metadata().is_some() {
            Some(active)
        } else {
            None
        }
    }

    /// Discard scratch artifacts from an abandoned transaction. Leftovers are
    /// untrusted and never resumed.
    pub fn clear_pending(&self) -> Result<()> {
        let pending = self.pending_dir();
        if pending.exists() {
            fs::remove_dir_all(&pending)?;
        }
        fs::create_dir_all(&pending)?;
        Ok(())
    }

    /// Swap a fully validated staged bundle into the active slot.
    ///
    /// `staged_dir` holds the extracted bundle, `final_artifact` the verified
    /// artifact bytes on disk (kept as the base of a future diff). Everything
    /// before this call is side-effect free with respect to the real slots.
    pub fn promote(
        &self,
        staged_dir: &Path,
        metadata: &InstalledMetadata,
        final_artifact: &Path,
    ) -> Result<()> {
        let active = self.active_dir();
        let previous = self.previous_dir();

        if previous.exists() {
            fs::remove_dir_all(&previous)?;
        }

        let had_active = active.exists();
        if had_active {
            fs::rename(&active, &previous)?;
            if let Some(old_metadata) = self.load_metadata() {
                self.write_json_atomic(&self.previous_metadata_path(), &old_metadata)?;
            }
            let base = self.base_artifact_path();
            if base.exists() {
                fs::rename(&base, self.previous_artifact_path())?;
            }
        }

        if let Err(e) = fs::rename(staged_dir, &active) {
            // Put the old bundle back so a failed promote leaves the device
            // on the version it was already running.
            if had_active {
                let _ = fs::rename(&previous, &active);
            }
            return Err(e.into());
        }

        self.write_metadata(metadata)?;
        fs::copy(final_artifact, self.base_artifact_path())?;
        info!(version = %metadata.version, release_id = %metadata.release_id, "bundle promoted to active slot");
        Ok(())
    }

    /// Restore the previous slot into active, or clear the active slot
    /// entirely when no previous exists so the app boots on its built-in
    /// bundle. Best-effort: must never panic, and any restore failure
    /// degrades to clearing the active slot.
    ///
    /// Returns the metadata of the release that was rolled back, if known.
    pub fn roll_back(&self) -> Option<InstalledMetadata> {
        let rolled_back = self.load_metadata();
        let active = self.active_dir();
        let previous = self.previous_dir();

        let restored = previous.exists() && self.try_restore_previous(&active, &previous);
        if restored {
            info!("rolled back to previous bundle");
        } else {
            self.clear_active();
            info!("no previous bundle, cleared active slot; built-in bundle will load");
        }
        rolled_back
    }

    fn try_restore_previous(&self, active: &Path, previous: &Path) -> bool {
        if active.exists() {
            if let Err(e) = fs::remove_dir_all(active) {
                warn!(error = %e, "failed to remove bad active slot");
                return false;
            }
        }
        if let Err(e) = fs::rename(previous, active) {
            warn!(error = %e, "failed to restore previous slot");
            return false;
        }

        // Restore the matching metadata and patch base so later differential
        // updates diff against what is actually installed.
        let prev_meta_path = self.previous_metadata_path();
        match fs::read_to_string(&prev_meta_path)
            .ok()
            .and_then(|c| serde_json::from_str::<InstalledMetadata>(&c).ok())
        {
            Some(metadata) => {
                if self.write_metadata(&metadata).is_err() {
                    let _ = fs::remove_file(self.metadata_path());
                }
                let _ = fs::remove_file(&prev_meta_path);
            }
            None => {
                let _ = fs::remove_file(self.metadata_path());
            }
        }
        let prev_artifact = self.previous_artifact_path();
        if prev_artifact.exists() {
            let _ = fs::rename(&prev_artifact, self.base_artifact_path());
        } else {
            let _ = fs::remove_file(self.base_artifact_path());
        }
        true
    }

    fn clear_active(&self) {
        let active = self.active_dir();
        if active.exists() {
            if let Err(e) = fs::remove_dir_all(&active) {
                warn!(error = %e, "failed to clear active slot");
            }
        }
        let _ = fs::remove_file(self.metadata_path());
        let _ = fs::remove_file(self.base_artifact_path());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn metadata(version: &str, release_id: &str) -> InstalledMetadata {
        InstalledMetadata {
            version: version.to_string(),
            content_hash: "00".repeat(32),
            release_id: release_id.to_string(),
            installed_at: Utc::now(),
        }
    }

    fn stage_bundle(slots: &SlotLayout, contents: &str) -> PathBuf {
        let staged = slots.pending_dir().join("stage");
        fs::create_dir_all(&staged).unwrap();
        fs::write(staged.join("main.jsbundle"), contents).unwrap();
        staged
    }

    fn stage_artifact(slots: &SlotLayout, contents: &str) -> PathBuf {
        let artifact = slots.pending_dir().join("bundle.final");
        fs::write(&artifact, contents).unwrap();
        artifact
    }

    #[test]
    fn test_promote_fresh_install() {
        let dir = tempdir().unwrap();
        let slots = SlotLayout::new(dir.path());
        slots.init().unwrap();

        let staged = stage_bundle(&slots, "v1 code");
        let artifact = stage_artifact(&slots, "v1 zip");
        slots.promote(&staged, &metadata("1.0.0", "rel-1"), &artifact).unwrap();

        assert!(slots.active_dir().join("main.jsbundle").exists());
        assert!(!slots.previous_dir().exists());
        assert_eq!(slots.load_metadata().unwrap().version, "1.0.0");
        assert_eq!(fs::read_to_string(slots.base_artifact_path()).unwrap(), "v1 zip");
        assert!(slots.active_bundle_path().is_some());
    }

    #[test]
    fn test_promote_moves_active_to_previous() {
        let dir = tempdir().unwrap();
        let slots = SlotLayout::new(dir.path());
        slots.init().unwrap();

        let staged = stage_bundle(&slots, "v1 code");
        let artifact = stage_artifact(&slots, "v1 zip");
        slots.promote(&staged, &metadata("1.0.0", "rel-1"), &artifact).unwrap();

        let staged = stage_bundle(&slots, "v2 code");
        let artifact = stage_artifact(&slots, "v2 zip");
        slots.promote(&staged, &metadata("1.0.1", "rel-2"), &artifact).unwrap();

        assert_eq!(
            fs::read_to_string(slots.active_dir().join("main.jsbundle")).unwrap(),
            "v2 code"
        );
        assert_eq!(
            fs::read_to_string(slots.previous_dir().join("main.jsbundle")).unwrap(),
            "v1 code"
        );
        assert_eq!(slots.load_metadata().unwrap().version, "1.0.1");
        assert_eq!(fs::read_to_string(slots.base_artifact_path()).unwrap(), "v2 zip");
    }

    #[test]
    fn test_roll_back_restores_previous_bytes() {
        let dir = tempdir().unwrap();
        let slots = SlotLayout::new(dir.path());
        slots.init().unwrap();

        let staged = stage_bundle(&slots, "v1 code");
        let artifact = stage_artifact(&slots, "v1 zip");
        slots.promote(&staged, &metadata("1.0.0", "rel-1"), &artifact).unwrap();
        let staged = stage_bundle(&slots, "v2 code");
        let artifact = stage_artifact(&slots, "v2 zip");
        slots.promote(&staged, &metadata("1.0.1", "rel-2"), &artifact).unwrap();

        let rolled_back = slots.roll_back().unwrap();
        assert_eq!(rolled_back.release_id, "rel-2");

        assert_eq!(
            fs::read_to_string(slots.active_dir().join("main.jsbundle")).unwrap(),
            "v1 code"
        );
        assert!(!slots.previous_dir().exists());
        assert_eq!(slots.load_metadata().unwrap().version, "1.0.0");
        assert_eq!(fs::read_to_string(slots.base_artifact_path()).unwrap(), "v1 zip");
    }

    #[test]
    fn test_roll_back_without_previous_clears_active() {
        let dir = tempdir().unwrap();
        let slots = SlotLayout::new(dir.path());
        slots.init().unwrap();

        let staged = stage_bundle(&slots, "v1 code");
        let artifact = stage_artifact(&slots, "v1 zip");
        slots.promote(&staged, &metadata("1.0.0", "rel-1"), &artifact).unwrap();

        let rolled_back = slots.roll_back().unwrap();
        assert_eq!(rolled_back.release_id, "rel-1");
        assert!(!slots.active_dir().exists());
        assert!(slots.load_metadata().is_none());
        assert!(slots.active_bundle_path().is_none());
    }

    #[test]
    fn test_roll_back_on_empty_layout_is_noop() {
        let dir = tempdir().unwrap();
        let slots = SlotLayout::new(dir.path());
        slots.init().unwrap();
        assert!(slots.roll_back().is_none());
    }

    #[test]
    fn test_clear_pending_discards_scratch() {
        let dir = tempdir().unwrap();
        let slots = SlotLayout::new(dir.path());
        slots.init().unwrap();

        fs::write(slots.pending_dir().join("bundle.tmp"), "partial").unwrap();
        slots.clear_pending().unwrap();
        assert!(slots.pending_dir().exists());
        assert!(!slots.pending_dir().join("bundle.tmp").exists());
    }

    #[test]
    fn test_corrupt_metadata_treated_as_absent() {
        let dir = tempdir().unwrap();
        let slots = SlotLayout::new(dir.path());
        slots.init().unwrap();
        fs::write(slots.metadata_path(), "{not json").unwrap();
        assert!(slots.load_metadata().is_none());
        assert!(slots.active_bundle_path().is_none());
    }
}
