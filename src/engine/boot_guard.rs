//! Boot-Loop Detection and Automatic Rollback
//!
//! A persistent boot counter is incremented at every process start, before
//! any update logic or network I/O runs, and reset to zero only by an
//! explicit success signal from the host once its runtime has initialized.
//! When a start observes the counter already at the threshold, the previous
//! bundle is restored (or the active slot cleared) and the counter reset, so
//! a bad update can never permanently brick the app.
//!
//! There is exactly one boot counter; rollback decisions and crash capture
//! share it as their single source of truth.

use crate::engine::reporter;
use crate::engine::slots::SlotLayout;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::backtrace::Backtrace;
use std::fs;
use std::panic;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Persistent boot-tracking record (`ota/crash_meta.json`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BootState {
    #[serde(default)]
    pub boot_count: u32,
    #[serde(default)]
    pub last_boot_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_successful_boot: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_exit_was_crash: bool,
}

/// Where the boot landed after [`BootGuard::on_boot_start`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootStage {
    /// No OTA bundle installed; the built-in bundle loads.
    Fresh,
    /// Bundle installed and the previous boot was confirmed good.
    Active,
    /// Counter incremented, boot not yet confirmed.
    Suspect,
    /// Counter hit the threshold; the previous bundle was restored.
    RolledBack,
}

/// One captured crash (`ota/crash_logs/*.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrashRecord {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub exception_class: String,
    pub message: String,
    pub stack_trace: String,
    #[serde(default)]
    pub ota_version: Option<String>,
    #[serde(default)]
    pub ota_release_id: Option<String>,
}

pub struct BootGuard {
    slots: Arc<SlotLayout>,
    threshold: u32,
    max_crash_records: usize,
}

impl BootGuard {
    pub fn new(slots: Arc<SlotLayout>, threshold: u32, max_crash_records: usize) -> Self {
        Self {
            slots,
            threshold,
            max_crash_records,
        }
    }

    pub fn load_state(&self) -> BootState {
        let path = self.slots.boot_state_path();
        if !path.exists() {
            return BootState::default();
        }
        fs::read_to_string(&path)
            .ok()
            .and_then(|content| serde_json::from_str(&content).ok())
            .unwrap_or_else(|| {
                warn!("boot state unreadable, starting from zero");
                BootState::default()
            })
    }

    fn save_state(&self, state: &BootState) {
        let path = self.slots.boot_state_path();
        let write = serde_json::to_string_pretty(state)
            .map_err(crate::error::OtaError::from)
            .and_then(|content| {
                let temp = path.with_extension("tmp");
                fs::write(&temp, content)?;
                fs::rename(&temp, &path)?;
                Ok(())
            });
        if let Err(e) = write {
            // Losing a counter write degrades detection, never boot.
            error!(error = %e, "failed to persist boot state");
        }
    }

    /// Process-start hook. Must run before the OTA bundle is allowed to load
    /// and before any network I/O, so a crash anywhere in the update pipeline
    /// is still counted.
    ///
    /// Never returns an error: rollback is best-effort and persistence
    /// failures degrade to logging.
    pub fn on_boot_start(&self) -> BootStage {
        let mut state = self.load_state();

        if state.boot_count >= self.threshold {
            warn!(
                boot_count = state.boot_count,
                threshold = self.threshold,
                "boot loop detected, rolling back"
            );
            if let Some(rolled_back) = self.slots.roll_back() {
                reporter::enqueue_rollback_report(&self.slots, &rolled_back.release_id);
            }
            // Rollback itself must not count as a further failure.
            state.boot_count = 0;
            state.last_exit_was_crash = false;
            state.last_boot_time = Some(Utc::now());
            self.save_state(&state);
            return BootStage::RolledBack;
        }

        state.boot_count += 1;
        state.last_boot_time = Some(Utc::now());
        self.save_state(&state);
        debug!(boot_count = state.boot_count, "boot counter incremented");

        if self.slots.load_metadata().is_some() {
            BootStage::Suspect
        } else {
            BootStage::Fresh
        }
    }

    /// Host signal that the runtime initialized past the point where a bad
    /// bundle would already have crashed. Resets the counter; valid at any
    /// time, including right after a rollback.
    pub fn mark_boot_successful(&self) {
        let mut state = self.load_state();
        state.boot_count = 0;
        state.last_successful_boot = Some(Utc::now());
        state.last_exit_was_crash = false;
        self.save_state(&state);
        info!("boot marked successful, counter reset");
    }

    /// Current stage without mutating anything.
    pub fn stage(&self) -> BootStage {
        if self.slots.load_metadata().is_none() {
            return BootStage::Fresh;
        }
        if self.load_state().boot_count == 0 {
            BootStage::Active
        } else {
            BootStage::Suspect
        }
    }

    pub fn did_last_session_crash(&self) -> bool {
        self.load_state().last_exit_was_crash
    }

    /// Install a panic hook that persists a [`CrashRecord`] and flags the
    /// exit as a crash, then forwards to the previously-installed hook so
    /// host crash reporting keeps working.
    pub fn install_crash_hook(&self) {
        let slots = Arc::clone(&self.slots);
        let max_records = self.max_crash_records;
        let previous_hook = panic::take_hook();

        panic::set_hook(Box::new(move |panic_info| {
            let message = panic_info
                .payload()
                .downcast_ref::<&str>()
                .map(|s| (*s).to_string())
                .or_else(|| panic_info.payload().downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic payload".to_string());
            let stack_trace = Backtrace::force_capture().to_string();

            persist_crash(&slots, max_records, "panic", &message, &stack_trace);
            mark_exit_as_crash(&slots);

            previous_hook(panic_info);
        }));
    }

    /// Record a crash reported by the host's native layer (uncaught exception
    /// or signal handler on the platform side).
    pub fn record_crash(&self, exception_class: &str, message: &str, stack_trace: &str) {
        persist_crash(
            &self.slots,
            self.max_crash_records,
            exception_class,
            message,
            stack_trace,
        );
        mark_exit_as_crash(&self.slots);
    }

    /// Most recent crash records, newest first.
    pub fn recent_crash_records(&self, limit: usize) -> Vec<CrashRecord> {
        let dir = self.slots.crash_logs_dir();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(_) => return Vec::new(),
        };

        let mut records: Vec<CrashRecord> = entries
            .flatten()
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "json"))
            .filter_map(|e| {
                fs::read_to_string(e.path())
                    .ok()
                    .and_then(|content| serde_json::from_str(&content).ok())
            })
            .collect();
        records.sort_by(|a: &CrashRecord, b: &CrashRecord| b.timestamp.cmp(&a.timestamp));
        records.truncate(limit);
        records
    }

    pub fn clear_crash_records(&self) {
        let dir = self.slots.crash_logs_dir();
        if dir.exists() {
            if let Err(e) = fs::remove_dir_all(&dir) {
                warn!(error = %e, "failed to clear crash records");
            }
        }
        let _ = fs::create_dir_all(&dir);
    }
}

fn persist_crash(
    slots: &SlotLayout,
    max_records: usize,
    exception_class: &str,
    message: &str,
    stack_trace: &str,
) {
    let dir = slots.crash_logs_dir();
    if fs::create_dir_all(&dir).is_err() {
        return;
    }

    rotate_crash_logs(slots, max_records);

    let metadata = slots.load_metadata();
    let record = CrashRecord {
        id: Uuid::new_v4(),
        timestamp: Utc::now(),
        exception_class: exception_class.to_string(),
        message: message.to_string(),
        stack_trace: stack_trace.to_string(),
        ota_version: metadata.as_ref().map(|m| m.version.clone()),
        ota_release_id: metadata.map(|m| m.release_id),
    };

    let filename = format!("crash_{}_{}.json", record.timestamp.timestamp_millis(), record.id);
    if let Ok(content) = serde_json::to_string_pretty(&record) {
        let _ = fs::write(dir.join(filename), content);
    }
}

/// Evict oldest records so at most `max_records - 1` remain before a write.
fn rotate_crash_logs(slots: &SlotLayout, max_records: usize) {
    let dir = slots.crash_logs_dir();
    let Ok(entries) = fs::read_dir(&dir) else {
        return;
    };
    let mut files: Vec<_> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
        .collect();
    if files.len() < max_records {
        return;
    }
    files.sort();
    let excess = files.len() + 1 - max_records;
    for path in files.into_iter().take(excess) {
        let _ = fs::remove_file(path);
    }
}

fn mark_exit_as_crash(slots: &SlotLayout) {
    let path = slots.boot_state_path();
    let mut state: BootState = fs::read_to_string(&path)
        .ok()
        .and_then(|content| serde_json::from_str(&content).ok())
        .unwrap_or_default();
    state.last_exit_was_crash = true;
    if let Ok(content) = serde_json::to_string_pretty(&state) {
        let _ = fs::write(&path, content);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::slots::InstalledMetadata;
    use std::path::PathBuf;
    use tempfile::tempdir;

    fn guard(dir: &std::path::Path) -> (BootGuard, Arc<SlotLayout>) {
        let slots = Arc::new(SlotLayout::new(dir));
        slots.init().unwrap();
        (BootGuard::new(Arc::clone(&slots), 2, 20), slots)
    }

    fn install_bundle(slots: &SlotLayout, version: &str, release_id: &str, contents: &str) {
        let staged = slots.pending_dir().join("stage");
        fs::create_dir_all(&staged).unwrap();
        fs::write(staged.join("main.jsbundle"), contents).unwrap();
        let artifact: PathBuf = slots.pending_dir().join("bundle.final");
        fs::write(&artifact, contents).unwrap();
        slots
            .promote(
                &staged,
                &InstalledMetadata {
                    version: version.to_string(),
                    content_hash: "00".repeat(32),
                    release_id: release_id.to_string(),
                    installed_at: Utc::now(),
                },
                &artifact,
            )
            .unwrap();
    }

    #[test]
    fn test_fresh_boot_without_bundle() {
        let dir = tempdir().unwrap();
        let (guard, _) = guard(dir.path());
        assert_eq!(guard.on_boot_start(), BootStage::Fresh);
        assert_eq!(guard.load_state().boot_count, 1);
    }

    #[test]
    fn test_threshold_starts_then_rollback_on_next() {
        let dir = tempdir().unwrap();
        let (guard, slots) = guard(dir.path());
        install_bundle(&slots, "1.0.0", "rel-1", "v1 code");
        install_bundle(&slots, "1.0.1", "rel-2", "v2 code");

        // Two consecutive unconfirmed starts reach the threshold.
        assert_eq!(guard.on_boot_start(), BootStage::Suspect);
        assert_eq!(guard.on_boot_start(), BootStage::Suspect);
        // The third start observes the loop and rolls back.
        assert_eq!(guard.on_boot_start(), BootStage::RolledBack);

        assert_eq!(
            fs::read_to_string(slots.active_dir().join("main.jsbundle")).unwrap(),
            "v1 code"
        );
        assert_eq!(guard.load_state().boot_count, 0);

        // The rollback report was queued with the bad release's id.
        let queued = fs::read_to_string(slots.pending_reports_path()).unwrap();
        assert!(queued.contains("rel-2"));
    }

    #[test]
    fn test_mark_successful_resets_counter() {
        let dir = tempdir().unwrap();
        let (guard, slots) = guard(dir.path());
        install_bundle(&slots, "1.0.0", "rel-1", "v1 code");

        assert_eq!(guard.on_boot_start(), BootStage::Suspect);
        guard.mark_boot_successful();
        assert_eq!(guard.load_state().boot_count, 0);
        assert_eq!(guard.stage(), BootStage::Active);

        // Counter starts over; no rollback on the next two starts.
        assert_eq!(guard.on_boot_start(), BootStage::Suspect);
        assert_eq!(guard.on_boot_start(), BootStage::Suspect);
    }

    #[test]
    fn test_mark_successful_right_after_rollback() {
        let dir = tempdir().unwrap();
        let (guard, slots) = guard(dir.path());
        install_bundle(&slots, "1.0.0", "rel-1", "v1 code");

        guard.on_boot_start();
        guard.on_boot_start();
        assert_eq!(guard.on_boot_start(), BootStage::RolledBack);
        guard.mark_boot_successful();
        assert_eq!(guard.load_state().boot_count, 0);
    }

    #[test]
    fn test_rollback_without_previous_falls_back_to_builtin() {
        let dir = tempdir().unwrap();
        let (guard, slots) = guard(dir.path());
        install_bundle(&slots, "1.0.0", "rel-1", "v1 code");

        guard.on_boot_start();
        guard.on_boot_start();
        assert_eq!(guard.on_boot_start(), BootStage::RolledBack);

        assert!(!slots.active_dir().exists());
        assert!(slots.load_metadata().is_none());
    }

    #[test]
    fn test_crash_records_rotate() {
        let dir = tempdir().unwrap();
        let slots = Arc::new(SlotLayout::new(dir.path()));
        slots.init().unwrap();
        let guard = BootGuard::new(Arc::clone(&slots), 2, 5);

        for i in 0..8 {
            guard.record_crash("TestError", &format!("crash {}", i), "stack");
        }

        let records = guard.recent_crash_records(100);
        assert_eq!(records.len(), 5);
        assert!(guard.did_last_session_crash());

        guard.clear_crash_records();
        assert!(guard.recent_crash_records(100).is_empty());
    }

    #[test]
    fn test_crash_record_carries_ota_metadata() {
        let dir = tempdir().unwrap();
        let (guard, slots) = guard(dir.path());
        install_bundle(&slots, "1.0.0", "rel-1", "v1 code");

        guard.record_crash("TestError", "boom", "stack");
        let records = guard.recent_crash_records(1);
        assert_eq!(records[0].ota_version.as_deref(), Some("1.0.0"));
        assert_eq!(records[0].ota_release_id.as_deref(), Some("rel-1"));
    }

    #[test]
    fn test_corrupt_boot_state_starts_from_zero() {
        let dir = tempdir().unwrap();
        let (guard, slots) = guard(dir.path());
        fs::write(slots.boot_state_path(), "garbage").unwrap();
        assert_eq!(guard.load_state().boot_count, 0);
    }
}
