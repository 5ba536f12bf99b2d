//! Install and Rollback Reporting
//!
//! Fire-and-forget delivery notifications to the backend. Network failure
//! never blocks or fails the update pipeline; rollback reports that cannot be
//! delivered are queued and retried opportunistically alongside later
//! successful network activity, with a bounded attempt count so nothing is
//! retried forever or dropped silently.

use crate::engine::slots::SlotLayout;
use crate::engine::transport::PinnedTransport;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::sync::Arc;
use tracing::{debug, error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallStatus {
    Applied,
    RolledBack,
}

/// A rollback report awaiting delivery (`ota/pending_reports.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingReport {
    pub release_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub attempts: u32,
}

#[derive(Serialize)]
struct InstallationBody<'a> {
    device_id: &'a str,
    release_id: &'a str,
    status: InstallStatus,
    is_patch: bool,
    download_size: u64,
}

pub struct InstallReporter {
    transport: Arc<PinnedTransport>,
    slots: Arc<SlotLayout>,
    api_url: String,
    app_id: String,
    max_attempts: u32,
}

impl InstallReporter {
    pub fn new(
        transport: Arc<PinnedTransport>,
        slots: Arc<SlotLayout>,
        api_url: String,
        app_id: String,
        max_attempts: u32,
    ) -> Self {
        Self {
            transport,
            slots,
            api_url,
            app_id,
            max_attempts,
        }
    }

    /// POST one installation report. Failures are logged; a failed rollback
    /// report is queued for retry instead of being dropped.
    pub async fn report(
        &self,
        device_id: &str,
        release_id: &str,
        status: InstallStatus,
        is_patch: bool,
        download_size: u64,
    ) {
        match self
            .post(device_id, release_id, status, is_patch, download_size)
            .await
        {
            Ok(()) => debug!(release_id, ?status, "installation report delivered"),
            Err(e) => {
                warn!(release_id, ?status, error = %e, "installation report failed");
                if status == InstallStatus::RolledBack {
                    enqueue_rollback_report(&self.slots, release_id);
                }
            }
        }
    }

    async fn post(
        &self,
        device_id: &str,
        release_id: &str,
        status: InstallStatus,
        is_patch: bool,
        download_size: u64,
    ) -> Result<(), reqwest::Error> {
        let url = format!("{}/installations", self.api_url);
        let body = InstallationBody {
            device_id,
            release_id,
            status,
            is_patch,
            download_size,
        };
        self.transport
            .client()
            .post(&url)
            .header("X-App-Key", &self.app_id)
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    /// Retry queued rollback reports. Called opportunistically after other
    /// network activity succeeded; entries past the attempt bound are dropped
    /// with an error log rather than retried indefinitely.
    pub async fn flush_pending(&self) {
        let queue = load_queue(&self.slots);
        if queue.is_empty() {
            return;
        }
        let Some(device_id) = self.stored_device_id() else {
            debug!("no stored device id, keeping pending reports queued");
            return;
        };

        let mut remaining = Vec::new();
        for mut report in queue {
            match self
                .post(&device_id, &report.release_id, InstallStatus::RolledBack, false, 0)
                .await
            {
                Ok(()) => {
                    debug!(release_id = %report.release_id, "queued rollback report delivered");
                }
                Err(e) => {
                    report.attempts += 1;
                    if report.attempts >= self.max_attempts {
                        error!(
                            release_id = %report.release_id,
                            attempts = report.attempts,
                            error = %e,
                            "dropping rollback report after repeated delivery failures"
                        );
                    } else {
                        remaining.push(report);
                    }
                }
            }
        }
        save_queue(&self.slots, &remaining);
    }

    pub fn pending_count(&self) -> usize {
        load_queue(&self.slots).len()
    }

    fn stored_device_id(&self) -> Option<String> {
        fs::read_to_string(self.slots.device_id_path())
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }
}

/// Append a rollback report to the persistent queue. Runs on the boot path,
/// so persistence failures are swallowed.
pub fn enqueue_rollback_report(slots: &SlotLayout, release_id: &str) {
    let mut queue = load_queue(slots);
    queue.push(PendingReport {
        release_id: release_id.to_string(),
        timestamp: Utc::now(),
        attempts: 0,
    });
    save_queue(slots, &queue);
}

fn load_queue(slots: &SlotLayout) -> Vec<PendingReport> {
    let path = slots.pending_reports_path();
    if !path.exists() {
        return Vec::new();
    }
    fs::read_to_string(&path)
        .ok()
        .and_then(|content| serde_json::from_str(&content).ok())
        .unwrap_or_default()
}

fn save_queue(slots: &SlotLayout, queue: &[PendingReport]) {
    let path = slots.pending_reports_path();
    if queue.is_empty() {
        let _ = fs::remove_file(&path);
        return;
    }
    if let Ok(content) = serde_json::to_string_pretty(queue) {
        let temp = path.with_extension("tmp");
        if fs::write(&temp, content).is_ok() {
            if let Err(e) = fs::rename(&temp, &path) {
                warn!(error = %e, "failed to persist pending reports");
            }
        }
    }
}
