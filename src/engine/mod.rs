// HotPatch engine - core module structure
pub mod boot_guard;
pub mod coordinator;
pub mod crypto;
pub mod hash;
pub mod patch;
pub mod reporter;
pub mod signature;
pub mod slots;
pub mod transport;

pub use boot_guard::{BootGuard, BootStage, BootState, CrashRecord};
pub use coordinator::{ApplyOutcome, UpdateCoordinator, UpdateOffer};
pub use reporter::{InstallReporter, InstallStatus};
pub use slots::{InstalledMetadata, SlotLayout};
pub use transport::PinnedTransport;

use crate::config::OtaConfig;
use crate::error::Result;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Process-wide OTA context. Constructed once at app start from the host's
/// app-private storage directory and passed by reference into every
/// operation; there is no ambient global state.
pub struct OtaEngine {
    slots: Arc<SlotLayout>,
    boot_guard: BootGuard,
    coordinator: UpdateCoordinator,
}

impl OtaEngine {
    pub fn new(config: OtaConfig, base_dir: &Path) -> Result<Self> {
        let slots = Arc::new(SlotLayout::new(base_dir));
        slots.init()?;
        // Scratch left by an interrupted transaction is never resumed.
        slots.clear_pending()?;

        let transport = Arc::new(PinnedTransport::new(config.certificate_pin.as_ref())?);
        let reporter = Arc::new(InstallReporter::new(
            Arc::clone(&transport),
            Arc::clone(&slots),
            config.api_url.clone(),
            config.app_id.clone(),
            config.max_report_attempts,
        ));
        let boot_guard = BootGuard::new(
            Arc::clone(&slots),
            config.boot_threshold,
            config.max_crash_records,
        );
        let coordinator =
            UpdateCoordinator::new(config, Arc::clone(&slots), transport, reporter)?;

        Ok(Self {
            slots,
            boot_guard,
            coordinator,
        })
    }

    /// Boot counter increment + boot-loop check. Call before the OTA bundle
    /// is allowed to load and before any update network activity.
    pub fn on_boot_start(&self) -> BootStage {
        self.boot_guard.on_boot_start()
    }

    pub fn mark_boot_successful(&self) {
        self.boot_guard.mark_boot_successful()
    }

    pub fn install_crash_hook(&self) {
        self.boot_guard.install_crash_hook()
    }

    pub fn boot_guard(&self) -> &BootGuard {
        &self.boot_guard
    }

    pub async fn check_for_update(
        &self,
        current_version: &str,
        device_id: &str,
    ) -> Option<UpdateOffer> {
        self.coordinator
            .check_for_update(current_version, device_id)
            .await
    }

    pub async fn apply_update(&self, offer: &UpdateOffer) -> Result<ApplyOutcome> {
        self.coordinator.apply_update(offer).await
    }

    pub async fn apply_update_with_progress<F>(
        &self,
        offer: &UpdateOffer,
        on_progress: F,
    ) -> Result<ApplyOutcome>
    where
        F: FnMut(u64, u64),
    {
        self.coordinator
            .apply_update_with_progress(offer, on_progress)
            .await
    }

    /// Directory of the active OTA bundle, gated on well-formed installed
    /// metadata; `None` means the host should load its built-in bundle.
    pub fn active_bundle_path(&self) -> Option<PathBuf> {
        self.slots.active_bundle_path()
    }

    pub fn installed_metadata(&self) -> Option<InstalledMetadata> {
        self.slots.load_metadata()
    }
}
