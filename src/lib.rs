//! HotPatch Client
//!
//! A rollback-safe, cryptographically verified OTA update engine for mobile
//! hosts. The engine is implemented once and exposed over a narrow C ABI so
//! each platform's native layer binds the same pipeline:
//!
//! - `engine::hash` / `engine::signature` - artifact integrity + authenticity
//! - `engine::patch` - BSDIFF40 differential reconstruction
//! - `engine::crypto` - AES-256-GCM bundle decryption
//! - `engine::transport` - HTTP client with certificate pinning
//! - `engine::slots` - atomic bundle slot layout and swap
//! - `engine::boot_guard` - boot-loop detection and automatic rollback
//! - `engine::reporter` - delivery reporting with offline retry queue
//! - `engine::coordinator` - the check/download/verify/apply transaction
//! - `ffi` - the C ABI boundary

pub mod config;
pub mod engine;
pub mod error;
pub mod ffi;

pub use config::{CertificatePin, OtaConfig};
pub use engine::{
    ApplyOutcome, BootGuard, BootStage, BootState, CrashRecord, InstallReporter, InstallStatus,
    InstalledMetadata, OtaEngine, PinnedTransport, SlotLayout, UpdateCoordinator, UpdateOffer,
};
pub use error::{OtaError, Result};
