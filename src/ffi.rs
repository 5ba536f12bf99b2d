//! C ABI Boundary
//!
//! Narrow surface for the platform bridges: construct one client per process,
//! then drive boot tracking, update checks and applies through it. Strings
//! cross the boundary as NUL-terminated UTF-8; every string returned by this
//! module must be released with [`hotpatch_string_free`]. No panic may cross
//! the boundary.

use crate::config::OtaConfig;
use crate::engine::{BootStage, OtaEngine, UpdateOffer};
use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_int};
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use tracing::error;

/// Opaque handle owning the engine and a runtime for its async operations.
pub struct OtaClient {
    engine: OtaEngine,
    runtime: tokio::runtime::Runtime,
}

pub const HOTPATCH_OK: c_int = 0;
/// Applied, and the offer was mandatory: reload the bundle now.
pub const HOTPATCH_OK_RELOAD: c_int = 1;
pub const HOTPATCH_ERR_INVALID_ARG: c_int = -1;
pub const HOTPATCH_ERR_APPLY_FAILED: c_int = -2;

/// Boot stage codes returned by [`hotpatch_on_boot_start`].
pub const HOTPATCH_BOOT_FRESH: c_int = 0;
pub const HOTPATCH_BOOT_ACTIVE: c_int = 1;
pub const HOTPATCH_BOOT_SUSPECT: c_int = 2;
pub const HOTPATCH_BOOT_ROLLED_BACK: c_int = 3;

unsafe fn cstr_arg<'a>(ptr: *const c_char) -> Option<&'a str> {
    if ptr.is_null() {
        return None;
    }
    CStr::from_ptr(ptr).to_str().ok()
}

fn into_c_string(s: String) -> *mut c_char {
    match CString::new(s) {
        Ok(cstring) => cstring.into_raw(),
        Err(_) => std::ptr::null_mut(),
    }
}

/// Create the process-wide client.
///
/// `config_json` is an [`OtaConfig`] as JSON; `base_dir` the app-private
/// storage directory. Returns null on invalid input. The returned pointer
/// must be released with [`hotpatch_client_free`].
///
/// # Safety
/// Both pointers must be valid NUL-terminated strings or null.
#[no_mangle]
pub unsafe extern "C" fn hotpatch_client_new(
    config_json: *const c_char,
    base_dir: *const c_char,
) -> *mut OtaClient {
    let result = panic::catch_unwind(|| {
        let config_json = cstr_arg(config_json)?;
        let base_dir = PathBuf::from(cstr_arg(base_dir)?);

        let config: OtaConfig = match serde_json::from_str(config_json) {
            Ok(config) => config,
            Err(e) => {
                error!(error = %e, "invalid client config");
                return None;
            }
        };
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .ok()?;
        let engine = match OtaEngine::new(config, &base_dir) {
            Ok(engine) => engine,
            Err(e) => {
                error!(error = %e, "engine construction failed");
                return None;
            }
        };
        Some(Box::new(OtaClient { engine, runtime }))
    });

    match result {
        Ok(Some(client)) => Box::into_raw(client),
        _ => std::ptr::null_mut(),
    }
}

/// # Safety
/// `client` must be a pointer from [`hotpatch_client_new`] (or null), and
/// must not be used afterwards.
#[no_mangle]
pub unsafe extern "C" fn hotpatch_client_free(client: *mut OtaClient) {
    if !client.is_null() {
        drop(Box::from_raw(client));
    }
}

/// Increment the boot counter and run boot-loop detection. Call before
/// loading the OTA bundle; returns one of the `HOTPATCH_BOOT_*` codes.
///
/// # Safety
/// `client` must be a valid client pointer.
#[no_mangle]
pub unsafe extern "C" fn hotpatch_on_boot_start(client: *const OtaClient) -> c_int {
    let Some(client) = client.as_ref() else {
        return HOTPATCH_ERR_INVALID_ARG;
    };
    let result = panic::catch_unwind(AssertUnwindSafe(|| client.engine.on_boot_start()));
    match result {
        Ok(BootStage::Fresh) => HOTPATCH_BOOT_FRESH,
        Ok(BootStage::Active) => HOTPATCH_BOOT_ACTIVE,
        Ok(BootStage::Suspect) => HOTPATCH_BOOT_SUSPECT,
        Ok(BootStage::RolledBack) => HOTPATCH_BOOT_ROLLED_BACK,
        Err(_) => HOTPATCH_ERR_INVALID_ARG,
    }
}

/// Reset the boot counter once the host runtime has initialized.
///
/// # Safety
/// `client` must be a valid client pointer.
#[no_mangle]
pub unsafe extern "C" fn hotpatch_mark_boot_success(client: *const OtaClient) {
    if let Some(client) = client.as_ref() {
        let _ = panic::catch_unwind(AssertUnwindSafe(|| client.engine.mark_boot_successful()));
    }
}

/// Install the crash hook that persists crash records before forwarding to
/// any previously-installed handler.
///
/// # Safety
/// `client` must be a valid client pointer.
#[no_mangle]
pub unsafe extern "C" fn hotpatch_install_crash_hook(client: *const OtaClient) {
    if let Some(client) = client.as_ref() {
        let _ = panic::catch_unwind(AssertUnwindSafe(|| client.engine.install_crash_hook()));
    }
}

/// Persist a crash captured by the platform's native handler.
///
/// # Safety
/// All pointers must be valid NUL-terminated strings or null.
#[no_mangle]
pub unsafe extern "C" fn hotpatch_record_crash(
    client: *const OtaClient,
    exception_class: *const c_char,
    message: *const c_char,
    stack_trace: *const c_char,
) {
    let Some(client) = client.as_ref() else {
        return;
    };
    let exception_class = cstr_arg(exception_class).unwrap_or("unknown");
    let message = cstr_arg(message).unwrap_or("");
    let stack_trace = cstr_arg(stack_trace).unwrap_or("");
    let _ = panic::catch_unwind(AssertUnwindSafe(|| {
        client
            .engine
            .boot_guard()
            .record_crash(exception_class, message, stack_trace);
    }));
}

/// Query the backend for an update. Returns the offer as a JSON string, or
/// null when no update is available (including on network failure).
///
/// # Safety
/// `client`, `current_version` and `device_id` must be valid; the returned
/// string must be freed with [`hotpatch_string_free`].
#[no_mangle]
pub unsafe extern "C" fn hotpatch_check(
    client: *const OtaClient,
    current_version: *const c_char,
    device_id: *const c_char,
) -> *mut c_char {
    let Some(client) = client.as_ref() else {
        return std::ptr::null_mut();
    };
    let (Some(current_version), Some(device_id)) =
        (cstr_arg(current_version), cstr_arg(device_id))
    else {
        return std::ptr::null_mut();
    };

    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        client
            .runtime
            .block_on(client.engine.check_for_update(current_version, device_id))
    }));

    match result {
        Ok(Some(offer)) => match serde_json::to_string(&offer) {
            Ok(json) => into_c_string(json),
            Err(_) => std::ptr::null_mut(),
        },
        _ => std::ptr::null_mut(),
    }
}

/// Download and apply an offer previously returned by [`hotpatch_check`].
/// Returns `HOTPATCH_OK`, `HOTPATCH_OK_RELOAD` for mandatory updates, or a
/// negative error code; on any error the installed bundle is untouched.
///
/// # Safety
/// `client` and `offer_json` must be valid.
#[no_mangle]
pub unsafe extern "C" fn hotpatch_download_and_apply(
    client: *const OtaClient,
    offer_json: *const c_char,
) -> c_int {
    let Some(client) = client.as_ref() else {
        return HOTPATCH_ERR_INVALID_ARG;
    };
    let Some(offer_json) = cstr_arg(offer_json) else {
        return HOTPATCH_ERR_INVALID_ARG;
    };
    let offer: UpdateOffer = match serde_json::from_str(offer_json) {
        Ok(offer) => offer,
        Err(e) => {
            error!(error = %e, "malformed offer passed to download_and_apply");
            return HOTPATCH_ERR_INVALID_ARG;
        }
    };

    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        client.runtime.block_on(client.engine.apply_update(&offer))
    }));

    match result {
        Ok(Ok(outcome)) if outcome.reload_required => HOTPATCH_OK_RELOAD,
        Ok(Ok(_)) => HOTPATCH_OK,
        Ok(Err(e)) => {
            error!(error = %e, "update not applied this cycle");
            HOTPATCH_ERR_APPLY_FAILED
        }
        Err(_) => HOTPATCH_ERR_APPLY_FAILED,
    }
}

/// Path of the active OTA bundle directory, or null when the host should
/// load its built-in bundle.
///
/// # Safety
/// `client` must be valid; the returned string must be freed with
/// [`hotpatch_string_free`].
#[no_mangle]
pub unsafe extern "C" fn hotpatch_get_active_bundle_path(
    client: *const OtaClient,
) -> *mut c_char {
    let Some(client) = client.as_ref() else {
        return std::ptr::null_mut();
    };
    let result = panic::catch_unwind(AssertUnwindSafe(|| client.engine.active_bundle_path()));
    match result {
        Ok(Some(path)) => into_c_string(path.to_string_lossy().into_owned()),
        _ => std::ptr::null_mut(),
    }
}

/// Release a string returned by this module.
///
/// # Safety
/// `s` must be a string returned by this module, or null.
#[no_mangle]
pub unsafe extern "C" fn hotpatch_string_free(s: *mut c_char) {
    if !s.is_null() {
        drop(CString::from_raw(s));
    }
}
