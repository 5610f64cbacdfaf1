//! Replacement bodies for the routed driver and kernel functions.

use std::sync::OnceLock;

use libc::{c_int, c_void};
use log::*;

use crate::patcher::{ModuleRef, Vnode, VnodePathFn};
use crate::patches::{PatchDescriptor, AMD_RADEON_X4000_ID};
use crate::route::InterceptBinding;
use crate::scan;

pub const PAGE_SIZE: usize = 4096;

/// Device id of Polaris 10 (Ellesmere), which the accelerator recognises.
pub const ELLESMERE_DEVICE_ID: u16 = 0x67df;

/// Returned by the firmware load gate to report the feature as off.
pub const FIRMWARE_LOAD_DISABLED: c_int = 0;

pub const CS_VALIDATE_PAGE_SYMBOL: &str = "_cs_validate_page";
pub const GET_HARDWARE_INFO_SYMBOL: &str =
    "__ZN29AMDRadeonX4000_AMDAccelDevice15getHardwareInfoEP24_sAMD_GET_HW_INFO_VALUES";
pub const FIRMWARE_LOAD_GATE_SYMBOL: &str =
    "__ZN26AMDRadeonX4000_AMDHardware21isFirmwareLoadEnabledEv";

pub type CsValidatePageFn = unsafe extern "C" fn(
    Vnode,
    *mut c_void,
    u64,
    *const c_void,
    *mut c_int,
    *mut c_int,
    *mut c_int,
);
pub type GetHardwareInfoFn = unsafe extern "C" fn(*mut c_void, *mut u16) -> c_int;
pub type FirmwareLoadGateFn = unsafe extern "C" fn(*mut c_void) -> c_int;

pub static CS_VALIDATE_PAGE: InterceptBinding<CsValidatePageFn> = InterceptBinding::new(
    ModuleRef::Kernel,
    CS_VALIDATE_PAGE_SYMBOL,
    patched_cs_validate_page as CsValidatePageFn,
);

pub static GET_HARDWARE_INFO: InterceptBinding<GetHardwareInfoFn> = InterceptBinding::new(
    ModuleRef::Kext(AMD_RADEON_X4000_ID),
    GET_HARDWARE_INFO_SYMBOL,
    patched_get_hardware_info as GetHardwareInfoFn,
);

pub static FIRMWARE_LOAD_GATE: InterceptBinding<FirmwareLoadGateFn> = InterceptBinding::new(
    ModuleRef::Kext(AMD_RADEON_X4000_ID),
    FIRMWARE_LOAD_GATE_SYMBOL,
    patched_is_firmware_load_enabled as FirmwareLoadGateFn,
);

/// What the page validation wrapper patches, published once the kernel hook ran.
#[derive(Debug, Clone, Copy)]
pub struct PagePolicy {
    pub descriptor: &'static PatchDescriptor,
    /// Directory holding the shared cache files, with trailing slash.
    pub cache_dir: &'static str,
    pub vnode_path: VnodePathFn,
}

pub static PAGE_POLICY: OnceLock<PagePolicy> = OnceLock::new();

/// Whether `path` names an x86_64 shared cache file (or one of its numbered
/// sub-caches) inside `cache_dir`.
pub fn is_shared_cache_path(cache_dir: &str, path: &str) -> bool {
    let Some(rest) = path
        .strip_prefix(cache_dir)
        .and_then(|name| name.strip_prefix("dyld_shared_cache_x86_64"))
    else {
        return false;
    };
    let rest = rest.strip_prefix('h').unwrap_or(rest);
    match rest.strip_prefix('.') {
        None => rest.is_empty(),
        Some(suffix) => !suffix.is_empty() && suffix.bytes().all(|b| b.is_ascii_digit()),
    }
}

/// Page validation wrapper body. The original validator always runs first.
pub fn validate_page(
    validate: impl FnOnce(),
    path: impl FnOnce() -> Option<String>,
    page: &mut [u8],
    policy: &PagePolicy,
) -> bool {
    validate();

    let Some(path) = path() else {
        return false;
    };
    if !is_shared_cache_path(policy.cache_dir, &path) {
        return false;
    }

    let patched = !scan::scan(page, policy.descriptor).is_empty();
    if patched {
        debug!("found function to patch at {}", path);
    }
    patched
}

/// Hardware info wrapper body: `status` is what the original returned.
pub fn override_device_id(status: c_int, device_id: &mut u16) -> c_int {
    if status == 0 {
        info!("getHardwareInfo: deviceId = {:#x}", *device_id);
        *device_id = ELLESMERE_DEVICE_ID;
    }
    status
}

unsafe extern "C" fn patched_cs_validate_page(
    vp: Vnode,
    pager: *mut c_void,
    page_offset: u64,
    data: *const c_void,
    validated_p: *mut c_int,
    tainted_p: *mut c_int,
    nx_p: *mut c_int,
) {
    let original = CS_VALIDATE_PAGE.original();
    let validate = || unsafe { original(vp, pager, page_offset, data, validated_p, tainted_p, nx_p) };

    match PAGE_POLICY.get() {
        Some(policy) if !data.is_null() => {
            // SAFETY: the validator is handed one mapped, writable page; this
            // call owns it until it returns.
            let page = unsafe { std::slice::from_raw_parts_mut(data as *mut u8, PAGE_SIZE) };
            validate_page(validate, || (policy.vnode_path)(vp), page, policy);
        }
        _ => validate(),
    }
}

unsafe extern "C" fn patched_get_hardware_info(obj: *mut c_void, hw_info: *mut u16) -> c_int {
    let status = unsafe { GET_HARDWARE_INFO.original()(obj, hw_info) };
    debug!("AMDRadeonX4000_AMDAccelDevice::getHardwareInfo: return {:#010x}", status);

    // SAFETY: the caller passes a valid info struct or null; the device id
    // is its first field.
    match unsafe { hw_info.as_mut() } {
        Some(device_id) => override_device_id(status, device_id),
        None => status,
    }
}

/// Never calls through: the firmware load path is skipped entirely.
unsafe extern "C" fn patched_is_firmware_load_enabled(_obj: *mut c_void) -> c_int {
    FIRMWARE_LOAD_DISABLED
}
