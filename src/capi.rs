//! C ABI over the hooking primitives, for hosts that load the library
//! with `dlopen`. Every function is null-safe and never unwinds across
//! the boundary; fallible calls return `WL_OK` (0), `WL_ERROR` (-1) or
//! `WL_INVALID_ARG` (-2).

use core::ffi::{c_char, c_int, c_void, CStr};
use std::panic::{catch_unwind, AssertUnwindSafe};

use crate::hooks::inline::InlineHook;
use crate::hooks::mid::{CpuContext, MidHook, MidHookCallback};
use crate::hooks::plt::PltHook;
use crate::hooks::vmt::{VmSlotHook, VmtHook};
use crate::mem;

pub const WL_OK: c_int = 0;
pub const WL_ERROR: c_int = -1;
pub const WL_INVALID_ARG: c_int = -2;

fn guarded(f: impl FnOnce() -> c_int) -> c_int {
    catch_unwind(AssertUnwindSafe(f)).unwrap_or(WL_ERROR)
}

// --- Memory ---

/// # Safety
/// `addr` must be readable for `len` bytes and `buffer` writable for them.
#[no_mangle]
pub unsafe extern "C" fn wl_memory_read(addr: u64, buffer: *mut c_void, len: usize) -> c_int {
    if buffer.is_null() {
        return WL_INVALID_ARG;
    }
    mem::read(addr, core::slice::from_raw_parts_mut(buffer as *mut u8, len));
    WL_OK
}

/// # Safety
/// `addr` must be writable for `len` bytes and `buffer` readable for them.
#[no_mangle]
pub unsafe extern "C" fn wl_memory_write(addr: u64, buffer: *const c_void, len: usize) -> c_int {
    if buffer.is_null() {
        return WL_INVALID_ARG;
    }
    mem::write(addr, core::slice::from_raw_parts(buffer as *const u8, len));
    WL_OK
}

#[no_mangle]
pub extern "C" fn wl_memory_protect(addr: u64, len: usize, prot: c_int) -> c_int {
    guarded(|| match mem::protect(addr, len, prot) {
        Ok(()) => WL_OK,
        Err(_) => WL_ERROR,
    })
}

/// # Safety
/// `addr` must point to `len` bytes of mapped memory.
#[no_mangle]
pub unsafe extern "C" fn wl_memory_flush_icache(addr: u64, len: usize) {
    crate::code::cache::flush_icache(addr as *const u8, len);
}

/// # Safety
/// See `mem::atomic_patch`.
#[no_mangle]
pub unsafe extern "C" fn wl_memory_atomic_patch(
    addr: u64,
    bytes: *const u8,
    len: usize,
) -> c_int {
    if bytes.is_null() {
        return WL_INVALID_ARG;
    }
    let slice = core::slice::from_raw_parts(bytes, len);
    match mem::atomic_patch(addr, slice) {
        Ok(()) => WL_OK,
        Err(_) => WL_ERROR,
    }
}

// --- Inline hooks ---

/// # Safety
/// `target` must be patchable AArch64 code; `out` must be a valid pointer.
#[no_mangle]
pub unsafe extern "C" fn wl_inline_hook_create(
    target: u64,
    detour: *const c_void,
    enable_now: c_int,
    out: *mut *mut InlineHook,
) -> c_int {
    if out.is_null() {
        return WL_INVALID_ARG;
    }
    guarded(|| match InlineHook::install(target, detour as u64, enable_now != 0) {
        Ok(hook) => {
            *out = Box::into_raw(Box::new(hook));
            WL_OK
        }
        Err(crate::error::HookError::InvalidArgument(_)) => WL_INVALID_ARG,
        Err(_) => WL_ERROR,
    })
}

/// Uninstalls and frees the hook. Null is a no-op.
///
/// # Safety
/// `hook` must have come from `wl_inline_hook_create`.
#[no_mangle]
pub unsafe extern "C" fn wl_inline_hook_destroy(hook: *mut InlineHook) {
    if !hook.is_null() {
        let _ = catch_unwind(AssertUnwindSafe(|| drop(Box::from_raw(hook))));
    }
}

/// # Safety
/// `hook` must be a live handle.
#[no_mangle]
pub unsafe extern "C" fn wl_inline_hook_enable(hook: *mut InlineHook) -> c_int {
    if hook.is_null() {
        return WL_INVALID_ARG;
    }
    guarded(|| if (*hook).enable() { WL_OK } else { WL_ERROR })
}

/// # Safety
/// `hook` must be a live handle.
#[no_mangle]
pub unsafe extern "C" fn wl_inline_hook_disable(hook: *mut InlineHook) -> c_int {
    if hook.is_null() {
        return WL_INVALID_ARG;
    }
    guarded(|| if (*hook).disable() { WL_OK } else { WL_ERROR })
}

/// # Safety
/// `hook` must be a live handle.
#[no_mangle]
pub unsafe extern "C" fn wl_inline_hook_trampoline(hook: *const InlineHook) -> u64 {
    if hook.is_null() {
        return 0;
    }
    (*hook).trampoline()
}

/// # Safety
/// `hook` must be a live handle.
#[no_mangle]
pub unsafe extern "C" fn wl_inline_hook_original(hook: *const InlineHook) -> u64 {
    if hook.is_null() {
        return 0;
    }
    (*hook).original()
}

/// # Safety
/// `hook` must be a live handle.
#[no_mangle]
pub unsafe extern "C" fn wl_inline_hook_set_detour(hook: *mut InlineHook, detour: *const c_void) {
    if !hook.is_null() {
        let _ = catch_unwind(AssertUnwindSafe(|| (*hook).set_detour(detour as u64)));
    }
}

// --- Mid hooks ---

pub type WlMidCallback = extern "C" fn(*mut CpuContext);

/// # Safety
/// `target` must be hookable AArch64 code; `out` must be valid.
#[no_mangle]
pub unsafe extern "C" fn wl_mid_hook_create(
    target: u64,
    callback: Option<WlMidCallback>,
    out: *mut *mut MidHook,
) -> c_int {
    let Some(callback) = callback else {
        return WL_INVALID_ARG;
    };
    if out.is_null() {
        return WL_INVALID_ARG;
    }
    // `&mut CpuContext` and `*mut CpuContext` share an ABI.
    let callback: MidHookCallback = core::mem::transmute(callback);
    guarded(|| match MidHook::install(target, callback) {
        Ok(hook) => {
            *out = Box::into_raw(Box::new(hook));
            WL_OK
        }
        Err(crate::error::HookError::InvalidArgument(_)) => WL_INVALID_ARG,
        Err(_) => WL_ERROR,
    })
}

/// # Safety
/// `hook` must have come from `wl_mid_hook_create`.
#[no_mangle]
pub unsafe extern "C" fn wl_mid_hook_destroy(hook: *mut MidHook) {
    if !hook.is_null() {
        let _ = catch_unwind(AssertUnwindSafe(|| drop(Box::from_raw(hook))));
    }
}

/// # Safety
/// `hook` must be a live handle.
#[no_mangle]
pub unsafe extern "C" fn wl_mid_hook_enable(hook: *mut MidHook) -> c_int {
    if hook.is_null() {
        return WL_INVALID_ARG;
    }
    guarded(|| if (*hook).enable() { WL_OK } else { WL_ERROR })
}

/// # Safety
/// `hook` must be a live handle.
#[no_mangle]
pub unsafe extern "C" fn wl_mid_hook_disable(hook: *mut MidHook) -> c_int {
    if hook.is_null() {
        return WL_INVALID_ARG;
    }
    guarded(|| if (*hook).disable() { WL_OK } else { WL_ERROR })
}

// --- VMT hooks ---

/// # Safety
/// `instance` must point at an object whose first word is a vtable.
#[no_mangle]
pub unsafe extern "C" fn wl_vmt_hook_create(
    instance: *mut c_void,
    out: *mut *mut VmtHook,
) -> c_int {
    if out.is_null() {
        return WL_INVALID_ARG;
    }
    guarded(|| match VmtHook::attach(instance) {
        Ok(vmt) => {
            *out = Box::into_raw(Box::new(vmt));
            WL_OK
        }
        Err(_) => WL_INVALID_ARG,
    })
}

/// # Safety
/// `vmt` must have come from `wl_vmt_hook_create`.
#[no_mangle]
pub unsafe extern "C" fn wl_vmt_hook_destroy(vmt: *mut VmtHook) {
    if !vmt.is_null() {
        let _ = catch_unwind(AssertUnwindSafe(|| drop(Box::from_raw(vmt))));
    }
}

/// # Safety
/// `vmt` must be live; `index` must be inside the table.
#[no_mangle]
pub unsafe extern "C" fn wl_vmt_hook_method(
    vmt: *mut VmtHook,
    index: usize,
    replacement: *const c_void,
    out: *mut *mut VmSlotHook,
) -> c_int {
    if vmt.is_null() || out.is_null() {
        return WL_INVALID_ARG;
    }
    guarded(|| match (*vmt).hook(index, replacement as u64) {
        Ok(slot) => {
            *out = Box::into_raw(Box::new(slot));
            WL_OK
        }
        Err(_) => WL_ERROR,
    })
}

/// # Safety
/// `slot` must have come from `wl_vmt_hook_method`.
#[no_mangle]
pub unsafe extern "C" fn wl_vm_hook_destroy(slot: *mut VmSlotHook) {
    if !slot.is_null() {
        let _ = catch_unwind(AssertUnwindSafe(|| drop(Box::from_raw(slot))));
    }
}

/// # Safety
/// `slot` must be a live handle.
#[no_mangle]
pub unsafe extern "C" fn wl_vm_hook_original(slot: *const VmSlotHook) -> u64 {
    if slot.is_null() {
        return 0;
    }
    (*slot).original()
}

/// # Safety
/// `slot` must be a live handle.
#[no_mangle]
pub unsafe extern "C" fn wl_vm_hook_enable(slot: *mut VmSlotHook) -> c_int {
    if slot.is_null() {
        return WL_INVALID_ARG;
    }
    guarded(|| if (*slot).enable() { WL_OK } else { WL_ERROR })
}

/// # Safety
/// `slot` must be a live handle.
#[no_mangle]
pub unsafe extern "C" fn wl_vm_hook_disable(slot: *mut VmSlotHook) -> c_int {
    if slot.is_null() {
        return WL_INVALID_ARG;
    }
    guarded(|| if (*slot).disable() { WL_OK } else { WL_ERROR })
}

// --- PLT hooks ---

/// # Safety
/// `base` must be a mapped ELF image; `out` must be valid.
#[no_mangle]
pub unsafe extern "C" fn wl_plthook_create_from_base(
    base: u64,
    out: *mut *mut PltHook,
) -> c_int {
    if out.is_null() {
        return WL_INVALID_ARG;
    }
    guarded(|| match PltHook::from_base(base) {
        Ok(hook) => {
            *out = Box::into_raw(Box::new(hook));
            WL_OK
        }
        Err(_) => WL_ERROR,
    })
}

/// # Safety
/// `path` must be a NUL-terminated string; `out` must be valid.
#[no_mangle]
pub unsafe extern "C" fn wl_plthook_create_from_path(
    path: *const c_char,
    out: *mut *mut PltHook,
) -> c_int {
    if path.is_null() || out.is_null() {
        return WL_INVALID_ARG;
    }
    let Ok(path) = CStr::from_ptr(path).to_str() else {
        return WL_INVALID_ARG;
    };
    guarded(|| match PltHook::from_path(path) {
        Ok(hook) => {
            *out = Box::into_raw(Box::new(hook));
            WL_OK
        }
        Err(_) => WL_ERROR,
    })
}

/// # Safety
/// `hook` must have come from one of the create functions.
#[no_mangle]
pub unsafe extern "C" fn wl_plthook_destroy(hook: *mut PltHook) {
    if !hook.is_null() {
        let _ = catch_unwind(AssertUnwindSafe(|| drop(Box::from_raw(hook))));
    }
}

/// # Safety
/// `hook` must be live; `symbol` must be NUL-terminated.
#[no_mangle]
pub unsafe extern "C" fn wl_plthook_hook_symbol(
    hook: *mut PltHook,
    symbol: *const c_char,
    replacement: *const c_void,
    original_out: *mut *const c_void,
) -> c_int {
    if hook.is_null() || symbol.is_null() {
        return WL_INVALID_ARG;
    }
    let Ok(symbol) = CStr::from_ptr(symbol).to_str() else {
        return WL_INVALID_ARG;
    };
    guarded(|| match (*hook).hook(symbol, replacement as u64) {
        Ok(original) => {
            if !original_out.is_null() {
                *original_out = original as *const c_void;
            }
            WL_OK
        }
        Err(_) => WL_ERROR,
    })
}

/// # Safety
/// `hook` must be live; `symbol` must be NUL-terminated.
#[no_mangle]
pub unsafe extern "C" fn wl_plthook_unhook_symbol(
    hook: *mut PltHook,
    symbol: *const c_char,
) -> c_int {
    if hook.is_null() || symbol.is_null() {
        return WL_INVALID_ARG;
    }
    let Ok(symbol) = CStr::from_ptr(symbol).to_str() else {
        return WL_INVALID_ARG;
    };
    guarded(|| if (*hook).unhook(symbol) { WL_OK } else { WL_ERROR })
}
