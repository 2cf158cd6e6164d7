//! Virtual-method-table hooks: pointer swaps in a vtable slot.
//!
//! Chaining works by stacking: each hook captures whatever the slot held
//! when it was installed, so a later hook's "original" is the earlier
//! hook's replacement.

use crate::error::{HookError, Result};
use crate::mem;
use crate::threads::FreezeGuard;

/// Swap a pointer-sized slot, preserving whatever protection the page had.
fn write_slot(slot: *mut u64, value: u64) -> Result<()> {
    let addr = slot as u64;
    if addr % 8 != 0 {
        return Err(HookError::InvalidArgument("misaligned vtable slot"));
    }
    let restore = mem::find_region(addr)
        .map(|r| r.prot())
        .filter(|&p| p != 0)
        .unwrap_or(libc::PROT_READ);

    let _world = FreezeGuard::freeze();
    mem::protect(addr, 8, libc::PROT_READ | libc::PROT_WRITE)?;
    // Aligned 64-bit stores are single-copy atomic on AArch64.
    unsafe { core::ptr::write_volatile(slot, value) };
    mem::protect(addr, 8, restore)?;
    Ok(())
}

/// A view over one object's vtable.
#[derive(Debug)]
pub struct VmtHook {
    vmt: *mut u64,
}

impl VmtHook {
    /// Attach to a C++-style object: the pointer-sized word at `instance`
    /// is taken as the vtable address.
    ///
    /// # Safety
    /// `instance` must point to an object whose first word is a vtable
    /// pointer, and the vtable must stay mapped while hooks exist.
    pub unsafe fn attach(instance: *mut core::ffi::c_void) -> Result<VmtHook> {
        if instance.is_null() {
            return Err(HookError::InvalidArgument("null instance"));
        }
        let vmt = *(instance as *mut *mut u64);
        Self::attach_table(vmt)
    }

    /// Attach directly to a table of function pointers.
    ///
    /// # Safety
    /// `vmt` must point to a readable array of function pointers.
    pub unsafe fn attach_table(vmt: *mut u64) -> Result<VmtHook> {
        if vmt.is_null() {
            return Err(HookError::InvalidArgument("null vtable"));
        }
        Ok(VmtHook { vmt })
    }

    pub fn table(&self) -> *mut u64 {
        self.vmt
    }

    /// Replace the function pointer at `index`. The returned handle
    /// restores the captured previous value on uninstall or drop.
    pub fn hook(&mut self, index: usize, replacement: u64) -> Result<VmSlotHook> {
        if replacement == 0 {
            return Err(HookError::InvalidArgument("null replacement"));
        }
        let slot = unsafe { self.vmt.add(index) };
        let original = unsafe { core::ptr::read(slot) };
        write_slot(slot, replacement)?;
        Ok(VmSlotHook {
            slot,
            original,
            replacement,
            enabled: true,
        })
    }
}

/// One hooked vtable slot.
#[derive(Debug)]
pub struct VmSlotHook {
    slot: *mut u64,
    original: u64,
    replacement: u64,
    enabled: bool,
}

unsafe impl Send for VmSlotHook {}

impl VmSlotHook {
    /// The pointer the slot held at install time: for a chained hook this
    /// is the previous hook's replacement.
    pub fn original(&self) -> u64 {
        self.original
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn enable(&mut self) -> bool {
        if self.slot.is_null() || self.enabled {
            return false;
        }
        match write_slot(self.slot, self.replacement) {
            Ok(()) => {
                self.enabled = true;
                true
            }
            Err(_) => false,
        }
    }

    pub fn disable(&mut self) -> bool {
        if self.slot.is_null() || !self.enabled {
            return false;
        }
        match write_slot(self.slot, self.original) {
            Ok(()) => {
                self.enabled = false;
                true
            }
            Err(_) => false,
        }
    }

    pub fn uninstall(mut self) {
        self.detach();
    }

    fn detach(&mut self) {
        if self.slot.is_null() {
            return;
        }
        if self.enabled {
            if let Err(e) = write_slot(self.slot, self.original) {
                log::warn!("failed to restore vtable slot: {e}");
            }
        }
        self.slot = core::ptr::null_mut();
    }
}

impl Drop for VmSlotHook {
    fn drop(&mut self) {
        self.detach();
    }
}
