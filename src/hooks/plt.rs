//! PLT/GOT hooks: redirect a module's imported symbol by rewriting its
//! Global Offset Table slot.

use std::collections::HashMap;

use log::{debug, warn};

use crate::elf::ElfImage;
use crate::error::{HookError, Result};
use crate::maps;
use crate::mem;

struct PltEntry {
    slot: u64,
    original: u64,
    replacement: u64,
}

/// Rewrite a GOT slot, restoring whatever protection the page had
/// (jump slots commonly live in read-only RELRO segments).
fn write_got(slot: u64, value: u64) -> Result<u64> {
    if slot % 8 != 0 {
        return Err(HookError::Parse("misaligned GOT slot"));
    }
    let previous = unsafe { core::ptr::read(slot as *const u64) };
    let restore = mem::find_region(slot)
        .map(|r| r.prot())
        .filter(|&p| p != 0)
        .unwrap_or(libc::PROT_READ);

    mem::protect(slot, 8, libc::PROT_READ | libc::PROT_WRITE)?;
    // Aligned pointer-sized stores are single-copy atomic; concurrent
    // PLT calls observe either function, never a torn pointer.
    unsafe { core::ptr::write_volatile(slot as *mut u64, value) };
    mem::protect(slot, 8, restore)?;
    Ok(previous)
}

/// PLT hooks over one loaded module. All still-hooked symbols are
/// restored on drop.
pub struct PltHook {
    image: ElfImage,
    entries: HashMap<String, PltEntry>,
}

impl PltHook {
    /// Attach to the module loaded at `base`.
    ///
    /// # Safety
    /// `base` must be the load address of a mapped ELF image that outlives
    /// this value.
    pub unsafe fn from_base(base: u64) -> Result<PltHook> {
        Ok(PltHook {
            image: ElfImage::from_base(base)?,
            entries: HashMap::new(),
        })
    }

    /// Attach to the module whose mapping path contains `path`; the lowest
    /// mapped address of that module is taken as its base.
    pub fn from_path(path: &str) -> Result<PltHook> {
        let regions = maps::parse();
        let base = maps::find_base_by_path(&regions, path)
            .ok_or(HookError::Parse("module not found in /proc/self/maps"))?;
        unsafe { Self::from_base(base) }
    }

    pub fn base(&self) -> u64 {
        self.image.base()
    }

    /// Redirect all PLT-routed calls to `symbol` through `replacement`.
    /// Returns the captured original so the replacement can call through.
    /// Hooking an already-hooked symbol swaps the replacement and returns
    /// the untouched original.
    pub fn hook(&mut self, symbol: &str, replacement: u64) -> Result<u64> {
        if symbol.is_empty() || replacement == 0 {
            return Err(HookError::InvalidArgument("null symbol or replacement"));
        }

        if let Some(entry) = self.entries.get_mut(symbol) {
            write_got(entry.slot, replacement)?;
            entry.replacement = replacement;
            return Ok(entry.original);
        }

        let slot = self
            .image
            .plt_slot(symbol)
            .ok_or_else(|| HookError::SymbolNotFound(symbol.to_string()))?;
        let original = write_got(slot, replacement)?;
        debug!("plt hook {symbol}: slot {slot:#x}, original {original:#x}");
        self.entries.insert(
            symbol.to_string(),
            PltEntry {
                slot,
                original,
                replacement,
            },
        );
        Ok(original)
    }

    /// Restore the original pointer for `symbol`. Returns false when the
    /// symbol is not currently hooked.
    pub fn unhook(&mut self, symbol: &str) -> bool {
        let Some(entry) = self.entries.get(symbol) else {
            return false;
        };
        match write_got(entry.slot, entry.original) {
            Ok(_) => {
                self.entries.remove(symbol);
                true
            }
            Err(e) => {
                warn!("failed to restore GOT slot for {symbol}: {e}");
                false
            }
        }
    }

    pub fn is_hooked(&self, symbol: &str) -> bool {
        self.entries.contains_key(symbol)
    }
}

impl Drop for PltHook {
    fn drop(&mut self) {
        let symbols: Vec<String> = self.entries.keys().cloned().collect();
        for symbol in symbols {
            self.unhook(&symbol);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

    fn own_exe_hook() -> Option<PltHook> {
        let exe = std::fs::read_link("/proc/self/exe").ok()?;
        PltHook::from_path(exe.to_str()?).ok()
    }

    #[test]
    fn from_path_rejects_unknown_modules() {
        assert!(matches!(
            PltHook::from_path("definitely-not-a-mapped-module"),
            Err(HookError::Parse(_))
        ));
    }

    #[test]
    fn hook_rejects_bad_arguments() {
        let Some(mut hook) = own_exe_hook() else { return };
        assert!(hook.hook("", 0x1000).is_err());
        assert!(hook.hook("getpid", 0).is_err());
        assert!(matches!(
            hook.hook("not_an_imported_symbol_a7f", 0x1000),
            Err(HookError::SymbolNotFound(_))
        ));
    }

    static GETPID_CALLS: AtomicUsize = AtomicUsize::new(0);
    static REAL_GETPID: AtomicU64 = AtomicU64::new(0);

    extern "C" fn counting_getpid() -> libc::pid_t {
        GETPID_CALLS.fetch_add(1, Ordering::SeqCst);
        let real: extern "C" fn() -> libc::pid_t =
            unsafe { core::mem::transmute(REAL_GETPID.load(Ordering::SeqCst) as usize) };
        real()
    }

    #[test]
    fn hooked_import_counts_calls_and_still_works() {
        let _g = crate::lock_hook_tests();
        let Some(mut hook) = own_exe_hook() else { return };

        // The test binary may import getpid through the PLT; when it does
        // not (static libc, direct GOT binding), there is nothing to test.
        let Some(slot) = hook.image.plt_slot("getpid") else { return };
        // Force lazy binding to resolve the slot, then capture the forward
        // address before swapping it, so the replacement can call through
        // from the first interception on.
        let _ = unsafe { libc::getpid() };
        REAL_GETPID.store(unsafe { core::ptr::read(slot as *const u64) }, Ordering::SeqCst);
        GETPID_CALLS.store(0, Ordering::SeqCst);
        let original = match hook.hook("getpid", counting_getpid as usize as u64) {
            Ok(original) => original,
            Err(_) => return,
        };
        assert_eq!(original, REAL_GETPID.load(Ordering::SeqCst));

        let pid = unsafe { libc::getpid() };
        assert!(pid > 0);
        assert!(
            GETPID_CALLS.load(Ordering::SeqCst) >= 1,
            "PLT-routed call must hit the replacement"
        );

        assert!(hook.unhook("getpid"));
        let calls = GETPID_CALLS.load(Ordering::SeqCst);
        let _ = unsafe { libc::getpid() };
        assert_eq!(
            GETPID_CALLS.load(Ordering::SeqCst),
            calls,
            "no further log entries after unhook"
        );
        assert!(!hook.unhook("getpid"), "double unhook reports false");
    }

    #[test]
    fn drop_restores_hooked_slots() {
        let _g = crate::lock_hook_tests();
        let Some(mut hook) = own_exe_hook() else { return };
        let slot = match hook.image.plt_slot("getpid") {
            Some(slot) => slot,
            None => return,
        };
        let _ = unsafe { libc::getpid() };
        let before = unsafe { core::ptr::read(slot as *const u64) };
        REAL_GETPID.store(before, Ordering::SeqCst);

        if hook.hook("getpid", counting_getpid as usize as u64).is_err() {
            return;
        }
        drop(hook);

        let after = unsafe { core::ptr::read(slot as *const u64) };
        assert_eq!(before, after, "drop must restore the GOT slot");
    }
}
