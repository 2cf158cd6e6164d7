//! Executable memory, with a near-target placement policy.
//!
//! Detour stubs must land within branch range of the code they service, so
//! the allocator probes outward from the target for a free page before
//! giving up and taking whatever the kernel offers.

use std::sync::{Mutex, OnceLock};

use crate::error::{HookError, Result};
use log::warn;

/// Reach of the near policy: the +/-128 MiB range of a B instruction.
pub const NEAR_WINDOW: u64 = 128 * 1024 * 1024;

const PROBE_STEP: u64 = 1024 * 1024;
const MAX_PROBES: u64 = 256;

pub fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

/// A page-aligned anonymous RWX mapping, owned exclusively by this object
/// and unmapped on drop.
#[derive(Debug)]
pub struct ExecBlock {
    ptr: *mut u8,
    len: usize,
}

unsafe impl Send for ExecBlock {}

impl ExecBlock {
    pub fn addr(&self) -> u64 {
        self.ptr as u64
    }

    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.ptr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copy machine code into the block and invalidate its icache range.
    ///
    /// # Safety
    /// No thread may be executing inside the block.
    pub unsafe fn write_code(&self, offset: usize, bytes: &[u8]) {
        debug_assert!(offset + bytes.len() <= self.len);
        core::ptr::copy_nonoverlapping(bytes.as_ptr(), self.ptr.add(offset), bytes.len());
        crate::code::cache::flush_icache(self.ptr.add(offset), bytes.len());
    }
}

impl Drop for ExecBlock {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.len);
        }
    }
}

fn round_up(size: usize, page: usize) -> usize {
    size.checked_add(page - 1).map(|s| s & !(page - 1)).unwrap_or(usize::MAX)
}

unsafe fn mmap_rwx(hint: u64, len: usize, extra_flags: libc::c_int) -> Option<*mut u8> {
    let ptr = libc::mmap(
        hint as *mut libc::c_void,
        len,
        libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | extra_flags,
        -1,
        0,
    );
    if ptr == libc::MAP_FAILED {
        None
    } else {
        Some(ptr as *mut u8)
    }
}

/// Allocate at any address the kernel picks.
pub fn alloc_anywhere(size: usize) -> Result<ExecBlock> {
    let len = round_up(size.max(1), page_size());
    match unsafe { mmap_rwx(0, len, 0) } {
        Some(ptr) => Ok(ExecBlock { ptr, len }),
        None => Err(HookError::AllocationFailed),
    }
}

/// Allocate within [`NEAR_WINDOW`] of `target`.
///
/// Candidate pages are probed symmetrically outward from the target's page
/// in 1 MiB steps, first with `MAP_FIXED_NOREPLACE` (which fails cleanly on
/// occupied ranges), then with a plain hint whose result is validated and
/// unmapped on overshoot. Falls back to [`alloc_anywhere`] as a last
/// resort; callers that need reachability must check the distance.
pub fn alloc_near(target: u64, size: usize) -> Result<ExecBlock> {
    let page = page_size();
    let len = round_up(size.max(1), page);
    let base = target & !(page as u64 - 1);
    let reach = NEAR_WINDOW.saturating_sub(len as u64);

    for i in 0..MAX_PROBES {
        let delta = (i / 2 + 1) * PROBE_STEP;
        if delta > reach {
            break;
        }
        let candidate = if i % 2 == 0 {
            base.wrapping_add(delta)
        } else {
            match base.checked_sub(delta) {
                Some(c) => c,
                None => continue,
            }
        };
        if let Some(ptr) = unsafe { mmap_rwx(candidate, len, libc::MAP_FIXED_NOREPLACE) } {
            return Ok(ExecBlock { ptr, len });
        }
    }

    // Older kernels reject MAP_FIXED_NOREPLACE; retry with a bare hint and
    // validate what came back.
    if let Some(ptr) = unsafe { mmap_rwx(base, len, 0) } {
        let dist = (ptr as u64).abs_diff(target);
        if dist <= reach {
            return Ok(ExecBlock { ptr, len });
        }
        unsafe {
            libc::munmap(ptr as *mut libc::c_void, len);
        }
    }

    warn!("no placement within {NEAR_WINDOW:#x} of {target:#x}, allocating anywhere");
    alloc_anywhere(size)
}

/// Park a block that carried live code instead of unmapping it: a sibling
/// thread can be a few instructions deep inside a stub or trampoline at
/// the moment its hook is torn down, and no lock covers that traversal.
/// Retired pages are reclaimed when the process exits.
pub(crate) fn retire(block: ExecBlock) {
    static RETIRED: OnceLock<Mutex<Vec<ExecBlock>>> = OnceLock::new();
    RETIRED
        .get_or_init(|| Mutex::new(Vec::new()))
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .push(block);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_anywhere_is_page_aligned_and_rounded() {
        let page = page_size() as u64;
        let block = alloc_anywhere(10).expect("alloc");
        assert_eq!(block.addr() % page, 0);
        assert_eq!(block.len() % page_size(), 0);
        assert!(block.len() >= 10);
    }

    #[test]
    fn alloc_near_lands_within_window() {
        let anchor = alloc_near_lands_within_window as *const () as u64;
        let block = alloc_near(anchor, 64).expect("alloc_near");
        assert_eq!(block.addr() % page_size() as u64, 0);
        assert!(
            block.addr().abs_diff(anchor) <= NEAR_WINDOW,
            "block {:#x} not within {:#x} of {:#x}",
            block.addr(),
            NEAR_WINDOW,
            anchor
        );
    }

    #[test]
    fn blocks_are_writable_and_independent() {
        let a = alloc_anywhere(page_size()).unwrap();
        let b = alloc_anywhere(page_size()).unwrap();
        assert_ne!(a.addr(), b.addr());
        unsafe {
            a.write_code(0, &[0x1F, 0x20, 0x03, 0xD5]); // nop
            b.write_code(0, &[0xC0, 0x03, 0x5F, 0xD6]); // ret
            assert_eq!(core::ptr::read(a.as_mut_ptr()), 0x1F);
            assert_eq!(core::ptr::read(b.as_mut_ptr()), 0xC0);
        }
    }

    #[test]
    #[cfg(target_arch = "aarch64")]
    fn allocated_code_is_executable() {
        let block = alloc_anywhere(16).unwrap();
        unsafe {
            // MOV W0, #42; RET
            block.write_code(0, &0x5280_0540u32.to_le_bytes());
            block.write_code(4, &0xD65F_03C0u32.to_le_bytes());
            let f: extern "C" fn() -> u64 = core::mem::transmute(block.addr());
            assert_eq!(f(), 42);
        }
    }
}
