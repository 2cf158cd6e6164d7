//! Process-memory primitives: raw copies, page protection, and the
//! tear-free patch commit used for live code rewrites.

use crate::code::allocator::page_size;
use crate::code::cache::flush_icache;
use crate::error::{HookError, Result};
use crate::maps::{self, MapRegion};

/// Copy `dst.len()` bytes out of the process image.
///
/// # Safety
/// `addr` must be readable for the full length.
pub unsafe fn read(addr: u64, dst: &mut [u8]) {
    core::ptr::copy_nonoverlapping(addr as *const u8, dst.as_mut_ptr(), dst.len());
}

/// Copy `src` into the process image. The destination must already be
/// writable; use [`protect`] first when it is not.
///
/// # Safety
/// `addr` must be writable for the full length.
pub unsafe fn write(addr: u64, src: &[u8]) {
    core::ptr::copy_nonoverlapping(src.as_ptr(), addr as *mut u8, src.len());
}

/// mprotect over the page-aligned expansion of `[addr, addr + len)`.
pub fn protect(addr: u64, len: usize, prot: libc::c_int) -> Result<()> {
    let page = page_size() as u64;
    let start = addr & !(page - 1);
    let span = (addr - start) as usize + len;
    let span = (span + page as usize - 1) & !(page as usize - 1);
    let rc = unsafe { libc::mprotect(start as *mut libc::c_void, span, prot) };
    if rc != 0 {
        return Err(HookError::MemoryPermission { addr });
    }
    Ok(())
}

/// The mapping containing `addr`, if any.
pub fn find_region(addr: u64) -> Option<MapRegion> {
    let regions = maps::parse();
    maps::find_by_addr(&regions, addr).cloned()
}

/// Commit a patch to live code such that a concurrent instruction fetch of
/// the first word observes either the old or the new word, never a torn
/// mix:
///
/// 1. make the range RWX,
/// 2. write bytes `[4..len)` and flush them,
/// 3. store the head word with one aligned 32-bit write and flush it,
/// 4. restore R+X.
///
/// Callers freeze sibling threads around this because the tail (step 2) is
/// briefly inconsistent with the head, and because execution could
/// otherwise be parked inside the patched range.
///
/// # Safety
/// `addr` must be a mapped code address; no thread may be executing inside
/// `[addr + 4, addr + len)` during the call.
pub unsafe fn atomic_patch(addr: u64, bytes: &[u8]) -> Result<()> {
    if bytes.is_empty() {
        return Ok(());
    }
    if addr % 4 != 0 || bytes.len() % 4 != 0 {
        return Err(HookError::InvalidArgument("patch must be 4-byte aligned"));
    }

    protect(addr, bytes.len(), libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC)?;

    if bytes.len() > 4 {
        write(addr + 4, &bytes[4..]);
        flush_icache((addr + 4) as *const u8, bytes.len() - 4);
    }

    let head = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    // Naturally aligned 32-bit stores are single-copy atomic on AArch64.
    core::ptr::write_volatile(addr as *mut u32, head);
    flush_icache(addr as *const u8, 4);

    protect(addr, bytes.len(), libc::PROT_READ | libc::PROT_EXEC)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code::allocator::alloc_anywhere;

    #[test]
    fn read_write_round_trip() {
        let mut storage = [0u8; 16];
        let addr = storage.as_mut_ptr() as u64;
        unsafe {
            write(addr, &[1, 2, 3, 4]);
            let mut back = [0u8; 4];
            read(addr, &mut back);
            assert_eq!(back, [1, 2, 3, 4]);
        }
        assert_eq!(&storage[..4], &[1, 2, 3, 4]);
    }

    #[test]
    fn protect_expands_to_page_boundaries() {
        let block = alloc_anywhere(page_size() * 2).unwrap();
        // An unaligned interior range must still succeed.
        protect(block.addr() + 7, 3, libc::PROT_READ).unwrap();
        protect(block.addr(), block.len(), libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC)
            .unwrap();
    }

    #[test]
    fn atomic_patch_rejects_unaligned() {
        let block = alloc_anywhere(64).unwrap();
        let err = unsafe { atomic_patch(block.addr() + 2, &[0; 4]) }.unwrap_err();
        assert!(matches!(err, HookError::InvalidArgument(_)));
        let err = unsafe { atomic_patch(block.addr(), &[0; 3]) }.unwrap_err();
        assert!(matches!(err, HookError::InvalidArgument(_)));
    }

    #[test]
    fn atomic_patch_writes_all_bytes() {
        let block = alloc_anywhere(64).unwrap();
        let patch: Vec<u8> = (0..20u8).collect();
        unsafe {
            atomic_patch(block.addr(), &patch).unwrap();
            let mut back = vec![0u8; 20];
            read(block.addr(), &mut back);
            assert_eq!(back, patch);
        }
    }

    #[test]
    fn find_region_locates_own_code() {
        let here = find_region_locates_own_code as *const () as u64;
        let region = find_region(here).expect("text region");
        assert!(region.contains(here));
        assert!(region.perms.contains('x'));
    }
}
