//! Instruction-cache maintenance.

/// Make stores to instruction memory visible to the fetch unit.
///
/// On ARM64 the data and instruction caches are not coherent: after
/// writing new instructions through the data cache the sequence is
/// `DSB ISH` (drain the writes), `IC IVAU` per cache line, `DSB ISH`
/// (complete the invalidates), `ISB` (resynchronize the pipeline).
///
/// # Safety
/// `addr` must point to at least `len` bytes of mapped memory.
#[cfg(target_arch = "aarch64")]
pub unsafe fn flush_icache(addr: *const u8, len: usize) {
    use core::arch::asm;

    if len == 0 {
        return;
    }

    let mut line = unsafe { libc::sysconf(libc::_SC_LEVEL1_ICACHE_LINESIZE) };
    if line <= 0 {
        line = 64;
    }
    let line = line as usize;

    let start = addr as usize;
    let end = start + len;

    asm!("dsb ish", options(nostack, preserves_flags));
    let mut p = start & !(line - 1);
    while p < end {
        asm!("ic ivau, {0}", in(reg) p, options(nostack, preserves_flags));
        p += line;
    }
    asm!("dsb ish", options(nostack, preserves_flags));
    asm!("isb", options(nostack, preserves_flags));
}

/// x86 hosts (where only the pure encoder/decoder paths run) have a
/// coherent instruction fetch path; nothing to do.
#[cfg(not(target_arch = "aarch64"))]
pub unsafe fn flush_icache(addr: *const u8, len: usize) {
    let _ = (addr, len);
}
