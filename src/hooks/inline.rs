//! Inline hooks: prologue patching with chain support.
//!
//! Per hooked target the engine keeps one [`HookInfo`]: the saved prologue
//! bytes, the trampoline that replays them, a detour stub allocated near
//! the target, the cached patch sequence, and the ordered chain of
//! installed entries. The target's first instruction either is original
//! (no enabled entry) or routes to the head enabled entry's callback via
//! the near stub.
//!
//! Locking: the process-wide registry mutex is taken first and only for
//! resolving or reshaping the target -> info map; each `HookInfo` then has
//! its own mutex for everything else. Patches and live-stub rewrites run
//! inside a stop-the-world window.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use log::{debug, warn};

use crate::arch::arm64::emitter::{CodeBuf, ABS_JUMP_SIZE};
use crate::arch::arm64::reg::Reg;
use crate::code::allocator::{alloc_anywhere, alloc_near, ExecBlock};
use crate::error::{HookError, Result};
use crate::hooks::patch::{self, PatchPlan};
use crate::hooks::trampoline;
use crate::mem;
use crate::threads::FreezeGuard;

/// The detour stub is a single absolute jump.
const STUB_SIZE: usize = ABS_JUMP_SIZE;

struct HookEntry {
    id: u64,
    callback: u64,
    /// What this entry's owner invokes to reach the rest of the chain:
    /// the next entry's callback, or the trampoline at the tail.
    call_next: u64,
    enabled: bool,
}

struct HookInfo {
    target: u64,
    backup: Vec<u8>,
    trampoline: Option<ExecBlock>,
    stub: Option<ExecBlock>,
    patch: Option<PatchPlan>,
    /// Whether the patch sequence is currently written at the target.
    patched: bool,
    /// Head first.
    chain: Vec<HookEntry>,
}

impl HookInfo {
    fn new(target: u64) -> HookInfo {
        HookInfo {
            target,
            backup: Vec::new(),
            trampoline: None,
            stub: None,
            patch: None,
            patched: false,
            chain: Vec::new(),
        }
    }

    fn trampoline_addr(&self) -> u64 {
        self.trampoline.as_ref().map(|t| t.addr()).unwrap_or(0)
    }

    fn first_enabled(&self) -> Option<&HookEntry> {
        self.chain.iter().find(|e| e.enabled)
    }
}

type Registry = Mutex<HashMap<u64, Arc<Mutex<HookInfo>>>>;

fn registry() -> &'static Registry {
    static REGISTRY: OnceLock<Registry> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

fn next_entry_id() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Run `f` under the target's info mutex, if the target is registered.
fn with_info<R>(target: u64, f: impl FnOnce(&mut HookInfo) -> R) -> Option<R> {
    let arc = lock(registry()).get(&target).cloned()?;
    let mut info = lock(&arc);
    Some(f(&mut info))
}

/// Bring the live state in line with the chain: the stub jumps to the
/// first enabled callback (parked on the trampoline otherwise), and the
/// target carries the patch exactly when an enabled entry exists.
///
/// Runs under stop-the-world: the stub may be live, and the patch tail is
/// briefly inconsistent with its head.
fn commit(info: &mut HookInfo) -> Result<()> {
    let stub = info.stub.as_ref().ok_or(HookError::AllocationFailed)?;
    let plan = info.patch.as_ref().ok_or(HookError::AllocationFailed)?;
    let head = info.first_enabled().map(|e| e.callback);
    let stub_dest = head.unwrap_or_else(|| info.trampoline_addr());

    let mut jump = CodeBuf::new(stub.addr());
    jump.abs_jump(stub_dest, Reg::X16);
    let stub_bytes = jump.to_bytes();
    // Everything the frozen window touches is materialized up front; a
    // parked thread may hold the allocator lock.
    let patch_bytes = plan.to_bytes();

    let _world = FreezeGuard::freeze();
    unsafe {
        stub.write_code(0, &stub_bytes);
    }
    if head.is_some() {
        unsafe { mem::atomic_patch(info.target, &patch_bytes)? };
        info.patched = true;
    } else if info.patched {
        unsafe { mem::atomic_patch(info.target, &info.backup)? };
        info.patched = false;
    }
    Ok(())
}

fn install_locked(info: &mut HookInfo, detour: u64, enable_now: bool) -> Result<(u64, u64)> {
    let target = info.target;

    if info.stub.is_none() {
        info.stub = Some(alloc_near(target, STUB_SIZE)?);
    }
    let stub_addr = info.stub.as_ref().map(|s| s.addr()).unwrap_or(0);

    let plan = patch::plan(target, stub_addr)?;
    debug!(
        "install {target:#x}: stub {stub_addr:#x}, patch {:?} ({} bytes)",
        plan.kind(),
        plan.size()
    );

    if info.trampoline.is_none() {
        let tramp = unsafe { trampoline::build(target, plan.size())? };
        let block = alloc_anywhere(tramp.len_bytes())?;
        unsafe {
            block.write_code(0, &tramp.to_bytes());
        }
        let mut backup = vec![0u8; tramp.backup_size()];
        unsafe { mem::read(target, &mut backup) };
        debug!(
            "install {target:#x}: trampoline {:#x}, backup {} bytes",
            block.addr(),
            backup.len()
        );
        info.trampoline = Some(block);
        info.backup = backup;
    }
    info.patch = Some(plan);

    let call_next = info
        .chain
        .first()
        .map(|e| e.callback)
        .unwrap_or_else(|| info.trampoline_addr());
    let id = next_entry_id();
    info.chain.insert(
        0,
        HookEntry {
            id,
            callback: detour,
            call_next,
            enabled: enable_now,
        },
    );

    if let Err(e) = commit(info) {
        info.chain.remove(0);
        if !info.chain.is_empty() {
            // Leave the surviving chain consistent.
            if let Err(e2) = commit(info) {
                warn!("rollback commit failed for {target:#x}: {e2}");
            }
        }
        return Err(e);
    }

    Ok((id, call_next))
}

fn uninstall_entry(target: u64, id: u64) {
    let mut reg = lock(registry());
    let Some(arc) = reg.get(&target).cloned() else {
        return;
    };
    let mut info = lock(&arc);
    let Some(pos) = info.chain.iter().position(|e| e.id == id) else {
        return;
    };

    info.chain.remove(pos);
    if pos > 0 {
        let successor = info
            .chain
            .get(pos)
            .map(|e| e.callback)
            .unwrap_or_else(|| info.trampoline_addr());
        info.chain[pos - 1].call_next = successor;
    }

    if info.chain.is_empty() {
        // Restore the original bytes and tear the bookkeeping down. Errors
        // here are logged and swallowed: the entry is already gone, and
        // leaving it half-installed would be worse.
        if info.patched {
            let _world = FreezeGuard::freeze();
            match unsafe { mem::atomic_patch(target, &info.backup) } {
                Ok(()) => info.patched = false,
                Err(e) => warn!("failed to restore {target:#x} on final unhook: {e}"),
            }
        }
        // A caller can still be a few instructions deep in the stub or
        // trampoline; the blocks are retired rather than unmapped.
        if let Some(block) = info.trampoline.take() {
            crate::code::allocator::retire(block);
        }
        if let Some(block) = info.stub.take() {
            crate::code::allocator::retire(block);
        }
        info.patch = None;
        drop(info);
        reg.remove(&target);
        debug!("uninstalled last hook at {target:#x}");
    } else {
        drop(reg);
        if let Err(e) = commit(&mut info) {
            warn!("failed to re-point chain at {target:#x}: {e}");
        }
    }
}

/// An installed inline hook. Dropping the handle uninstalls its entry;
/// the handle is move-only and never cloned.
#[derive(Debug)]
pub struct InlineHook {
    target: u64,
    id: u64,
    callback: u64,
}

impl InlineHook {
    /// Install a hook on `target`. With `enable_now` the prologue is
    /// patched immediately; otherwise the hook sits in the chain disabled
    /// (a null `detour` is then permitted, for callers that JIT their
    /// detour against the trampoline first).
    ///
    /// `target` must be the address of patchable AArch64 code; hooking an
    /// address that is not is undefined behavior.
    pub fn install(target: u64, detour: u64, enable_now: bool) -> Result<InlineHook> {
        if target == 0 {
            return Err(HookError::InvalidArgument("null target"));
        }
        if target % 4 != 0 {
            return Err(HookError::InvalidArgument("misaligned target"));
        }
        if detour == 0 && enable_now {
            return Err(HookError::InvalidArgument("null detour for enabled hook"));
        }

        let arc = {
            let mut reg = lock(registry());
            reg.entry(target)
                .or_insert_with(|| Arc::new(Mutex::new(HookInfo::new(target))))
                .clone()
        };
        let mut info = lock(&arc);

        match install_locked(&mut info, detour, enable_now) {
            Ok((id, _)) => Ok(InlineHook {
                target,
                id,
                callback: detour,
            }),
            Err(e) => {
                let empty = info.chain.is_empty();
                if empty {
                    info.trampoline = None;
                    info.stub = None;
                    info.patch = None;
                }
                drop(info);
                if empty {
                    let mut reg = lock(registry());
                    let still_empty = reg
                        .get(&target)
                        .map(|arc| lock(arc).chain.is_empty())
                        .unwrap_or(false);
                    if still_empty {
                        reg.remove(&target);
                    }
                }
                Err(e)
            }
        }
    }

    pub fn target(&self) -> u64 {
        self.target
    }

    /// Address of the trampoline that replays the displaced prologue and
    /// resumes the target. Zero once the hook is gone.
    pub fn trampoline(&self) -> u64 {
        with_info(self.target, |info| info.trampoline_addr()).unwrap_or(0)
    }

    /// The address this entry's detour should call to invoke "the
    /// original": the next entry in the chain, or the trampoline at the
    /// tail. Re-read this after chain mutations; uninstalling a later
    /// entry rewires it.
    pub fn original(&self) -> u64 {
        with_info(self.target, |info| {
            info.chain
                .iter()
                .find(|e| e.id == self.id)
                .map(|e| e.call_next)
                .unwrap_or(0)
        })
        .unwrap_or(0)
    }

    pub fn is_enabled(&self) -> bool {
        with_info(self.target, |info| {
            info.chain
                .iter()
                .find(|e| e.id == self.id)
                .map(|e| e.enabled)
                .unwrap_or(false)
        })
        .unwrap_or(false)
    }

    /// Swap this entry's callback. The preceding chain entry reaches this
    /// one through its `call_next`, so that pointer is rewired in the same
    /// step; when the live head is affected, the detour stub is redirected
    /// on the spot.
    pub fn set_detour(&mut self, detour: u64) {
        self.callback = detour;
        let id = self.id;
        let _ = with_info(self.target, |info| {
            let Some(pos) = info.chain.iter().position(|e| e.id == id) else {
                return;
            };
            info.chain[pos].callback = detour;
            if pos > 0 {
                info.chain[pos - 1].call_next = detour;
            }
            let live_head = info.first_enabled().map(|e| e.id);
            let touches_head = live_head == Some(id)
                || (pos > 0 && live_head == Some(info.chain[pos - 1].id));
            if touches_head {
                if let Err(e) = commit(info) {
                    warn!("set_detour commit failed: {e}");
                }
            }
        });
    }

    pub fn enable(&mut self) -> bool {
        self.flip(true)
    }

    pub fn disable(&mut self) -> bool {
        self.flip(false)
    }

    fn flip(&mut self, on: bool) -> bool {
        let id = self.id;
        with_info(self.target, |info| {
            let Some(entry) = info.chain.iter_mut().find(|e| e.id == id) else {
                return false;
            };
            if entry.enabled == on || (on && entry.callback == 0) {
                return false;
            }
            entry.enabled = on;
            match commit(info) {
                Ok(()) => true,
                Err(e) => {
                    warn!("enable/disable commit failed: {e}");
                    false
                }
            }
        })
        .unwrap_or(false)
    }

    /// Remove this entry; restores the original bytes and frees the
    /// mappings when it was the last one.
    pub fn uninstall(mut self) {
        self.detach();
    }

    fn detach(&mut self) {
        if self.target != 0 {
            uninstall_entry(self.target, self.id);
            self.target = 0;
        }
    }
}

impl Drop for InlineHook {
    fn drop(&mut self) {
        self.detach();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_target_is_rejected() {
        assert!(matches!(
            InlineHook::install(0, 0x1000, true),
            Err(HookError::InvalidArgument(_))
        ));
    }

    #[test]
    fn misaligned_target_is_rejected() {
        assert!(matches!(
            InlineHook::install(0x1001, 0x2000, true),
            Err(HookError::InvalidArgument(_))
        ));
    }

    #[test]
    fn null_detour_with_enable_now_is_rejected() {
        assert!(matches!(
            InlineHook::install(0x4000, 0, true),
            Err(HookError::InvalidArgument(_))
        ));
    }

    #[cfg(target_arch = "aarch64")]
    mod on_target {
        use super::super::*;
        use crate::lock_hook_tests;
        use core::sync::atomic::{AtomicU64, Ordering};

        type BinFn = extern "C" fn(i64, i64) -> i64;

        fn call_at(addr: u64) -> BinFn {
            unsafe { core::mem::transmute(addr as usize) }
        }

        /// `f(a, b) = a + b`, with a realistic frame prologue and enough
        /// padding to relocate any patch size.
        fn make_add_pair() -> (ExecBlock, u64) {
            let block = alloc_anywhere(64).unwrap();
            let mut buf = CodeBuf::new(block.addr());
            buf.emit_raw(0xA9BF_7BFD); // stp x29, x30, [sp, #-16]!
            buf.emit_raw(0x9100_03FD); // mov x29, sp
            buf.add_reg(Reg::X0, Reg::X0, Reg::X1);
            buf.emit_raw(0xA8C1_7BFD); // ldp x29, x30, [sp], #16
            buf.ret();
            for _ in 0..4 {
                buf.nop();
            }
            unsafe { block.write_code(0, &buf.to_bytes()) };
            let addr = block.addr();
            (block, addr)
        }

        fn read_prologue(addr: u64) -> [u8; 24] {
            let mut bytes = [0u8; 24];
            unsafe { mem::read(addr, &mut bytes) };
            bytes
        }

        static ADD_TEN_NEXT: AtomicU64 = AtomicU64::new(0);
        extern "C" fn add_ten_detour(a: i64, b: i64) -> i64 {
            let next = call_at(ADD_TEN_NEXT.load(Ordering::SeqCst));
            next(a, b) + 10
        }

        static DOUBLE_NEXT: AtomicU64 = AtomicU64::new(0);
        extern "C" fn double_detour(a: i64, b: i64) -> i64 {
            let next = call_at(DOUBLE_NEXT.load(Ordering::SeqCst));
            next(a, b) * 2
        }

        static ADD_HUNDRED_NEXT: AtomicU64 = AtomicU64::new(0);
        extern "C" fn add_hundred_detour(a: i64, b: i64) -> i64 {
            let next = call_at(ADD_HUNDRED_NEXT.load(Ordering::SeqCst));
            next(a, b) + 100
        }

        extern "C" fn constant_detour(_a: i64, _b: i64) -> i64 {
            100
        }

        #[test]
        fn simple_hook_detours_and_restores() {
            let _g = lock_hook_tests();
            let (_mem, target) = make_add_pair();
            let f = call_at(target);
            assert_eq!(f(5, 3), 8);

            let before = read_prologue(target);
            let hook =
                InlineHook::install(target, add_ten_detour as usize as u64, true).unwrap();
            ADD_TEN_NEXT.store(hook.original(), Ordering::SeqCst);
            assert_ne!(read_prologue(target), before, "prologue must be patched");

            let f = std::hint::black_box(f);
            assert_eq!(f(5, 3), 18);

            hook.uninstall();
            assert_eq!(read_prologue(target), before, "bytes restored bit-identical");
            let f = std::hint::black_box(f);
            assert_eq!(f(5, 3), 8);
        }

        #[test]
        fn trampoline_preserves_original_behavior() {
            let _g = lock_hook_tests();
            let (_mem, target) = make_add_pair();
            let hook =
                InlineHook::install(target, constant_detour as usize as u64, true).unwrap();

            let f = std::hint::black_box(call_at(target));
            assert_eq!(f(1, 2), 100, "calls go to the detour");

            let orig = call_at(hook.trampoline());
            let orig = std::hint::black_box(orig);
            assert_eq!(orig(1, 2), 3, "trampoline runs the original");

            hook.uninstall();
        }

        #[test]
        fn chained_hooks_compose_and_unwind_in_order() {
            let _g = lock_hook_tests();
            let (_mem, target) = make_add_pair();
            let f = call_at(target);

            let h1 = InlineHook::install(target, add_ten_detour as usize as u64, true).unwrap();
            ADD_TEN_NEXT.store(h1.original(), Ordering::SeqCst);
            let f = std::hint::black_box(f);
            assert_eq!(f(10, 2), 22);

            let h2 = InlineHook::install(target, double_detour as usize as u64, true).unwrap();
            DOUBLE_NEXT.store(h2.original(), Ordering::SeqCst);
            // double -> add_ten -> original: ((10 + 2) + 10) * 2
            let f = std::hint::black_box(f);
            assert_eq!(f(10, 2), 44);
            assert_eq!(
                DOUBLE_NEXT.load(Ordering::SeqCst),
                add_ten_detour as usize as u64,
                "second hook's original is the first hook's callback"
            );

            h2.uninstall();
            let f = std::hint::black_box(f);
            assert_eq!(f(10, 2), 22);

            h1.uninstall();
            let f = std::hint::black_box(f);
            assert_eq!(f(10, 2), 12);
        }

        #[test]
        fn chained_hooks_unwind_in_reverse_order_too() {
            let _g = lock_hook_tests();
            let (_mem, target) = make_add_pair();
            let before = read_prologue(target);
            let f = call_at(target);

            let h1 = InlineHook::install(target, add_ten_detour as usize as u64, true).unwrap();
            ADD_TEN_NEXT.store(h1.original(), Ordering::SeqCst);
            let h2 = InlineHook::install(target, double_detour as usize as u64, true).unwrap();
            DOUBLE_NEXT.store(h2.original(), Ordering::SeqCst);

            // Remove the tail entry first: the head's call_next is rewired
            // to the trampoline.
            h1.uninstall();
            DOUBLE_NEXT.store(h2.original(), Ordering::SeqCst);
            let f = std::hint::black_box(f);
            assert_eq!(f(10, 2), 24, "double alone: (10 + 2) * 2");

            h2.uninstall();
            assert_eq!(read_prologue(target), before);
            let f = std::hint::black_box(f);
            assert_eq!(f(10, 2), 12);
        }

        #[test]
        fn adrp_add_head_relocates_exactly() {
            let _g = lock_hook_tests();
            let block = alloc_anywhere(64).unwrap();
            let mut buf = CodeBuf::new(block.addr());
            let page = (block.addr() & !0xFFF).wrapping_add(0x5000);
            buf.adrp(Reg::X0, page).unwrap();
            buf.add_imm(Reg::X0, Reg::X0, 0x25, false).unwrap();
            buf.ret();
            for _ in 0..5 {
                buf.nop();
            }
            unsafe { block.write_code(0, &buf.to_bytes()) };
            let target = block.addr();

            let f: extern "C" fn() -> u64 = unsafe { core::mem::transmute(target as usize) };
            assert_eq!(f(), page + 0x25);

            let hook =
                InlineHook::install(target, constant_detour as usize as u64, true).unwrap();
            let orig: extern "C" fn() -> u64 =
                unsafe { core::mem::transmute(hook.trampoline() as usize) };
            let orig = std::hint::black_box(orig);
            assert_eq!(orig(), page + 0x25, "relocated ADRP+ADD yields the exact address");
            hook.uninstall();
        }

        #[test]
        fn five_instruction_function_survives_hooking() {
            let _g = lock_hook_tests();
            let block = alloc_anywhere(32).unwrap();
            let mut buf = CodeBuf::new(block.addr());
            buf.add_imm(Reg::W0, Reg::W0, 5, false).unwrap(); // add w0, w0, #5
            buf.movz(Reg::W1, 2, 0).unwrap(); //                mov w1, #2
            buf.mul(Reg::W0, Reg::W0, Reg::W1); //              mul w0, w0, w1
            buf.nop();
            buf.ret();
            unsafe { block.write_code(0, &buf.to_bytes()) };
            let target = block.addr();

            let f: extern "C" fn(i64, i64) -> i64 = unsafe { core::mem::transmute(target as usize) };
            assert_eq!(f(20, 0), 50);

            let hook =
                InlineHook::install(target, add_ten_detour as usize as u64, true).unwrap();
            ADD_TEN_NEXT.store(hook.original(), Ordering::SeqCst);
            let f = std::hint::black_box(f);
            assert_eq!(f(20, 0), 60, "detour ran and the original completed");

            hook.uninstall();
            let f = std::hint::black_box(f);
            assert_eq!(f(20, 0), 50);
        }

        #[test]
        fn install_disabled_then_enable() {
            let _g = lock_hook_tests();
            let (_mem, target) = make_add_pair();
            let before = read_prologue(target);
            let f = call_at(target);

            let mut hook =
                InlineHook::install(target, constant_detour as usize as u64, false).unwrap();
            assert!(!hook.is_enabled());
            assert_eq!(read_prologue(target), before, "disabled install leaves bytes alone");
            assert_eq!(f(1, 2), 3);

            assert!(hook.enable());
            assert!(!hook.enable(), "double enable reports false");
            let f = std::hint::black_box(f);
            assert_eq!(f(1, 2), 100);

            assert!(hook.disable());
            assert!(!hook.disable(), "double disable reports false");
            assert_eq!(read_prologue(target), before);
            let f = std::hint::black_box(f);
            assert_eq!(f(1, 2), 3);

            hook.uninstall();
        }

        #[test]
        fn set_detour_redirects_live_head() {
            let _g = lock_hook_tests();
            let (_mem, target) = make_add_pair();
            let f = call_at(target);

            let mut hook =
                InlineHook::install(target, constant_detour as usize as u64, true).unwrap();
            let f = std::hint::black_box(f);
            assert_eq!(f(4, 4), 100);

            ADD_TEN_NEXT.store(hook.original(), Ordering::SeqCst);
            hook.set_detour(add_ten_detour as usize as u64);
            let f = std::hint::black_box(f);
            assert_eq!(f(4, 4), 18);

            hook.uninstall();
        }

        #[test]
        fn set_detour_on_tail_rewires_predecessor() {
            let _g = lock_hook_tests();
            let (_mem, target) = make_add_pair();
            let f = call_at(target);

            let mut h1 =
                InlineHook::install(target, add_ten_detour as usize as u64, true).unwrap();
            ADD_TEN_NEXT.store(h1.original(), Ordering::SeqCst);
            let h2 = InlineHook::install(target, double_detour as usize as u64, true).unwrap();
            DOUBLE_NEXT.store(h2.original(), Ordering::SeqCst);
            let f = std::hint::black_box(f);
            assert_eq!(f(10, 2), 44);

            // Swap the tail entry's callback: the head entry must now
            // reach the new one through its call_next.
            ADD_HUNDRED_NEXT.store(h1.original(), Ordering::SeqCst);
            h1.set_detour(add_hundred_detour as usize as u64);
            assert_eq!(
                h2.original(),
                add_hundred_detour as usize as u64,
                "predecessor call_next must follow the swap"
            );
            DOUBLE_NEXT.store(h2.original(), Ordering::SeqCst);
            // double -> add_hundred -> original: ((10 + 2) + 100) * 2
            let f = std::hint::black_box(f);
            assert_eq!(f(10, 2), 224);

            h2.uninstall();
            let f = std::hint::black_box(f);
            assert_eq!(f(10, 2), 112, "swapped tail alone: (10 + 2) + 100");

            h1.uninstall();
            let f = std::hint::black_box(f);
            assert_eq!(f(10, 2), 12);
        }

        #[test]
        fn dropping_the_handle_unhooks() {
            let _g = lock_hook_tests();
            let (_mem, target) = make_add_pair();
            let before = read_prologue(target);
            {
                let _hook =
                    InlineHook::install(target, constant_detour as usize as u64, true).unwrap();
                assert_ne!(read_prologue(target), before);
            }
            assert_eq!(read_prologue(target), before);
        }

        #[test]
        fn install_uninstall_cycles_are_stable() {
            let _g = lock_hook_tests();
            let (_mem, target) = make_add_pair();
            let before = read_prologue(target);
            let f = call_at(target);

            for _ in 0..20 {
                let hook =
                    InlineHook::install(target, constant_detour as usize as u64, true).unwrap();
                let f = std::hint::black_box(f);
                assert_eq!(f(2, 3), 100);
                hook.uninstall();
                let f = std::hint::black_box(f);
                assert_eq!(f(2, 3), 5);
            }
            assert_eq!(read_prologue(target), before);
        }

        #[test]
        fn concurrent_callers_survive_install_and_uninstall() {
            use std::collections::HashSet;
            use std::sync::atomic::AtomicBool;
            use std::sync::Arc as StdArc;

            let _g = lock_hook_tests();
            let (_mem, target) = make_add_pair();

            let stop = StdArc::new(AtomicBool::new(false));
            let seen = StdArc::new(Mutex::new(HashSet::new()));
            let mut handles = Vec::new();
            for _ in 0..8 {
                let stop = stop.clone();
                let seen = seen.clone();
                handles.push(std::thread::spawn(move || {
                    let f = call_at(target);
                    while !stop.load(Ordering::Relaxed) {
                        let v = std::hint::black_box(f)(1, 2);
                        assert!(v == 3 || v == 100, "unexpected return value {v}");
                        seen.lock().unwrap().insert(v);
                    }
                }));
            }

            std::thread::sleep(std::time::Duration::from_millis(10));
            let hook =
                InlineHook::install(target, constant_detour as usize as u64, true).unwrap();
            std::thread::sleep(std::time::Duration::from_millis(50));
            hook.uninstall();
            std::thread::sleep(std::time::Duration::from_millis(10));
            stop.store(true, Ordering::Relaxed);
            for h in handles {
                h.join().expect("caller thread must not crash");
            }

            let seen = seen.lock().unwrap();
            assert!(seen.contains(&3), "unhooked value must appear");
            assert!(seen.contains(&100), "hooked value must appear");
        }
    }
}
