//! waylay: runtime function interception for AArch64 Linux/Android.
//!
//! The library patches live machine code to divert, inspect, or replace
//! existing functions at four interception points:
//!
//! - [`InlineHook`]: rewrite a function prologue so calls land in a user
//!   detour, with a trampoline that replays the displaced instructions and
//!   resumes the untouched remainder. Multiple hooks on one target form a
//!   chain; each detour reaches the next through its `original()` address.
//! - [`MidHook`]: intercept an arbitrary instruction, hand the saved
//!   register file to a callback, and continue the original stream with
//!   whatever the callback left in the context.
//! - [`VmtHook`]: swap function pointers in a C++-style virtual method
//!   table, with chained hooks over the same slot.
//! - [`PltHook`]: rewrite a module's Global Offset Table entry so every
//!   PLT-routed call to a named import lands in a replacement.
//!
//! Underneath sits an A64 encoder/decoder pair, a relocating trampoline
//! builder, a near-target executable allocator (so prologue patches can be
//! a single 4-byte branch), and a tear-free patch commit that runs inside
//! a stop-the-world window.
//!
//! Beyond the basics the engine handles the awkward cases: ADRP pairs
//! split across the hook boundary, conditional branches whose displaced
//! copy no longer reaches, targets too short for anything but the
//! smallest patch, and concurrent callers racing an install.

pub mod arch;
pub mod capi;
pub mod code;
pub mod elf;
pub mod error;
pub mod hooks;
pub mod maps;
pub mod mem;
pub mod threads;

pub use arch::arm64::decoder::{decode, decode_one};
pub use arch::arm64::emitter::CodeBuf;
pub use arch::arm64::insn::{Insn, InsnGroup, InsnId, Operand};
pub use arch::arm64::reg::{Cond, Reg};
pub use error::{EncodingError, HookError, Result};
pub use hooks::inline::InlineHook;
pub use hooks::mid::{CpuContext, MidHook, MidHookCallback};
pub use hooks::plt::PltHook;
pub use hooks::vmt::{VmSlotHook, VmtHook};

/// Process-global lock for tests that patch executable code.
///
/// Tests that rewrite live functions (inline, mid, PLT) must hold this to
/// keep concurrent patching of shared state from colliding.
#[cfg(test)]
pub(crate) fn lock_hook_tests() -> std::sync::MutexGuard<'static, ()> {
    use std::sync::{Mutex, OnceLock};
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|e| e.into_inner())
}
