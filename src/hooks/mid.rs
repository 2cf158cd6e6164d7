//! Mid-function hooks: intercept an arbitrary instruction, hand the saved
//! register file to a callback, then resume the original stream.
//!
//! Built on top of the inline engine: the hook is installed disabled to
//! obtain the trampoline, a spill/call/reload stub is JIT-emitted against
//! that trampoline, and only then is the stub wired in as the detour and
//! the hook enabled.

use crate::arch::arm64::emitter::CodeBuf;
use crate::arch::arm64::insn::AddrMode;
use crate::arch::arm64::reg::Reg;
use crate::code::allocator::{alloc_anywhere, ExecBlock};
use crate::error::{HookError, Result};
use crate::hooks::inline::InlineHook;

/// Saved general-purpose register file handed to mid-hook callbacks.
///
/// Slots 0..=29 are X0..X29, slot 30 is LR (X30), slot 31 is reserved
/// padding with no defined effect. Writes to slots 0..=30 are loaded back
/// into the registers when the callback returns.
///
/// Only the general-purpose file is saved; a callback that clobbers
/// V0..V31 corrupts its caller's floating-point state.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct CpuContext {
    pub regs: [u64; 32],
}

impl CpuContext {
    pub fn x(&self, n: usize) -> u64 {
        self.regs[n]
    }

    pub fn set_x(&mut self, n: usize, value: u64) {
        self.regs[n] = value;
    }

    pub fn lr(&self) -> u64 {
        self.regs[30]
    }

    pub fn set_lr(&mut self, value: u64) {
        self.regs[30] = value;
    }
}

const CONTEXT_SIZE: u32 = core::mem::size_of::<CpuContext>() as u32;

pub type MidHookCallback = extern "C" fn(&mut CpuContext);

/// Emit the detour stub: spill x0-x29 and LR below SP, pass the context
/// pointer in x0, call the callback, reload everything, tail-jump to the
/// trampoline.
fn emit_stub(callback: u64, trampoline: u64) -> Result<CodeBuf> {
    let mut buf = CodeBuf::new(0);
    buf.sub_imm(Reg::SP, Reg::SP, CONTEXT_SIZE, false)?;
    for i in (0..30).step_by(2) {
        buf.stp(
            Reg::x(i as u32),
            Reg::x(i as u32 + 1),
            Reg::SP,
            (i * 8) as i32,
            AddrMode::Offset,
        )?;
    }
    buf.str(Reg::LR, Reg::SP, 240)?;

    buf.mov_reg(Reg::X0, Reg::SP);
    buf.abs_call(callback, Reg::X16)?;

    for i in (0..30).step_by(2) {
        buf.ldp(
            Reg::x(i as u32),
            Reg::x(i as u32 + 1),
            Reg::SP,
            (i * 8) as i32,
            AddrMode::Offset,
        )?;
    }
    buf.ldr(Reg::LR, Reg::SP, 240)?;
    buf.add_imm(Reg::SP, Reg::SP, CONTEXT_SIZE, false)?;

    buf.abs_jump(trampoline, Reg::X16);
    Ok(buf)
}

/// A mid-function hook. Dropping uninstalls.
#[derive(Debug)]
pub struct MidHook {
    hook: InlineHook,
    // The JIT'd stub must outlive the inline hook that jumps into it; it
    // is retired (not unmapped) on teardown, since a caller can still be
    // inside it.
    stub: Option<ExecBlock>,
}

impl MidHook {
    /// Hook the instruction at `target` and invoke `callback` with the
    /// saved register file every time execution reaches it.
    pub fn install(target: u64, callback: MidHookCallback) -> Result<MidHook> {
        if target == 0 {
            return Err(HookError::InvalidArgument("null target"));
        }

        // Disabled install first: it builds the trampoline the stub
        // tail-jumps to without ever exposing a half-built detour.
        let mut hook = InlineHook::install(target, 0, false)?;
        let trampoline = hook.trampoline();
        if trampoline == 0 {
            return Err(HookError::AllocationFailed);
        }

        let code = emit_stub(callback as usize as u64, trampoline)?;
        let stub = alloc_anywhere(code.len_bytes())?;
        unsafe {
            stub.write_code(0, &code.to_bytes());
        }

        hook.set_detour(stub.addr());
        if !hook.enable() {
            return Err(HookError::InvalidArgument("mid hook could not be enabled"));
        }
        Ok(MidHook {
            hook,
            stub: Some(stub),
        })
    }

    pub fn target(&self) -> u64 {
        self.hook.target()
    }

    pub fn is_enabled(&self) -> bool {
        self.hook.is_enabled()
    }

    pub fn enable(&mut self) -> bool {
        self.hook.enable()
    }

    pub fn disable(&mut self) -> bool {
        self.hook.disable()
    }

    pub fn uninstall(self) {
        drop(self);
    }
}

impl Drop for MidHook {
    fn drop(&mut self) {
        if let Some(stub) = self.stub.take() {
            crate::code::allocator::retire(stub);
        }
        // The inline hook field detaches afterwards, restoring the target.
    }
}
