//! Trampoline synthesis: relocate the first K bytes of a target function
//! into a fresh buffer so they execute as if still at their original
//! address, then jump back to the first byte the patch did not cover.
//!
//! Every emitted sequence is position independent (absolute
//! materialization, no literal pools), so the code can be built at a
//! logical base of zero and copied into whatever block the allocator
//! returns.

use crate::arch::arm64::decoder::{decode, decode_one};
use crate::arch::arm64::emitter::{CodeBuf, ABS_JUMP_SIZE};
use crate::arch::arm64::insn::{AddrMode, Insn, InsnId};
use crate::arch::arm64::reg::{Cond, Reg};
use crate::error::{HookError, Result};
use crate::mem;

/// Upper bound on source instructions examined. The largest patch is 20
/// bytes (5 instructions), so this is ample slack for pair fusion.
pub const MAX_SOURCE_INSNS: usize = 20;

/// Conditional-branch islands are a fixed shape: the inverted short branch
/// hops over one absolute jump.
const ISLAND_SKIP: u64 = 4 + ABS_JUMP_SIZE as u64;

#[derive(Debug)]
pub struct Trampoline {
    words: Vec<u32>,
    backup_size: usize,
}

impl Trampoline {
    /// Relocated prefix plus the absolute-jump trailer.
    pub fn words(&self) -> &[u32] {
        &self.words
    }

    pub fn len_bytes(&self) -> usize {
        self.words.len() * 4
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len_bytes());
        for w in &self.words {
            out.extend_from_slice(&w.to_le_bytes());
        }
        out
    }

    /// Number of source bytes the caller must back up; the trailer resumes
    /// at `target + backup_size()`.
    pub fn backup_size(&self) -> usize {
        self.backup_size
    }
}

/// Build a trampoline for the function at `target`, relocating at least
/// `required` bytes. Reads the live process image.
///
/// # Safety
/// `target` must point into mapped code.
pub unsafe fn build(target: u64, required: usize) -> Result<Trampoline> {
    let span = match mem::find_region(target) {
        Some(region) => ((region.end - target) as usize).min(MAX_SOURCE_INSNS * 4),
        None => MAX_SOURCE_INSNS * 4,
    };
    let mut code = vec![0u8; span];
    mem::read(target, &mut code);

    let prev_word = match mem::find_region(target.wrapping_sub(4)) {
        Some(region) if region.contains(target.wrapping_sub(4)) => {
            let mut bytes = [0u8; 4];
            mem::read(target - 4, &mut bytes);
            Some(u32::from_le_bytes(bytes))
        }
        _ => None,
    };

    build_from(target, &code, prev_word, required)
}

/// Pure builder over a byte image of the target. `prev_word` is the
/// instruction immediately before the hook site, when mapped; it is
/// consulted for the case where relocation starts on the second half of an
/// ADRP pair.
pub fn build_from(
    target: u64,
    code: &[u8],
    prev_word: Option<u32>,
    required: usize,
) -> Result<Trampoline> {
    let insns = decode(target, code, MAX_SOURCE_INSNS);
    if insns.is_empty() {
        return Err(HookError::DecodeFailed { target });
    }

    let mut buf = CodeBuf::new(0);
    let mut backup = 0usize;
    let mut index = 0usize;

    while backup < required && index < insns.len() {
        let insn = &insns[index];
        let mut consumed = 1;

        if index == 0 && relocate_split_adrp_pair(&mut buf, insn, prev_word, target)? {
            // Consumed just the continuation instruction; the ADRP itself
            // stays, untouched, before the hook site.
        } else {
            match insn.id {
                InsnId::Adrp => {
                    consumed = relocate_adrp(&mut buf, insn, insns.get(index + 1))?;
                }
                InsnId::Adr => {
                    let value = operand_imm(insn, 1, target)?;
                    buf.load_immediate(reg_at(insn, 0, target)?, value as u64)?;
                }
                InsnId::LdrLit => {
                    let literal = operand_imm(insn, 1, target)?;
                    buf.load_immediate(Reg::X16, literal as u64)?;
                    buf.ldr(reg_at(insn, 0, target)?, Reg::X16, 0)?;
                }
                InsnId::B => {
                    let dest = operand_imm(insn, 0, target)?;
                    buf.load_immediate(Reg::X16, dest as u64)?;
                    buf.br(Reg::X16);
                }
                InsnId::Bl => {
                    let dest = operand_imm(insn, 0, target)?;
                    buf.load_immediate(Reg::X16, dest as u64)?;
                    buf.blr(Reg::X16);
                }
                InsnId::BCond => {
                    let dest = operand_imm(insn, 0, target)? as u64;
                    let cond = insn.cond.unwrap_or(Cond::Al);
                    if cond == Cond::Al || cond == Cond::Nv {
                        buf.abs_jump(dest, Reg::X16);
                    } else {
                        let resume = buf.pc() + ISLAND_SKIP;
                        buf.b_cond(cond.invert(), resume)?;
                        buf.abs_jump(dest, Reg::X16);
                    }
                }
                InsnId::Cbz | InsnId::Cbnz => {
                    let dest = operand_imm(insn, 1, target)? as u64;
                    // Invert the test and skip the absolute-jump island.
                    let mut word = insn.raw ^ (1 << 24);
                    word = (word & !0x00FF_FFE0) | (((ISLAND_SKIP as u32) / 4) << 5);
                    buf.emit_raw(word);
                    buf.abs_jump(dest, Reg::X16);
                }
                InsnId::Tbz | InsnId::Tbnz => {
                    let dest = operand_imm(insn, 2, target)? as u64;
                    let mut word = insn.raw ^ (1 << 24);
                    word = (word & !0x0007_FFE0) | (((ISLAND_SKIP as u32) / 4) << 5);
                    buf.emit_raw(word);
                    buf.abs_jump(dest, Reg::X16);
                }
                // Everything else is position independent; copy the word.
                _ => buf.emit_raw(insn.raw),
            }
        }

        backup += consumed * 4;
        index += consumed;
    }

    if backup < required {
        return Err(HookError::TargetTooShort { target, required });
    }

    buf.abs_jump(target + backup as u64, Reg::X16);
    Ok(Trampoline {
        words: buf.words().to_vec(),
        backup_size: backup,
    })
}

fn reg_at(insn: &Insn, n: usize, target: u64) -> Result<Reg> {
    insn.reg(n).ok_or(HookError::DecodeFailed { target })
}

fn operand_imm(insn: &Insn, n: usize, target: u64) -> Result<i64> {
    insn.imm(n).ok_or(HookError::DecodeFailed { target })
}

/// ADRP followed by the ADD / LDR / STR that completes the address: fold
/// both into an absolute materialization. Returns the number of source
/// instructions consumed.
fn relocate_adrp(buf: &mut CodeBuf, adrp: &Insn, next: Option<&Insn>) -> Result<usize> {
    let page = adrp.imm(1).unwrap_or(0) as u64;
    let adrp_rd = adrp.reg(0);

    if let Some(next) = next {
        if next.id == InsnId::Add {
            if let (Some(rd), Some(rn), Some(imm)) = (next.reg(0), next.reg(1), next.imm(2)) {
                if Some(rn) == adrp_rd {
                    buf.load_immediate(rd, page.wrapping_add(imm as u64))?;
                    return Ok(2);
                }
            }
        }
        if next.id == InsnId::Ldr || next.id == InsnId::Str {
            if let (Some(rt), Some(m)) = (next.reg(0), next.mem(1)) {
                if Some(m.base) == adrp_rd && m.index.is_none() && m.mode == AddrMode::Offset {
                    buf.load_immediate(Reg::X16, page.wrapping_add(m.disp as u64))?;
                    if next.id == InsnId::Ldr {
                        buf.ldr(rt, Reg::X16, 0)?;
                    } else {
                        buf.str(rt, Reg::X16, 0)?;
                    }
                    return Ok(2);
                }
            }
        }
    }

    // Unpaired: materialize the page base itself.
    if let Some(rd) = adrp_rd {
        buf.load_immediate(rd, page)?;
    }
    Ok(1)
}

/// The hook site can begin on the ADD/LDR/STR half of an ADRP pair whose
/// ADRP sits one instruction before the target. Copying the continuation
/// verbatim would recompute the address from a stale page register, so the
/// absolute address is reconstructed from the preceding ADRP instead.
fn relocate_split_adrp_pair(
    buf: &mut CodeBuf,
    first: &Insn,
    prev_word: Option<u32>,
    target: u64,
) -> Result<bool> {
    let Some(prev_word) = prev_word else {
        return Ok(false);
    };
    let prev = decode_one(target.wrapping_sub(4), prev_word);
    if prev.id != InsnId::Adrp {
        return Ok(false);
    }
    let page = prev.imm(1).unwrap_or(0) as u64;
    let adrp_rd = prev.reg(0);

    if first.id == InsnId::Add {
        if let (Some(rd), Some(rn), Some(imm)) = (first.reg(0), first.reg(1), first.imm(2)) {
            if Some(rn) == adrp_rd {
                buf.load_immediate(rd, page.wrapping_add(imm as u64))?;
                return Ok(true);
            }
        }
    }
    if first.id == InsnId::Ldr || first.id == InsnId::Str {
        if let (Some(rt), Some(m)) = (first.reg(0), first.mem(1)) {
            if Some(m.base) == adrp_rd && m.index.is_none() && m.mode == AddrMode::Offset {
                buf.load_immediate(Reg::X16, page.wrapping_add(m.disp as u64))?;
                if first.id == InsnId::Ldr {
                    buf.ldr(rt, Reg::X16, 0)?;
                } else {
                    buf.str(rt, Reg::X16, 0)?;
                }
                return Ok(true);
            }
        }
    }
    Ok(false)
}
