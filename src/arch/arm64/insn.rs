//! Decoded-instruction records.
//!
//! The decoder produces plain data: an enum-keyed id, a coarse group, and
//! typed operands. There is no dynamic dispatch anywhere on this side; a
//! consumer matches on `id`/`operands` and is done.

use crate::arch::arm64::reg::{Cond, Reg};

/// Symbolic instruction identity. `Invalid` is the sentinel for words the
/// decoder does not model; decoding never fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsnId {
    Nop,
    Ret,
    B,
    Bl,
    Br,
    Blr,
    BCond,
    Cbz,
    Cbnz,
    Tbz,
    Tbnz,
    Add,
    Adds,
    Sub,
    Subs,
    And,
    Ands,
    Orr,
    Eor,
    Mov,
    Movz,
    Movk,
    Movn,
    Adr,
    Adrp,
    Ldr,
    Str,
    LdrLit,
    Ldp,
    Stp,
    Ubfm,
    Sbfm,
    Fadd,
    Fsub,
    Fmul,
    Fdiv,
    Fmov,
    Fcmp,
    Scvtf,
    Fcvtzs,
    Ldxr,
    Stxr,
    Ldaxr,
    Stlxr,
    Ldar,
    Stlr,
    Svc,
    Invalid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsnGroup {
    Jump,
    DataProcessing,
    LoadStore,
    FloatSimd,
    System,
    Invalid,
}

/// Addressing mode of a memory operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddrMode {
    Offset,
    PreIndex,
    PostIndex,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemOperand {
    pub base: Reg,
    pub index: Option<Reg>,
    pub disp: i32,
    pub mode: AddrMode,
}

impl MemOperand {
    pub fn offset(base: Reg, disp: i32) -> MemOperand {
        MemOperand {
            base,
            index: None,
            disp,
            mode: AddrMode::Offset,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    Reg(Reg),
    /// For PC-relative instructions this is the resolved absolute target,
    /// never the raw displacement. For ADRP it is the computed page base.
    Imm(i64),
    Mem(MemOperand),
}

/// One decoded A64 instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Insn {
    pub address: u64,
    /// Always 4 on A64.
    pub size: usize,
    pub id: InsnId,
    pub group: InsnGroup,
    pub operands: Vec<Operand>,
    pub cond: Option<Cond>,
    pub is_pc_relative: bool,
    pub raw: u32,
}

impl Insn {
    pub(crate) fn invalid(address: u64, raw: u32) -> Insn {
        Insn {
            address,
            size: 4,
            id: InsnId::Invalid,
            group: InsnGroup::Invalid,
            operands: Vec::new(),
            cond: None,
            is_pc_relative: false,
            raw,
        }
    }

    /// The n-th operand as a register, if it is one.
    pub fn reg(&self, n: usize) -> Option<Reg> {
        match self.operands.get(n) {
            Some(Operand::Reg(r)) => Some(*r),
            _ => None,
        }
    }

    /// The n-th operand as an immediate, if it is one.
    pub fn imm(&self, n: usize) -> Option<i64> {
        match self.operands.get(n) {
            Some(Operand::Imm(v)) => Some(*v),
            _ => None,
        }
    }

    /// The n-th operand as a memory reference, if it is one.
    pub fn mem(&self, n: usize) -> Option<MemOperand> {
        match self.operands.get(n) {
            Some(Operand::Mem(m)) => Some(*m),
            _ => None,
        }
    }
}
