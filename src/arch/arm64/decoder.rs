//! A64 instruction decoding.
//!
//! Covers the subset needed to relocate function prologues safely:
//! branches, PC-relative address formation, the common load/store shapes,
//! move-wides, bitfields, logical and add/sub arithmetic, the scalar FP
//! operations, and exclusive/ordered accesses. Anything else decodes as
//! `Invalid`; decoding never fails.
//!
//! PC-relative operands are resolved to absolute targets. For ADRP the
//! operand is the computed page base (`(pc & !0xFFF) + (imm << 12)`), so a
//! caller pairing ADRP with a following ADD/LDR/STR only has to add the low
//! twelve bits.

use crate::arch::arm64::emitter::decode_logical_imm;
use crate::arch::arm64::insn::{AddrMode, Insn, InsnGroup, InsnId, MemOperand, Operand};
use crate::arch::arm64::reg::{Cond, Reg};

/// Decode up to `max_insns` instructions from `code`, which is mapped (or
/// logically located) at `address`.
pub fn decode(address: u64, code: &[u8], max_insns: usize) -> Vec<Insn> {
    let mut out = Vec::new();
    let mut offset = 0usize;
    while out.len() < max_insns && offset + 4 <= code.len() {
        let raw = u32::from_le_bytes([
            code[offset],
            code[offset + 1],
            code[offset + 2],
            code[offset + 3],
        ]);
        out.push(decode_one(address + offset as u64, raw));
        offset += 4;
    }
    out
}

fn sign_extend(value: i64, bits: u32) -> i64 {
    let shift = 64 - bits;
    (value << shift) >> shift
}

fn imm26_target(address: u64, raw: u32) -> i64 {
    let imm26 = sign_extend((raw & 0x03FF_FFFF) as i64, 26);
    address.wrapping_add((imm26 << 2) as u64) as i64
}

fn imm19_target(address: u64, raw: u32) -> i64 {
    let imm19 = sign_extend(((raw >> 5) & 0x7_FFFF) as i64, 19);
    address.wrapping_add((imm19 << 2) as u64) as i64
}

fn imm14_target(address: u64, raw: u32) -> i64 {
    let imm14 = sign_extend(((raw >> 5) & 0x3FFF) as i64, 14);
    address.wrapping_add((imm14 << 2) as u64) as i64
}

fn adr_imm(raw: u32) -> i64 {
    let immlo = ((raw >> 29) & 0x3) as i64;
    let immhi = ((raw >> 5) & 0x7_FFFF) as i64;
    sign_extend((immhi << 2) | immlo, 21)
}

fn rd(raw: u32) -> u32 {
    raw & 0x1F
}

fn rn(raw: u32) -> u32 {
    (raw >> 5) & 0x1F
}

fn rm(raw: u32) -> u32 {
    (raw >> 16) & 0x1F
}

fn fp_reg(n: u32, ty: u32) -> Reg {
    match ty {
        0 => Reg::s(n),
        1 => Reg::d(n),
        _ => Reg::q(n),
    }
}

struct Builder {
    insn: Insn,
}

impl Builder {
    fn new(address: u64, raw: u32, id: InsnId, group: InsnGroup) -> Builder {
        Builder {
            insn: Insn {
                address,
                size: 4,
                id,
                group,
                operands: Vec::new(),
                cond: None,
                is_pc_relative: false,
                raw,
            },
        }
    }

    fn reg(mut self, r: Reg) -> Builder {
        self.insn.operands.push(Operand::Reg(r));
        self
    }

    fn imm(mut self, v: i64) -> Builder {
        self.insn.operands.push(Operand::Imm(v));
        self
    }

    fn mem(mut self, m: MemOperand) -> Builder {
        self.insn.operands.push(Operand::Mem(m));
        self
    }

    fn cond(mut self, c: Cond) -> Builder {
        self.insn.cond = Some(c);
        self
    }

    fn pc_relative(mut self) -> Builder {
        self.insn.is_pc_relative = true;
        self
    }

    fn done(self) -> Insn {
        self.insn
    }
}

/// Decode a single word located at `address`.
pub fn decode_one(address: u64, raw: u32) -> Insn {
    use InsnGroup::*;
    use InsnId::*;

    if raw == 0xD503_201F {
        return Builder::new(address, raw, Nop, System).done();
    }
    if raw == 0xD65F_03C0 {
        return Builder::new(address, raw, Ret, Jump).done();
    }

    // B / BL
    match raw & 0xFC00_0000 {
        0x1400_0000 => {
            return Builder::new(address, raw, B, Jump)
                .pc_relative()
                .imm(imm26_target(address, raw))
                .done();
        }
        0x9400_0000 => {
            return Builder::new(address, raw, Bl, Jump)
                .pc_relative()
                .imm(imm26_target(address, raw))
                .done();
        }
        _ => {}
    }

    // BR / BLR
    if raw & 0xFFFF_FC1F == 0xD61F_0000 {
        return Builder::new(address, raw, Br, Jump).reg(Reg::x(rn(raw))).done();
    }
    if raw & 0xFFFF_FC1F == 0xD63F_0000 {
        return Builder::new(address, raw, Blr, Jump).reg(Reg::x(rn(raw))).done();
    }

    // B.cond
    if raw & 0xFF00_0010 == 0x5400_0000 {
        return Builder::new(address, raw, BCond, Jump)
            .pc_relative()
            .cond(Cond::from_bits(raw & 0xF))
            .imm(imm19_target(address, raw))
            .done();
    }

    // CBZ / CBNZ
    if raw & 0x7E00_0000 == 0x3400_0000 {
        let sf = (raw >> 31) & 1 == 1;
        let id = if (raw >> 24) & 1 == 1 { Cbnz } else { Cbz };
        return Builder::new(address, raw, id, Jump)
            .pc_relative()
            .reg(Reg::gpr(rd(raw), sf))
            .imm(imm19_target(address, raw))
            .done();
    }

    // TBZ / TBNZ
    if raw & 0x7E00_0000 == 0x3600_0000 {
        let id = if (raw >> 24) & 1 == 1 { Tbnz } else { Tbz };
        let bit = (((raw >> 31) & 1) << 5) | ((raw >> 19) & 0x1F);
        return Builder::new(address, raw, id, Jump)
            .pc_relative()
            .reg(Reg::x(rd(raw)))
            .imm(bit as i64)
            .imm(imm14_target(address, raw))
            .done();
    }

    // ADR / ADRP
    if raw & 0x9F00_0000 == 0x1000_0000 {
        let target = (address as i64).wrapping_add(adr_imm(raw));
        return Builder::new(address, raw, Adr, DataProcessing)
            .pc_relative()
            .reg(Reg::x(rd(raw)))
            .imm(target)
            .done();
    }
    if raw & 0x9F00_0000 == 0x9000_0000 {
        let page = ((address & !0xFFF) as i64).wrapping_add(adr_imm(raw) << 12);
        return Builder::new(address, raw, Adrp, DataProcessing)
            .pc_relative()
            .reg(Reg::x(rd(raw)))
            .imm(page)
            .done();
    }

    // LDR (literal), GPR and SIMD/FP forms.
    match raw & 0xFF00_0000 {
        0x1800_0000 | 0x5800_0000 => {
            let rt = Reg::gpr(rd(raw), raw & 0x4000_0000 != 0);
            return Builder::new(address, raw, LdrLit, LoadStore)
                .pc_relative()
                .reg(rt)
                .imm(imm19_target(address, raw))
                .done();
        }
        0x1C00_0000 | 0x5C00_0000 | 0x9C00_0000 => {
            let ty = match raw >> 24 {
                0x1C => 0,
                0x5C => 1,
                _ => 2,
            };
            return Builder::new(address, raw, LdrLit, LoadStore)
                .pc_relative()
                .reg(fp_reg(rd(raw), ty))
                .imm(imm19_target(address, raw))
                .done();
        }
        _ => {}
    }

    // Load/store exclusive and load-acquire/store-release.
    if raw & 0x3F00_0000 == 0x0800_0000 && (raw >> 21) & 1 == 0 {
        let size = raw >> 30;
        if size >= 2 {
            let is64 = size == 3;
            let load = (raw >> 22) & 1 == 1;
            let o2 = (raw >> 23) & 1 == 1;
            let o0 = (raw >> 15) & 1 == 1;
            let mem = MemOperand::offset(Reg::x(rn(raw)), 0);
            let rt = Reg::gpr(rd(raw), is64);
            let id = match (o2, load, o0) {
                (false, true, false) => Ldxr,
                (false, true, true) => Ldaxr,
                (false, false, false) => Stxr,
                (false, false, true) => Stlxr,
                (true, true, _) => Ldar,
                (true, false, _) => Stlr,
            };
            let b = Builder::new(address, raw, id, LoadStore);
            return match id {
                Stxr | Stlxr => b.reg(Reg::w(rm(raw))).reg(rt).mem(mem).done(),
                _ => b.reg(rt).mem(mem).done(),
            };
        }
    }

    // LDP / STP (GPR).
    if raw & 0x3E00_0000 == 0x2800_0000 {
        let is64 = raw >> 30 == 2;
        let load = (raw >> 22) & 1 == 1;
        let id = if load { Ldp } else { Stp };
        let imm7 = sign_extend(((raw >> 15) & 0x7F) as i64, 7);
        let scale = if is64 { 3 } else { 2 };
        let mode = match (raw >> 23) & 0x3 {
            0b01 => AddrMode::PostIndex,
            0b11 => AddrMode::PreIndex,
            _ => AddrMode::Offset,
        };
        let mem = MemOperand {
            base: Reg::x(rn(raw)),
            index: None,
            disp: (imm7 << scale) as i32,
            mode,
        };
        return Builder::new(address, raw, id, LoadStore)
            .reg(Reg::gpr(rd(raw), is64))
            .reg(Reg::gpr((raw >> 10) & 0x1F, is64))
            .mem(mem)
            .done();
    }

    // LDR/STR (unsigned immediate offset).
    if raw & 0x3B00_0000 == 0x3900_0000 {
        let size = raw >> 30;
        let simd = (raw >> 26) & 1 == 1;
        let opc = (raw >> 22) & 0x3;
        let (rt, load) = if simd {
            let ty = match (size, opc & 0x2) {
                (2, 0) => 0,
                (3, 0) => 1,
                _ => 2,
            };
            (fp_reg(rd(raw), ty), opc & 1 == 1)
        } else {
            (Reg::gpr(rd(raw), size == 3), opc & 1 == 1)
        };
        let scale = if simd && opc >= 2 { 4 } else { size };
        let disp = (((raw >> 10) & 0xFFF) << scale) as i32;
        let id = if load { Ldr } else { Str };
        return Builder::new(address, raw, id, LoadStore)
            .reg(rt)
            .mem(MemOperand::offset(Reg::x(rn(raw)), disp))
            .done();
    }

    // LDR/STR (register offset).
    if raw & 0x3B20_0C00 == 0x3820_0800 {
        let size = raw >> 30;
        let load = (raw >> 22) & 1 == 1;
        let id = if load { Ldr } else { Str };
        let mem = MemOperand {
            base: Reg::x(rn(raw)),
            index: Some(Reg::x(rm(raw))),
            disp: 0,
            mode: AddrMode::Offset,
        };
        return Builder::new(address, raw, id, LoadStore)
            .reg(Reg::gpr(rd(raw), size == 3))
            .mem(mem)
            .done();
    }

    // LDUR/STUR (unscaled immediate).
    if raw & 0x3B20_0C00 == 0x3800_0000 {
        let size = raw >> 30;
        if size >= 2 {
            let load = (raw >> 22) & 1 == 1;
            let id = if load { Ldr } else { Str };
            let disp = sign_extend(((raw >> 12) & 0x1FF) as i64, 9) as i32;
            return Builder::new(address, raw, id, LoadStore)
                .reg(Reg::gpr(rd(raw), size == 3))
                .mem(MemOperand::offset(Reg::x(rn(raw)), disp))
                .done();
        }
    }

    // ADD/SUB (immediate).
    if raw & 0x1F00_0000 == 0x1100_0000 {
        let sf = (raw >> 31) & 1 == 1;
        let op = (raw >> 30) & 1 == 1;
        let s = (raw >> 29) & 1 == 1;
        let id = match (op, s) {
            (false, false) => Add,
            (false, true) => Adds,
            (true, false) => Sub,
            (true, true) => Subs,
        };
        let imm12 = ((raw >> 10) & 0xFFF) as i64;
        let shifted = (raw >> 22) & 1 == 1;
        return Builder::new(address, raw, id, DataProcessing)
            .reg(Reg::gpr(rd(raw), sf))
            .reg(Reg::gpr(rn(raw), sf))
            .imm(if shifted { imm12 << 12 } else { imm12 })
            .done();
    }

    // Logical (shifted register), including the MOV alias of ORR.
    if raw & 0x1F00_0000 == 0x0A00_0000 {
        let sf = (raw >> 31) & 1 == 1;
        let opc = (raw >> 29) & 0x3;
        let neg = (raw >> 21) & 1 == 1;
        let shift = (raw >> 22) & 0x3;
        let imm6 = (raw >> 10) & 0x3F;
        if opc == 1 && !neg && rn(raw) == 31 && shift == 0 && imm6 == 0 {
            return Builder::new(address, raw, Mov, DataProcessing)
                .reg(Reg::gpr(rd(raw), sf))
                .reg(Reg::gpr(rm(raw), sf))
                .done();
        }
        let id = match opc {
            0 => And,
            1 => Orr,
            2 => Eor,
            _ => Ands,
        };
        return Builder::new(address, raw, id, DataProcessing)
            .reg(Reg::gpr(rd(raw), sf))
            .reg(Reg::gpr(rn(raw), sf))
            .reg(Reg::gpr(rm(raw), sf))
            .done();
    }

    // ADD/SUB (shifted register).
    if raw & 0x1F20_0000 == 0x0B00_0000 {
        let sf = (raw >> 31) & 1 == 1;
        let op = (raw >> 30) & 1 == 1;
        let s = (raw >> 29) & 1 == 1;
        let id = match (op, s) {
            (false, false) => Add,
            (false, true) => Adds,
            (true, false) => Sub,
            (true, true) => Subs,
        };
        return Builder::new(address, raw, id, DataProcessing)
            .reg(Reg::gpr(rd(raw), sf))
            .reg(Reg::gpr(rn(raw), sf))
            .reg(Reg::gpr(rm(raw), sf))
            .done();
    }

    // Move wide: MOVN / MOVZ / MOVK.
    if raw & 0x1F80_0000 == 0x1280_0000 {
        let sf = (raw >> 31) & 1 == 1;
        let id = match (raw >> 29) & 0x3 {
            0 => Movn,
            2 => Movz,
            3 => Movk,
            _ => InsnId::Invalid,
        };
        if id != InsnId::Invalid {
            let imm16 = ((raw >> 5) & 0xFFFF) as i64;
            let shift = (((raw >> 21) & 0x3) * 16) as i64;
            return Builder::new(address, raw, id, DataProcessing)
                .reg(Reg::gpr(rd(raw), sf))
                .imm(imm16)
                .imm(shift)
                .done();
        }
    }

    // Logical (immediate).
    if raw & 0x1F80_0000 == 0x1200_0000 {
        let sf = (raw >> 31) & 1 == 1;
        let id = match (raw >> 29) & 0x3 {
            0 => And,
            1 => Orr,
            2 => Eor,
            _ => Ands,
        };
        let n = (raw >> 22) & 1;
        let immr = (raw >> 16) & 0x3F;
        let imms = (raw >> 10) & 0x3F;
        let mask = decode_logical_imm(n, immr, imms, sf).unwrap_or(0);
        return Builder::new(address, raw, id, DataProcessing)
            .reg(Reg::gpr(rd(raw), sf))
            .reg(Reg::gpr(rn(raw), sf))
            .imm(mask as i64)
            .done();
    }

    // Bitfield moves: UBFM / SBFM.
    if raw & 0x7F80_0000 == 0x5300_0000 || raw & 0x7F80_0000 == 0x1300_0000 {
        let sf = (raw >> 31) & 1 == 1;
        let id = if raw & 0x4000_0000 != 0 { Ubfm } else { Sbfm };
        return Builder::new(address, raw, id, DataProcessing)
            .reg(Reg::gpr(rd(raw), sf))
            .reg(Reg::gpr(rn(raw), sf))
            .imm(((raw >> 16) & 0x3F) as i64)
            .imm(((raw >> 10) & 0x3F) as i64)
            .done();
    }

    // FMOV (register, FPR<->FPR).
    if raw & 0xFF3F_FC00 == 0x1E20_4000 {
        let ty = (raw >> 22) & 1;
        return Builder::new(address, raw, Fmov, FloatSimd)
            .reg(fp_reg(rd(raw), ty))
            .reg(fp_reg(rn(raw), ty))
            .done();
    }

    // FMOV (general: GPR<->FPR).
    if raw & 0xFFFF_FC00 == 0x9E67_0000 {
        return Builder::new(address, raw, Fmov, FloatSimd)
            .reg(Reg::d(rd(raw)))
            .reg(Reg::x(rn(raw)))
            .done();
    }
    if raw & 0xFFFF_FC00 == 0x9E66_0000 {
        return Builder::new(address, raw, Fmov, FloatSimd)
            .reg(Reg::x(rd(raw)))
            .reg(Reg::d(rn(raw)))
            .done();
    }
    if raw & 0xFFFF_FC00 == 0x1E27_0000 {
        return Builder::new(address, raw, Fmov, FloatSimd)
            .reg(Reg::s(rd(raw)))
            .reg(Reg::w(rn(raw)))
            .done();
    }
    if raw & 0xFFFF_FC00 == 0x1E26_0000 {
        return Builder::new(address, raw, Fmov, FloatSimd)
            .reg(Reg::w(rd(raw)))
            .reg(Reg::s(rn(raw)))
            .done();
    }

    // FCMP (register and zero forms).
    if raw & 0xFF20_FC1F == 0x1E20_2000 || raw & 0xFF20_FC1F == 0x1E20_2008 {
        let ty = (raw >> 22) & 1;
        let b = Builder::new(address, raw, Fcmp, FloatSimd).reg(fp_reg(rn(raw), ty));
        return if raw & 0x8 != 0 {
            b.imm(0).done()
        } else {
            b.reg(fp_reg(rm(raw), ty)).done()
        };
    }

    // SCVTF / FCVTZS (scalar, integer).
    if raw & 0x7FBF_FC00 == 0x1E22_0000 {
        let sf = (raw >> 31) & 1 == 1;
        let ty = (raw >> 22) & 1;
        return Builder::new(address, raw, Scvtf, FloatSimd)
            .reg(fp_reg(rd(raw), ty))
            .reg(Reg::gpr(rn(raw), sf))
            .done();
    }
    if raw & 0x7FBF_FC00 == 0x1E38_0000 {
        let sf = (raw >> 31) & 1 == 1;
        let ty = (raw >> 22) & 1;
        return Builder::new(address, raw, Fcvtzs, FloatSimd)
            .reg(Reg::gpr(rd(raw), sf))
            .reg(fp_reg(rn(raw), ty))
            .done();
    }

    // FP data-processing, two source: FADD/FSUB/FMUL/FDIV.
    if raw & 0xFF20_0C00 == 0x1E20_0800 {
        let ty = (raw >> 22) & 1;
        let id = match (raw >> 12) & 0xF {
            0b0000 => Fmul,
            0b0001 => Fdiv,
            0b0010 => Fadd,
            0b0011 => Fsub,
            _ => InsnId::Invalid,
        };
        if id != InsnId::Invalid {
            return Builder::new(address, raw, id, FloatSimd)
                .reg(fp_reg(rd(raw), ty))
                .reg(fp_reg(rn(raw), ty))
                .reg(fp_reg(rm(raw), ty))
                .done();
        }
    }

    // SVC.
    if raw & 0xFFE0_001F == 0xD400_0001 {
        return Builder::new(address, raw, Svc, System)
            .imm(((raw >> 5) & 0xFFFF) as i64)
            .done();
    }

    Insn::invalid(address, raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::arm64::emitter::CodeBuf;

    fn decode_word(address: u64, raw: u32) -> Insn {
        decode_one(address, raw)
    }

    #[test]
    fn decode_nop_and_ret() {
        let n = decode_word(0, 0xD503_201F);
        assert_eq!(n.id, InsnId::Nop);
        assert_eq!(n.group, InsnGroup::System);
        let r = decode_word(0, 0xD65F_03C0);
        assert_eq!(r.id, InsnId::Ret);
        assert_eq!(r.group, InsnGroup::Jump);
        assert_eq!(r.size, 4);
    }

    #[test]
    fn decode_b_resolves_absolute_target() {
        // B #-664 at 2048
        let i = decode_word(2048, 0x17FF_FF5A);
        assert_eq!(i.id, InsnId::B);
        assert!(i.is_pc_relative);
        assert_eq!(i.imm(0), Some(1384));
    }

    #[test]
    fn decode_bl() {
        let i = decode_word(0x1000, 0x9400_0010);
        assert_eq!(i.id, InsnId::Bl);
        assert_eq!(i.imm(0), Some(0x1040));
    }

    #[test]
    fn decode_br_blr() {
        let i = decode_word(0, 0xD61F_0200);
        assert_eq!(i.id, InsnId::Br);
        assert_eq!(i.reg(0), Some(Reg::X16));
        let i = decode_word(0, 0xD63F_0220);
        assert_eq!(i.id, InsnId::Blr);
        assert_eq!(i.reg(0), Some(Reg::X17));
    }

    #[test]
    fn decode_b_cond() {
        // B.LO +24
        let i = decode_word(2048, 0x5400_00C3);
        assert_eq!(i.id, InsnId::BCond);
        assert_eq!(i.cond, Some(Cond::Cc));
        assert_eq!(i.imm(0), Some(2072));
    }

    #[test]
    fn decode_cbz_cbnz() {
        let i = decode_word(2048, 0xB400_00C0);
        assert_eq!(i.id, InsnId::Cbz);
        assert_eq!(i.reg(0), Some(Reg::X0));
        assert_eq!(i.imm(1), Some(2072));
        let i = decode_word(0, 0x3500_0081);
        assert_eq!(i.id, InsnId::Cbnz);
        assert_eq!(i.reg(0), Some(Reg::W1));
    }

    #[test]
    fn decode_tbnz_bit_and_target() {
        // TBNZ W1, #9, +12
        let i = decode_word(2048, 0x3748_0061);
        assert_eq!(i.id, InsnId::Tbnz);
        assert_eq!(i.imm(1), Some(9));
        assert_eq!(i.imm(2), Some(2060));
    }

    #[test]
    fn decode_adr() {
        // ADR X1, #+5350 at 2048
        let i = decode_word(2048, 0x5000_A721);
        assert_eq!(i.id, InsnId::Adr);
        assert!(i.is_pc_relative);
        assert_eq!(i.reg(0), Some(Reg::X1));
        assert_eq!(i.imm(1), Some(2048 + 5350));
    }

    #[test]
    fn decode_adrp_leaves_page_base() {
        // ADRP X3, page +0x14E6 at 2048 (page 0)
        let i = decode_word(2048, 0xD000_A723);
        assert_eq!(i.id, InsnId::Adrp);
        assert_eq!(i.reg(0), Some(Reg::X3));
        assert_eq!(i.imm(1), Some(0x14E6_000));
    }

    #[test]
    fn decode_ldr_literal() {
        // LDR X16, [PC, #+8]
        let i = decode_word(2048, 0x5800_0050);
        assert_eq!(i.id, InsnId::LdrLit);
        assert_eq!(i.reg(0), Some(Reg::X16));
        assert_eq!(i.imm(1), Some(2056));
        // LDR W2, literal
        let i = decode_word(0, 0x1800_0042);
        assert_eq!(i.reg(0), Some(Reg::W2));
        // LDR D0, literal
        let i = decode_word(0, 0x5C00_0040);
        assert_eq!(i.reg(0), Some(Reg::D0));
    }

    #[test]
    fn decode_ldr_str_unsigned_offset() {
        let i = decode_word(0, 0xF940_0C20);
        assert_eq!(i.id, InsnId::Ldr);
        assert_eq!(i.reg(0), Some(Reg::X0));
        let m = i.mem(1).unwrap();
        assert_eq!(m.base, Reg::X1);
        assert_eq!(m.disp, 0x18);
        let i = decode_word(0, 0xB900_0862);
        assert_eq!(i.id, InsnId::Str);
        assert_eq!(i.reg(0), Some(Reg::W2));
        assert_eq!(i.mem(1).unwrap().disp, 8);
    }

    #[test]
    fn decode_ldur_negative_offset() {
        // LDUR X0, [X1, #-8]
        let i = decode_word(0, (3 << 30) | 0x3840_0000 | (0x1F8 << 12) | (1 << 5));
        assert_eq!(i.id, InsnId::Ldr);
        assert_eq!(i.mem(1).unwrap().disp, -8);
    }

    #[test]
    fn decode_ldr_register_offset() {
        // LDR X0, [X1, X2]
        let i = decode_word(0, 0xF862_6820);
        assert_eq!(i.id, InsnId::Ldr);
        let m = i.mem(1).unwrap();
        assert_eq!(m.base, Reg::X1);
        assert_eq!(m.index, Some(Reg::X2));
    }

    #[test]
    fn decode_stp_pre_index() {
        let i = decode_word(0, 0xA9BF_7BFD);
        assert_eq!(i.id, InsnId::Stp);
        assert_eq!(i.reg(0), Some(Reg::X29));
        assert_eq!(i.reg(1), Some(Reg::X30));
        let m = i.mem(2).unwrap();
        assert_eq!(m.disp, -16);
        assert_eq!(m.mode, AddrMode::PreIndex);
    }

    #[test]
    fn decode_ldp_post_index() {
        let i = decode_word(0, 0xA8C1_7BFD);
        assert_eq!(i.id, InsnId::Ldp);
        let m = i.mem(2).unwrap();
        assert_eq!(m.disp, 16);
        assert_eq!(m.mode, AddrMode::PostIndex);
    }

    #[test]
    fn decode_add_sub_imm() {
        // ADD X0, X1, #5
        let i = decode_word(0, 0x9100_1420);
        assert_eq!(i.id, InsnId::Add);
        assert_eq!(i.reg(0), Some(Reg::X0));
        assert_eq!(i.reg(1), Some(Reg::X1));
        assert_eq!(i.imm(2), Some(5));
        // SUBS W3, W4, #1 (shifted by 12)
        let i = decode_word(0, 0x7140_0483);
        assert_eq!(i.id, InsnId::Subs);
        assert_eq!(i.imm(2), Some(1 << 12));
    }

    #[test]
    fn decode_mov_alias() {
        // MOV X0, X1 == ORR X0, ZR, X1
        let i = decode_word(0, 0xAA01_03E0);
        assert_eq!(i.id, InsnId::Mov);
        assert_eq!(i.reg(0), Some(Reg::X0));
        assert_eq!(i.reg(1), Some(Reg::X1));
        // ORR with a shift is not a MOV.
        let i = decode_word(0, 0xAA01_07E0);
        assert_eq!(i.id, InsnId::Orr);
    }

    #[test]
    fn decode_move_wide() {
        // MOVZ X16, #0x568
        let i = decode_word(0, 0xD280_AD10);
        assert_eq!(i.id, InsnId::Movz);
        assert_eq!(i.reg(0), Some(Reg::X16));
        assert_eq!(i.imm(1), Some(0x568));
        assert_eq!(i.imm(2), Some(0));
        // MOVK X16, #0, LSL #32
        let i = decode_word(0, 0xF2C0_0010);
        assert_eq!(i.id, InsnId::Movk);
        assert_eq!(i.imm(2), Some(32));
        // MOVN X2, #0x10
        let i = decode_word(0, 0x9280_0202);
        assert_eq!(i.id, InsnId::Movn);
    }

    #[test]
    fn decode_logical_imm_mask() {
        // AND X0, X1, #0xFF
        let i = decode_word(0, 0x9240_1C20);
        assert_eq!(i.id, InsnId::And);
        assert_eq!(i.imm(2), Some(0xFF));
    }

    #[test]
    fn decode_bitfields() {
        // LSL X0, X1, #4 == UBFM X0, X1, #60, #59
        let i = decode_word(0, 0xD37C_EC20);
        assert_eq!(i.id, InsnId::Ubfm);
        assert_eq!(i.imm(2), Some(60));
        assert_eq!(i.imm(3), Some(59));
        // SBFM (ASR W4, W5, #3)
        let i = decode_word(0, 0x1300_0000 | (3 << 16) | (31 << 10) | (5 << 5) | 4);
        assert_eq!(i.id, InsnId::Sbfm);
    }

    #[test]
    fn decode_fp_two_source() {
        let i = decode_word(0, 0x1E62_2820);
        assert_eq!(i.id, InsnId::Fadd);
        assert_eq!(i.reg(0), Some(Reg::D0));
        assert_eq!(i.reg(1), Some(Reg::D1));
        assert_eq!(i.reg(2), Some(Reg::D2));
        let i = decode_word(0, 0x1E20_1800 | (5 << 16) | (4 << 5) | 3);
        assert_eq!(i.id, InsnId::Fdiv);
        assert_eq!(i.reg(0), Some(Reg::S3));
    }

    #[test]
    fn decode_fmov_variants() {
        let i = decode_word(0, 0x1E60_4020);
        assert_eq!(i.id, InsnId::Fmov);
        assert_eq!(i.reg(0), Some(Reg::D0));
        assert_eq!(i.reg(1), Some(Reg::D1));
        let i = decode_word(0, 0x9E67_0000 | (3 << 5) | 2);
        assert_eq!(i.reg(0), Some(Reg::D2));
        assert_eq!(i.reg(1), Some(Reg::X3));
        let i = decode_word(0, 0x1E26_0000 | (5 << 5) | 4);
        assert_eq!(i.reg(0), Some(Reg::W4));
        assert_eq!(i.reg(1), Some(Reg::S5));
    }

    #[test]
    fn decode_conversions() {
        let i = decode_word(0, 0x9E62_0020);
        assert_eq!(i.id, InsnId::Scvtf);
        assert_eq!(i.reg(0), Some(Reg::D0));
        assert_eq!(i.reg(1), Some(Reg::X1));
        let i = decode_word(0, 0x1E38_0000 | (3 << 5) | 2);
        assert_eq!(i.id, InsnId::Fcvtzs);
        assert_eq!(i.reg(0), Some(Reg::W2));
        assert_eq!(i.reg(1), Some(Reg::S3));
    }

    #[test]
    fn decode_fcmp() {
        let i = decode_word(0, 0x1E60_2020);
        assert_eq!(i.id, InsnId::Fcmp);
        assert_eq!(i.reg(0), Some(Reg::D1));
        assert_eq!(i.reg(1), Some(Reg::D0));
        let i = decode_word(0, 0x1E60_2028);
        assert_eq!(i.id, InsnId::Fcmp);
        assert_eq!(i.imm(1), Some(0));
    }

    #[test]
    fn decode_exclusive_access() {
        let i = decode_word(0, 0xC85F_7C20);
        assert_eq!(i.id, InsnId::Ldxr);
        assert_eq!(i.reg(0), Some(Reg::X0));
        let i = decode_word(0, 0xC802_7C01);
        assert_eq!(i.id, InsnId::Stxr);
        assert_eq!(i.reg(0), Some(Reg::W2));
        assert_eq!(i.reg(1), Some(Reg::X1));
        let i = decode_word(0, 0x885F_FC83);
        assert_eq!(i.id, InsnId::Ldaxr);
        let i = decode_word(0, 0xC802_FC01);
        assert_eq!(i.id, InsnId::Stlxr);
        let i = decode_word(0, 0xC8DF_7CC5);
        assert_eq!(i.id, InsnId::Ldar);
        let i = decode_word(0, 0xC89F_7D07);
        assert_eq!(i.id, InsnId::Stlr);
    }

    #[test]
    fn decode_svc() {
        let i = decode_word(0, 0xD400_0001);
        assert_eq!(i.id, InsnId::Svc);
        assert_eq!(i.imm(0), Some(0));
    }

    #[test]
    fn unknown_words_never_fail() {
        let i = decode_word(0x1234, 0xFFFF_FFFF);
        assert_eq!(i.id, InsnId::Invalid);
        assert_eq!(i.group, InsnGroup::Invalid);
        assert_eq!(i.raw, 0xFFFF_FFFF);
        let i = decode_word(0, 0x0000_0000);
        assert_eq!(i.id, InsnId::Invalid);
    }

    #[test]
    fn decode_stream_respects_count_and_length() {
        let words: [u32; 3] = [0xD503_201F, 0xD503_201F, 0xD65F_03C0];
        let mut bytes = Vec::new();
        for w in words {
            bytes.extend_from_slice(&w.to_le_bytes());
        }
        let insns = decode(0x1000, &bytes, 10);
        assert_eq!(insns.len(), 3);
        assert_eq!(insns[1].address, 0x1004);
        let insns = decode(0x1000, &bytes, 2);
        assert_eq!(insns.len(), 2);
        // A trailing partial word is ignored.
        let insns = decode(0x1000, &bytes[..6], 10);
        assert_eq!(insns.len(), 1);
    }

    /// Re-encoding a decoded record reproduces the original word.
    #[test]
    fn reencoding_decoded_words_reproduces_them() {
        let samples: &[(u64, u32)] = &[
            (2048, 0x17FF_FF5A),          // B #-664
            (2048, 0x5400_00C3),          // B.LO +24
            (2048, 0xB400_00C0),          // CBZ X0, +24
            (2048, 0x5000_A721),          // ADR X1, #+5350
            (0, 0xD280_AD10),             // MOVZ X16, #0x568
            (0, 0x9100_1420),             // ADD X0, X1, #5
            (0, 0xF940_0C20),             // LDR X0, [X1, #0x18]
            (0, 0x1E62_2820),             // FADD D0, D1, D2
        ];
        for &(addr, word) in samples {
            let i = decode_one(addr, word);
            let mut buf = CodeBuf::new(addr);
            match i.id {
                InsnId::B => buf.b(i.imm(0).unwrap() as u64).unwrap(),
                InsnId::BCond => buf
                    .b_cond(i.cond.unwrap(), i.imm(0).unwrap() as u64)
                    .unwrap(),
                InsnId::Cbz => buf.cbz(i.reg(0).unwrap(), i.imm(1).unwrap() as u64).unwrap(),
                InsnId::Adr => buf.adr(i.reg(0).unwrap(), i.imm(1).unwrap() as u64).unwrap(),
                InsnId::Movz => buf
                    .movz(
                        i.reg(0).unwrap(),
                        i.imm(1).unwrap() as u16,
                        i.imm(2).unwrap() as u32,
                    )
                    .unwrap(),
                InsnId::Add => buf
                    .add_imm(
                        i.reg(0).unwrap(),
                        i.reg(1).unwrap(),
                        i.imm(2).unwrap() as u32,
                        false,
                    )
                    .unwrap(),
                InsnId::Ldr => {
                    let m = i.mem(1).unwrap();
                    buf.ldr(i.reg(0).unwrap(), m.base, m.disp).unwrap();
                }
                InsnId::Fadd => buf
                    .fadd(i.reg(0).unwrap(), i.reg(1).unwrap(), i.reg(2).unwrap())
                    .unwrap(),
                other => panic!("unexpected id {other:?} for {word:#010x}"),
            }
            assert_eq!(buf.words()[0], word, "{word:#010x} did not round-trip");
        }
    }

    /// Everything the emitter produces decodes back to a matching record.
    #[test]
    fn emitter_decoder_round_trip() {
        let base = 0x10_0000u64;
        let mut buf = CodeBuf::new(base);
        buf.b(base + 0x40).unwrap();
        buf.bl(base.wrapping_sub(0x100)).unwrap();
        buf.cbz(Reg::X3, base + 0x80).unwrap();
        buf.adr(Reg::X2, base + 0x400).unwrap();
        buf.adrp(Reg::X4, base + 0x10_0000).unwrap();
        buf.add_imm(Reg::X0, Reg::X1, 42, false).unwrap();
        buf.ldr(Reg::X9, Reg::X10, 0x28).unwrap();
        buf.stp(Reg::X19, Reg::X20, Reg::SP, -32, AddrMode::PreIndex).unwrap();
        buf.movz(Reg::X7, 0xBEEF, 16).unwrap();
        buf.fadd(Reg::D1, Reg::D2, Reg::D3).unwrap();

        let insns = decode(base, &buf.to_bytes(), 32);
        let ids: Vec<InsnId> = insns.iter().map(|i| i.id).collect();
        assert_eq!(
            ids,
            vec![
                InsnId::B,
                InsnId::Bl,
                InsnId::Cbz,
                InsnId::Adr,
                InsnId::Adrp,
                InsnId::Add,
                InsnId::Ldr,
                InsnId::Stp,
                InsnId::Movz,
                InsnId::Fadd,
            ]
        );
        // PC-relative operands resolve to the encoded absolute targets.
        assert_eq!(insns[0].imm(0), Some((base + 0x40) as i64));
        assert_eq!(insns[1].imm(0), Some(base.wrapping_sub(0x100) as i64));
        assert_eq!(insns[2].imm(1), Some((base + 0x80) as i64));
        assert_eq!(insns[3].imm(1), Some((base + 0x400) as i64));
        assert_eq!(insns[4].imm(1), Some((base + 0x10_0000) as i64));
        assert_eq!(insns[5].imm(2), Some(42));
    }
}
