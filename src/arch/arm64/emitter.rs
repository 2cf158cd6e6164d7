//! A64 instruction emission.
//!
//! [`CodeBuf`] is an append-only sequence of 32-bit words with a logical
//! base address; every PC-relative operation computes its displacement
//! against the buffer's current address at the moment of emission. Each
//! operation validates its operands against the architectural encoding
//! constraints before anything is appended, so a failed emission leaves
//! the buffer untouched.

use crate::arch::arm64::insn::AddrMode;
use crate::arch::arm64::reg::{Cond, Reg};
use crate::error::EncodingError;

type Result<T> = core::result::Result<T, EncodingError>;

/// MOVZ/MOVK x4 + BR.
pub const ABS_JUMP_SIZE: usize = 20;
/// STP + MOVZ/MOVK x4 + BLR + LDP.
pub const ABS_CALL_SIZE: usize = 28;

const NOP_WORD: u32 = 0xD503_201F;
const RET_WORD: u32 = 0xD65F_03C0;

#[derive(Debug)]
pub struct CodeBuf {
    words: Vec<u32>,
    base: u64,
}

impl CodeBuf {
    pub fn new(base: u64) -> CodeBuf {
        CodeBuf {
            words: Vec::new(),
            base,
        }
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    /// The address the next emitted instruction will occupy.
    pub fn pc(&self) -> u64 {
        self.base + (self.words.len() as u64) * 4
    }

    pub fn len_bytes(&self) -> usize {
        self.words.len() * 4
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    pub fn words(&self) -> &[u32] {
        &self.words
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len_bytes());
        for w in &self.words {
            out.extend_from_slice(&w.to_le_bytes());
        }
        out
    }

    fn emit(&mut self, word: u32) {
        self.words.push(word);
    }

    /// Append a raw, pre-encoded word (used when relocating verbatim).
    pub fn emit_raw(&mut self, word: u32) {
        self.emit(word);
    }

    // --- Branches ---

    pub fn nop(&mut self) {
        self.emit(NOP_WORD);
    }

    pub fn ret(&mut self) {
        self.emit(RET_WORD);
    }

    pub fn br(&mut self, rn: Reg) {
        self.emit(0xD61F_0000 | (rn.index() << 5));
    }

    pub fn blr(&mut self, rn: Reg) {
        self.emit(0xD63F_0000 | (rn.index() << 5));
    }

    pub fn b(&mut self, target: u64) -> Result<()> {
        let imm26 = branch_offset("b", target, self.pc(), 26)?;
        self.emit(0x1400_0000 | imm26);
        Ok(())
    }

    pub fn bl(&mut self, target: u64) -> Result<()> {
        let imm26 = branch_offset("bl", target, self.pc(), 26)?;
        self.emit(0x9400_0000 | imm26);
        Ok(())
    }

    pub fn b_cond(&mut self, cond: Cond, target: u64) -> Result<()> {
        let imm19 = branch_offset("b.cond", target, self.pc(), 19)?;
        self.emit(0x5400_0000 | (imm19 << 5) | cond.bits());
        Ok(())
    }

    pub fn cbz(&mut self, rt: Reg, target: u64) -> Result<()> {
        let imm19 = branch_offset("cbz", target, self.pc(), 19)?;
        self.emit((rt.sf() << 31) | 0x3400_0000 | (imm19 << 5) | rt.index());
        Ok(())
    }

    pub fn cbnz(&mut self, rt: Reg, target: u64) -> Result<()> {
        let imm19 = branch_offset("cbnz", target, self.pc(), 19)?;
        self.emit((rt.sf() << 31) | 0x3500_0000 | (imm19 << 5) | rt.index());
        Ok(())
    }

    pub fn tbz(&mut self, rt: Reg, bit: u32, target: u64) -> Result<()> {
        self.tb("tbz", 0x3600_0000, rt, bit, target)
    }

    pub fn tbnz(&mut self, rt: Reg, bit: u32, target: u64) -> Result<()> {
        self.tb("tbnz", 0x3700_0000, rt, bit, target)
    }

    fn tb(&mut self, insn: &'static str, base: u32, rt: Reg, bit: u32, target: u64) -> Result<()> {
        let limit = if rt.is_w() { 32 } else { 64 };
        if bit >= limit {
            return Err(EncodingError::OutOfRange { insn });
        }
        let imm14 = branch_offset(insn, target, self.pc(), 14)?;
        let b5 = (bit >> 5) & 1;
        let b40 = bit & 0x1F;
        self.emit(base | (b5 << 31) | (b40 << 19) | (imm14 << 5) | rt.index());
        Ok(())
    }

    // --- PC-relative address formation ---

    pub fn adr(&mut self, rd: Reg, target: u64) -> Result<()> {
        let offset = target.wrapping_sub(self.pc()) as i64;
        if !(-(1 << 20)..(1 << 20)).contains(&offset) {
            return Err(EncodingError::OutOfRange { insn: "adr" });
        }
        let immlo = (offset as u32) & 0x3;
        let immhi = ((offset >> 2) as u32) & 0x7FFFF;
        self.emit(0x1000_0000 | (immlo << 29) | (immhi << 5) | rd.index());
        Ok(())
    }

    pub fn adrp(&mut self, rd: Reg, target: u64) -> Result<()> {
        let page_off = ((target & !0xFFF) as i64 - (self.pc() & !0xFFF) as i64) >> 12;
        if !(-(1 << 20)..(1 << 20)).contains(&page_off) {
            return Err(EncodingError::OutOfRange { insn: "adrp" });
        }
        let immlo = (page_off as u32) & 0x3;
        let immhi = ((page_off >> 2) as u32) & 0x7FFFF;
        self.emit(0x9000_0000 | (immlo << 29) | (immhi << 5) | rd.index());
        Ok(())
    }

    // --- Data processing, immediate ---

    pub fn add_imm(&mut self, rd: Reg, rn: Reg, imm: u32, shift12: bool) -> Result<()> {
        self.addsub_imm("add", 0x1100_0000, rd, rn, imm, shift12)
    }

    pub fn sub_imm(&mut self, rd: Reg, rn: Reg, imm: u32, shift12: bool) -> Result<()> {
        self.addsub_imm("sub", 0x5100_0000, rd, rn, imm, shift12)
    }

    fn addsub_imm(
        &mut self,
        insn: &'static str,
        base: u32,
        rd: Reg,
        rn: Reg,
        imm: u32,
        shift12: bool,
    ) -> Result<()> {
        if imm > 0xFFF {
            return Err(EncodingError::OutOfRange { insn });
        }
        let sh = shift12 as u32;
        self.emit((rd.sf() << 31) | base | (sh << 22) | (imm << 10) | (rn.index() << 5) | rd.index());
        Ok(())
    }

    pub fn and_imm(&mut self, rd: Reg, rn: Reg, mask: u64) -> Result<()> {
        self.logical_imm(0x1200_0000, rd, rn, mask)
    }

    pub fn orr_imm(&mut self, rd: Reg, rn: Reg, mask: u64) -> Result<()> {
        self.logical_imm(0x3200_0000, rd, rn, mask)
    }

    pub fn eor_imm(&mut self, rd: Reg, rn: Reg, mask: u64) -> Result<()> {
        self.logical_imm(0x5200_0000, rd, rn, mask)
    }

    fn logical_imm(&mut self, base: u32, rd: Reg, rn: Reg, mask: u64) -> Result<()> {
        let is64 = !rd.is_w();
        let (n, immr, imms) =
            encode_logical_imm(mask, is64).ok_or(EncodingError::InvalidBitmask(mask))?;
        self.emit(
            (rd.sf() << 31)
                | base
                | (n << 22)
                | (immr << 16)
                | (imms << 10)
                | (rn.index() << 5)
                | rd.index(),
        );
        Ok(())
    }

    // --- Data processing, register ---

    pub fn add_reg(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.emit((rd.sf() << 31) | 0x0B00_0000 | (rm.index() << 16) | (rn.index() << 5) | rd.index());
    }

    pub fn sub_reg(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.emit((rd.sf() << 31) | 0x4B00_0000 | (rm.index() << 16) | (rn.index() << 5) | rd.index());
    }

    pub fn and_reg(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.emit((rd.sf() << 31) | 0x0A00_0000 | (rm.index() << 16) | (rn.index() << 5) | rd.index());
    }

    pub fn orr_reg(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.emit((rd.sf() << 31) | 0x2A00_0000 | (rm.index() << 16) | (rn.index() << 5) | rd.index());
    }

    pub fn eor_reg(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.emit((rd.sf() << 31) | 0x4A00_0000 | (rm.index() << 16) | (rn.index() << 5) | rd.index());
    }

    /// CMP is SUB into the zero register.
    pub fn cmp(&mut self, rn: Reg, rm: Reg) {
        let zr = if rn.is_w() { Reg::WZR } else { Reg::ZR };
        self.sub_reg(zr, rn, rm);
    }

    pub fn madd(&mut self, rd: Reg, rn: Reg, rm: Reg, ra: Reg) {
        self.emit(
            (rd.sf() << 31)
                | 0x1B00_0000
                | (rm.index() << 16)
                | (ra.index() << 10)
                | (rn.index() << 5)
                | rd.index(),
        );
    }

    /// MUL is MADD with a zero accumulator.
    pub fn mul(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        let zr = if rd.is_w() { Reg::WZR } else { Reg::ZR };
        self.madd(rd, rn, rm, zr);
    }

    // --- Move wide / register moves ---

    pub fn movz(&mut self, rd: Reg, imm16: u16, shift: u32) -> Result<()> {
        self.mov_wide("movz", 0x5280_0000, rd, imm16, shift)
    }

    pub fn movk(&mut self, rd: Reg, imm16: u16, shift: u32) -> Result<()> {
        self.mov_wide("movk", 0x7280_0000, rd, imm16, shift)
    }

    pub fn movn(&mut self, rd: Reg, imm16: u16, shift: u32) -> Result<()> {
        self.mov_wide("movn", 0x1280_0000, rd, imm16, shift)
    }

    fn mov_wide(
        &mut self,
        insn: &'static str,
        base: u32,
        rd: Reg,
        imm16: u16,
        shift: u32,
    ) -> Result<()> {
        let limit = if rd.is_w() { 32 } else { 64 };
        if shift % 16 != 0 || shift >= limit {
            return Err(EncodingError::OutOfRange { insn });
        }
        let hw = shift / 16;
        self.emit((rd.sf() << 31) | base | (hw << 21) | ((imm16 as u32) << 5) | rd.index());
        Ok(())
    }

    /// MOV between registers. For SP-involved moves the ORR alias would
    /// read the zero register, so those lower to `ADD rd, rn, #0`.
    pub fn mov_reg(&mut self, rd: Reg, rn: Reg) {
        if rd == Reg::SP || rn == Reg::SP || rd == Reg::WSP || rn == Reg::WSP {
            // Immediate 0 cannot overflow the field.
            let _ = self.add_imm(rd, rn, 0, false);
            return;
        }
        let zr = if rd.is_w() { Reg::WZR } else { Reg::ZR };
        self.orr_reg(rd, zr, rn);
    }

    /// Materialize a 64-bit constant with MOVZ plus MOVKs covering only the
    /// non-zero 16-bit chunks. Emits `MOVZ rd, #0` for zero.
    pub fn load_immediate(&mut self, rd: Reg, imm: u64) -> Result<()> {
        let limit = if rd.is_w() { 32 } else { 64 };
        let imm = if rd.is_w() { imm & 0xFFFF_FFFF } else { imm };
        let mut first = true;
        let mut shift = 0;
        while shift < limit {
            let chunk = ((imm >> shift) & 0xFFFF) as u16;
            if chunk != 0 {
                if first {
                    self.movz(rd, chunk, shift)?;
                    first = false;
                } else {
                    self.movk(rd, chunk, shift)?;
                }
            }
            shift += 16;
        }
        if first {
            self.movz(rd, 0, 0)?;
        }
        Ok(())
    }

    // --- Shifts (UBFM/SBFM aliases) ---

    pub fn lsl(&mut self, rd: Reg, rn: Reg, shift: u32) -> Result<()> {
        let size = if rd.is_w() { 32 } else { 64 };
        if shift >= size {
            return Err(EncodingError::OutOfRange { insn: "lsl" });
        }
        let immr = (size - shift) % size;
        let imms = size - 1 - shift;
        self.bitfield(0x5300_0000, rd, rn, immr, imms);
        Ok(())
    }

    pub fn lsr(&mut self, rd: Reg, rn: Reg, shift: u32) -> Result<()> {
        let size = if rd.is_w() { 32 } else { 64 };
        if shift >= size {
            return Err(EncodingError::OutOfRange { insn: "lsr" });
        }
        self.bitfield(0x5300_0000, rd, rn, shift, size - 1);
        Ok(())
    }

    pub fn asr(&mut self, rd: Reg, rn: Reg, shift: u32) -> Result<()> {
        let size = if rd.is_w() { 32 } else { 64 };
        if shift >= size {
            return Err(EncodingError::OutOfRange { insn: "asr" });
        }
        self.bitfield(0x1300_0000, rd, rn, shift, size - 1);
        Ok(())
    }

    fn bitfield(&mut self, base: u32, rd: Reg, rn: Reg, immr: u32, imms: u32) {
        let sf = rd.sf();
        // The N bit tracks sf for the canonical 32/64-bit forms.
        self.emit(
            (sf << 31)
                | (sf << 22)
                | base
                | (immr << 16)
                | (imms << 10)
                | (rn.index() << 5)
                | rd.index(),
        );
    }

    // --- Loads and stores ---

    /// Scaled unsigned-offset load, falling back to LDUR for offsets the
    /// scaled form cannot express.
    pub fn ldr(&mut self, rt: Reg, rn: Reg, offset: i32) -> Result<()> {
        self.ldst(true, rt, rn, offset)
    }

    pub fn str(&mut self, rt: Reg, rn: Reg, offset: i32) -> Result<()> {
        self.ldst(false, rt, rn, offset)
    }

    fn ldst(&mut self, load: bool, rt: Reg, rn: Reg, offset: i32) -> Result<()> {
        let (base, scale): (u32, u32) = match (load, rt) {
            (_, r) if r.is_w() => (if load { 0xB940_0000 } else { 0xB900_0000 }, 2),
            (_, r) if r.is_x() => (if load { 0xF940_0000 } else { 0xF900_0000 }, 3),
            (_, r) if r.is_s() => (if load { 0xBD40_0000 } else { 0xBD00_0000 }, 2),
            (_, r) if r.is_d() => (if load { 0xFD40_0000 } else { 0xFD00_0000 }, 3),
            (_, r) if r.is_q() => (if load { 0x3DC0_0000 } else { 0x3D80_0000 }, 4),
            _ => {
                return Err(EncodingError::InvalidOperand {
                    insn: if load { "ldr" } else { "str" },
                })
            }
        };
        let size = 1i64 << scale;
        if offset >= 0 && (offset as i64) < 4096 * size && (offset as i64) % size == 0 {
            let imm12 = ((offset as u32) >> scale) & 0xFFF;
            self.emit(base | (imm12 << 10) | (rn.index() << 5) | rt.index());
            Ok(())
        } else if rt.is_gpr() {
            if load {
                self.ldur(rt, rn, offset)
            } else {
                self.stur(rt, rn, offset)
            }
        } else {
            Err(EncodingError::OutOfRange {
                insn: if load { "ldr" } else { "str" },
            })
        }
    }

    pub fn ldur(&mut self, rt: Reg, rn: Reg, offset: i32) -> Result<()> {
        self.ldst_unscaled("ldur", 0x3840_0000, rt, rn, offset)
    }

    pub fn stur(&mut self, rt: Reg, rn: Reg, offset: i32) -> Result<()> {
        self.ldst_unscaled("stur", 0x3800_0000, rt, rn, offset)
    }

    fn ldst_unscaled(
        &mut self,
        insn: &'static str,
        base: u32,
        rt: Reg,
        rn: Reg,
        offset: i32,
    ) -> Result<()> {
        if !(-256..256).contains(&offset) {
            return Err(EncodingError::OutOfRange { insn });
        }
        let size: u32 = if rt.is_w() { 2 } else { 3 };
        let imm9 = (offset as u32) & 0x1FF;
        self.emit((size << 30) | base | (imm9 << 12) | (rn.index() << 5) | rt.index());
        Ok(())
    }

    pub fn ldp(&mut self, rt1: Reg, rt2: Reg, rn: Reg, offset: i32, mode: AddrMode) -> Result<()> {
        self.ldstp("ldp", 0x2840_0000, rt1, rt2, rn, offset, mode)
    }

    pub fn stp(&mut self, rt1: Reg, rt2: Reg, rn: Reg, offset: i32, mode: AddrMode) -> Result<()> {
        self.ldstp("stp", 0x2800_0000, rt1, rt2, rn, offset, mode)
    }

    fn ldstp(
        &mut self,
        insn: &'static str,
        base: u32,
        rt1: Reg,
        rt2: Reg,
        rn: Reg,
        offset: i32,
        mode: AddrMode,
    ) -> Result<()> {
        let (opc, scale): (u32, u32) = if rt1.is_w() { (0, 2) } else { (2, 3) };
        let unit = 1i64 << scale;
        if (offset as i64) < -64 * unit || (offset as i64) > 63 * unit || (offset as i64) % unit != 0
        {
            return Err(EncodingError::OutOfRange { insn });
        }
        let imm7 = ((offset >> scale) as u32) & 0x7F;
        let pw: u32 = match mode {
            AddrMode::PostIndex => 0b01,
            AddrMode::Offset => 0b10,
            AddrMode::PreIndex => 0b11,
        };
        self.emit(
            (opc << 30)
                | base
                | (pw << 23)
                | (imm7 << 15)
                | (rt2.index() << 10)
                | (rn.index() << 5)
                | rt1.index(),
        );
        Ok(())
    }

    pub fn ldr_literal(&mut self, rt: Reg, target: u64) -> Result<()> {
        let imm19 = branch_offset("ldr literal", target, self.pc(), 19)?;
        let opc: u32 = if rt.is_w() { 0 } else { 1 };
        self.emit((opc << 30) | 0x1800_0000 | (imm19 << 5) | rt.index());
        Ok(())
    }

    // --- Exclusive / ordered access ---

    pub fn ldxr(&mut self, rt: Reg, rn: Reg) {
        self.exclusive_load(0x085F_7C00, rt, rn);
    }

    pub fn ldaxr(&mut self, rt: Reg, rn: Reg) {
        self.exclusive_load(0x085F_FC00, rt, rn);
    }

    pub fn ldar(&mut self, rt: Reg, rn: Reg) {
        self.exclusive_load(0x08DF_7C00, rt, rn);
    }

    fn exclusive_load(&mut self, base: u32, rt: Reg, rn: Reg) {
        let size: u32 = if rt.is_w() { 2 } else { 3 };
        self.emit((size << 30) | base | (rn.index() << 5) | rt.index());
    }

    pub fn stxr(&mut self, rs: Reg, rt: Reg, rn: Reg) {
        self.exclusive_store(0x0800_7C00, rs, rt, rn);
    }

    pub fn stlxr(&mut self, rs: Reg, rt: Reg, rn: Reg) {
        self.exclusive_store(0x0800_FC00, rs, rt, rn);
    }

    fn exclusive_store(&mut self, base: u32, rs: Reg, rt: Reg, rn: Reg) {
        let size: u32 = if rt.is_w() { 2 } else { 3 };
        self.emit((size << 30) | base | (rs.index() << 16) | (rn.index() << 5) | rt.index());
    }

    pub fn stlr(&mut self, rt: Reg, rn: Reg) {
        let size: u32 = if rt.is_w() { 2 } else { 3 };
        self.emit((size << 30) | 0x089F_7C00 | (rn.index() << 5) | rt.index());
    }

    // --- Floating point ---

    pub fn fadd(&mut self, rd: Reg, rn: Reg, rm: Reg) -> Result<()> {
        self.fp_two_source("fadd", 0x1E20_2800, rd, rn, rm)
    }

    pub fn fsub(&mut self, rd: Reg, rn: Reg, rm: Reg) -> Result<()> {
        self.fp_two_source("fsub", 0x1E20_3800, rd, rn, rm)
    }

    pub fn fmul(&mut self, rd: Reg, rn: Reg, rm: Reg) -> Result<()> {
        self.fp_two_source("fmul", 0x1E20_0800, rd, rn, rm)
    }

    pub fn fdiv(&mut self, rd: Reg, rn: Reg, rm: Reg) -> Result<()> {
        self.fp_two_source("fdiv", 0x1E20_1800, rd, rn, rm)
    }

    fn fp_two_source(
        &mut self,
        insn: &'static str,
        base: u32,
        rd: Reg,
        rn: Reg,
        rm: Reg,
    ) -> Result<()> {
        let ty = fp_type(insn, rd)?;
        if (rd.is_s() != rn.is_s()) || (rd.is_s() != rm.is_s()) {
            return Err(EncodingError::InvalidOperand { insn });
        }
        self.emit(base | (ty << 22) | (rm.index() << 16) | (rn.index() << 5) | rd.index());
        Ok(())
    }

    /// FMOV between registers: FPR<->FPR of the same width, or GPR<->FPR of
    /// matching widths (W<->S, X<->D). Anything else has no encoding.
    pub fn fmov(&mut self, rd: Reg, rn: Reg) -> Result<()> {
        match (rd.is_fp(), rn.is_fp()) {
            (true, true) => {
                if (rd.is_s() && rn.is_s()) || (rd.is_d() && rn.is_d()) {
                    let ty = fp_type("fmov", rd)?;
                    self.emit(0x1E20_4000 | (ty << 22) | (rn.index() << 5) | rd.index());
                    Ok(())
                } else {
                    Err(EncodingError::UnsupportedFmov)
                }
            }
            (true, false) => {
                let op = if rd.is_d() && rn.is_x() {
                    0x9E67_0000
                } else if rd.is_s() && rn.is_w() {
                    0x1E27_0000
                } else {
                    return Err(EncodingError::UnsupportedFmov);
                };
                self.emit(op | (rn.index() << 5) | rd.index());
                Ok(())
            }
            (false, true) => {
                let op = if rd.is_x() && rn.is_d() {
                    0x9E66_0000
                } else if rd.is_w() && rn.is_s() {
                    0x1E26_0000
                } else {
                    return Err(EncodingError::UnsupportedFmov);
                };
                self.emit(op | (rn.index() << 5) | rd.index());
                Ok(())
            }
            (false, false) => {
                self.mov_reg(rd, rn);
                Ok(())
            }
        }
    }

    /// Materialize an FP immediate through the x16/w16 scratch register.
    pub fn fmov_imm(&mut self, rd: Reg, imm: f64) -> Result<()> {
        if rd.is_d() {
            self.load_immediate(Reg::X16, imm.to_bits())?;
            self.fmov(rd, Reg::X16)
        } else if rd.is_s() {
            self.load_immediate(Reg::W16, (imm as f32).to_bits() as u64)?;
            self.fmov(rd, Reg::W16)
        } else {
            Err(EncodingError::UnsupportedFmov)
        }
    }

    pub fn fcmp(&mut self, rn: Reg, rm: Reg) -> Result<()> {
        let ty = fp_type("fcmp", rn)?;
        if rn.is_s() != rm.is_s() {
            return Err(EncodingError::InvalidOperand { insn: "fcmp" });
        }
        self.emit(0x1E20_2000 | (ty << 22) | (rm.index() << 16) | (rn.index() << 5));
        Ok(())
    }

    pub fn fcmp_zero(&mut self, rn: Reg) -> Result<()> {
        let ty = fp_type("fcmp", rn)?;
        self.emit(0x1E20_2008 | (ty << 22) | (rn.index() << 5));
        Ok(())
    }

    pub fn scvtf(&mut self, rd: Reg, rn: Reg) -> Result<()> {
        let ty = fp_type("scvtf", rd)?;
        if !rn.is_gpr() {
            return Err(EncodingError::InvalidOperand { insn: "scvtf" });
        }
        self.emit(0x1E22_0000 | (rn.sf() << 31) | (ty << 22) | (rn.index() << 5) | rd.index());
        Ok(())
    }

    pub fn fcvtzs(&mut self, rd: Reg, rn: Reg) -> Result<()> {
        let ty = fp_type("fcvtzs", rn)?;
        if !rd.is_gpr() {
            return Err(EncodingError::InvalidOperand { insn: "fcvtzs" });
        }
        self.emit(0x1E38_0000 | (rd.sf() << 31) | (ty << 22) | (rn.index() << 5) | rd.index());
        Ok(())
    }

    // --- System ---

    pub fn svc(&mut self, imm: u16) {
        self.emit(0xD400_0001 | ((imm as u32) << 5));
    }

    // --- Pseudo-operations ---

    /// MOVZ/MOVK x4 building `dest` in `scratch`, then BR. Always 20 bytes,
    /// regardless of the value, so callers can rely on the size.
    pub fn abs_jump(&mut self, dest: u64, scratch: Reg) {
        self.mov_abs64(scratch, dest);
        self.br(scratch);
    }

    /// Frame-preserving absolute call: push FP/LR, materialize, BLR, pop.
    /// Always 28 bytes.
    pub fn abs_call(&mut self, dest: u64, scratch: Reg) -> Result<()> {
        self.stp(Reg::FP, Reg::LR, Reg::SP, -16, AddrMode::PreIndex)?;
        self.mov_abs64(scratch, dest);
        self.blr(scratch);
        self.ldp(Reg::FP, Reg::LR, Reg::SP, 16, AddrMode::PostIndex)?;
        Ok(())
    }

    /// Unconditionally emit the full MOVZ + MOVK x3 sequence (fixed size).
    fn mov_abs64(&mut self, rd: Reg, value: u64) {
        let rdi = rd.index();
        for (hw, shift) in [(0u32, 0u32), (1, 16), (2, 32), (3, 48)] {
            let imm16 = ((value >> shift) & 0xFFFF) as u32;
            let base = if hw == 0 { 0xD280_0000 } else { 0xF280_0000 };
            self.emit(base | (hw << 21) | (imm16 << 5) | rdi);
        }
    }
}

fn fp_type(insn: &'static str, r: Reg) -> Result<u32> {
    if r.is_s() {
        Ok(0)
    } else if r.is_d() {
        Ok(1)
    } else {
        Err(EncodingError::InvalidOperand { insn })
    }
}

/// Word-scaled PC-relative displacement, checked against a `bits`-wide
/// signed field. Covers B/BL (26), B.cond/CBZ/CBNZ/LDR-literal (19,
/// +/-1 MiB) and TBZ/TBNZ (14, +/-32 KiB).
fn branch_offset(insn: &'static str, target: u64, pc: u64, bits: u32) -> Result<u32> {
    let offset = target.wrapping_sub(pc) as i64;
    if offset % 4 != 0 {
        return Err(EncodingError::OutOfRange { insn });
    }
    let words = offset >> 2;
    let limit = 1i64 << (bits - 1);
    if !(-limit..limit).contains(&words) {
        return Err(EncodingError::OutOfRange { insn });
    }
    Ok((words as u32) & ((1 << bits) - 1))
}

/// Find (N, immr, imms) such that the bitmask is a rotation of a repeating
/// run of ones at an element size in {2,4,8,16,32,64}. Returns `None` for
/// values with no logical-immediate encoding (notably 0 and all-ones).
fn encode_logical_imm(value: u64, is64: bool) -> Option<(u32, u32, u32)> {
    let width: u32 = if is64 { 64 } else { 32 };
    let value = if is64 { value } else { value & 0xFFFF_FFFF };
    if !is64 && value > 0xFFFF_FFFF {
        return None;
    }
    let all = if is64 { u64::MAX } else { 0xFFFF_FFFF };
    if value == 0 || value == all {
        return None;
    }

    // Shrink to the smallest repeating element.
    let mut esize = width;
    let mut elem = value;
    while esize > 2 {
        let half = esize / 2;
        let mask = (1u64 << half) - 1;
        if (elem >> half) == (elem & mask) {
            esize = half;
            elem &= mask;
        } else {
            break;
        }
    }

    // The element must be a rotation of a contiguous run of ones.
    let ones = elem.count_ones();
    if ones == 0 || ones == esize {
        return None;
    }
    let run = (1u64 << ones) - 1;
    let emask = if esize == 64 {
        u64::MAX
    } else {
        (1u64 << esize) - 1
    };
    let rol = |v: u64, r: u32| -> u64 {
        if r == 0 {
            v
        } else {
            ((v << r) | (v >> (esize - r))) & emask
        }
    };
    let immr = (0..esize).find(|&r| rol(elem, r) == run)?;

    let n = (esize == 64) as u32;
    let imms = (!(esize * 2 - 1) & 0x3F) | (ones - 1);
    Some((n, immr, imms))
}

/// Decode a logical-immediate (N, immr, imms) triple back to its bitmask.
/// Used by the decoder; `None` for reserved encodings.
pub(crate) fn decode_logical_imm(n: u32, immr: u32, imms: u32, is64: bool) -> Option<u64> {
    let len = (32 - ((n << 6 | (!imms & 0x3F)) as u32).leading_zeros()) as i32 - 1;
    if len < 1 {
        return None;
    }
    let esize = 1u32 << len;
    if !is64 && esize == 64 {
        return None;
    }
    let s = imms & (esize - 1);
    let r = immr & (esize - 1);
    if s == esize - 1 {
        return None;
    }
    let run = (1u128 << (s + 1)) - 1;
    let emask = if esize == 64 {
        u64::MAX
    } else {
        (1u64 << esize) - 1
    };
    // Rotate the run right by r within the element.
    let elem = if r == 0 {
        run as u64
    } else {
        (((run as u64) >> r) | ((run as u64) << (esize - r))) & emask
    };
    // Replicate across the register width.
    let width = if is64 { 64 } else { 32 };
    let mut out = 0u64;
    let mut shift = 0;
    while shift < width {
        out |= elem << shift;
        shift += esize;
    }
    Some(if is64 { out } else { out & 0xFFFF_FFFF })
}
