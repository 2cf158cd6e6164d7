//! In-memory ELF64 dynamic-symbol and PLT-relocation lookup.
//!
//! Operates directly on a loaded module image (no file I/O): walk the
//! program headers to `PT_DYNAMIC`, collect the dynamic-table pointers,
//! then resolve names through DT_GNU_HASH, DT_HASH, or a linear scan, in
//! that order. `STT_GNU_IFUNC` entries are resolved by invoking their
//! resolver.

use core::ffi::CStr;

use crate::error::{HookError, Result};
use log::debug;

const EI_NIDENT: usize = 16;
const EI_CLASS: usize = 4;
const ELFMAG: [u8; 4] = [0x7F, b'E', b'L', b'F'];
const ELFCLASS64: u8 = 2;

const PT_LOAD: u32 = 1;
const PT_DYNAMIC: u32 = 2;

const DT_NULL: i64 = 0;
const DT_PLTRELSZ: i64 = 2;
const DT_HASH: i64 = 4;
const DT_STRTAB: i64 = 5;
const DT_SYMTAB: i64 = 6;
const DT_RELA: i64 = 7;
const DT_REL: i64 = 17;
const DT_PLTREL: i64 = 20;
const DT_JMPREL: i64 = 23;
const DT_GNU_HASH: i64 = 0x6FFF_FEF5;

const SHN_UNDEF: u16 = 0;
const STT_GNU_IFUNC: u8 = 10;

const EM_AARCH64: u16 = 183;
const EM_X86_64: u16 = 62;

#[cfg(target_arch = "aarch64")]
const EXPECTED_MACHINE: u16 = EM_AARCH64;
#[cfg(target_arch = "x86_64")]
const EXPECTED_MACHINE: u16 = EM_X86_64;
#[cfg(not(any(target_arch = "aarch64", target_arch = "x86_64")))]
const EXPECTED_MACHINE: u16 = EM_AARCH64;

/// `R_AARCH64_JUMP_SLOT` (1026); the x86-64 equivalent keeps the module
/// testable on development hosts.
#[cfg(target_arch = "aarch64")]
const R_JUMP_SLOT: u32 = 1026;
#[cfg(target_arch = "x86_64")]
const R_JUMP_SLOT: u32 = 7;
#[cfg(not(any(target_arch = "aarch64", target_arch = "x86_64")))]
const R_JUMP_SLOT: u32 = 1026;

#[repr(C)]
struct Elf64Ehdr {
    e_ident: [u8; EI_NIDENT],
    e_type: u16,
    e_machine: u16,
    e_version: u32,
    e_entry: u64,
    e_phoff: u64,
    e_shoff: u64,
    e_flags: u32,
    e_ehsize: u16,
    e_phentsize: u16,
    e_phnum: u16,
    e_shentsize: u16,
    e_shnum: u16,
    e_shstrndx: u16,
}

#[repr(C)]
struct Elf64Phdr {
    p_type: u32,
    p_flags: u32,
    p_offset: u64,
    p_vaddr: u64,
    p_paddr: u64,
    p_filesz: u64,
    p_memsz: u64,
    p_align: u64,
}

#[repr(C)]
struct Elf64Dyn {
    d_tag: i64,
    d_un: u64,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct Elf64Sym {
    st_name: u32,
    st_info: u8,
    st_other: u8,
    st_shndx: u16,
    st_value: u64,
    st_size: u64,
}

#[repr(C)]
struct Elf64Rel {
    r_offset: u64,
    r_info: u64,
}

#[repr(C)]
struct Elf64Rela {
    r_offset: u64,
    r_info: u64,
    r_addend: i64,
}

fn r_sym(info: u64) -> u32 {
    (info >> 32) as u32
}

fn r_type(info: u64) -> u32 {
    (info & 0xFFFF_FFFF) as u32
}

fn sysv_hash(name: &[u8]) -> u32 {
    let mut h: u32 = 0;
    for &b in name {
        h = h.wrapping_shl(4).wrapping_add(b as u32);
        let g = h & 0xF000_0000;
        if g != 0 {
            h ^= g >> 24;
        }
        h &= !g;
    }
    h
}

fn gnu_hash(name: &[u8]) -> u32 {
    let mut h: u32 = 5381;
    for &b in name {
        h = h.wrapping_mul(33).wrapping_add(b as u32);
    }
    h
}

/// A parsed view over a loaded module. Pointer fields reference the live
/// image; the image must stay mapped for the lifetime of the value.
#[derive(Debug)]
pub struct ElfImage {
    base: u64,
    bias: u64,
    symtab: *const Elf64Sym,
    strtab: *const u8,
    // SysV hash table.
    bucket: *const u32,
    bucket_count: u32,
    chain: *const u32,
    chain_count: u32,
    // GNU hash table.
    gnu_bloom: *const u64,
    gnu_bloom_count: u32,
    gnu_bloom_shift: u32,
    gnu_bucket: *const u32,
    gnu_bucket_count: u32,
    gnu_chain: *const u32,
    gnu_symoffset: u32,
    // PLT relocations.
    jmprel: u64,
    jmprel_size: usize,
    jmprel_is_rela: bool,
}

unsafe impl Send for ElfImage {}

impl ElfImage {
    /// Parse the module loaded at `base` (its lowest mapping address).
    ///
    /// # Safety
    /// `base` must be the load address of a mapped ELF image that stays
    /// mapped for the lifetime of the returned value.
    pub unsafe fn from_base(base: u64) -> Result<ElfImage> {
        if base == 0 {
            return Err(HookError::InvalidArgument("null module base"));
        }
        let ehdr = &*(base as *const Elf64Ehdr);
        if ehdr.e_ident[..4] != ELFMAG {
            return Err(HookError::Parse("bad ELF magic"));
        }
        if ehdr.e_ident[EI_CLASS] != ELFCLASS64 {
            return Err(HookError::Parse("not an ELF64 image"));
        }
        if ehdr.e_machine != EXPECTED_MACHINE {
            return Err(HookError::Parse("foreign machine type"));
        }

        let phdrs = core::slice::from_raw_parts(
            (base + ehdr.e_phoff) as *const Elf64Phdr,
            ehdr.e_phnum as usize,
        );
        let min_load = phdrs
            .iter()
            .filter(|p| p.p_type == PT_LOAD)
            .map(|p| p.p_vaddr)
            .min()
            .ok_or(HookError::Parse("no PT_LOAD segment"))?;
        let bias = base.wrapping_sub(min_load);
        let dynamic = phdrs
            .iter()
            .find(|p| p.p_type == PT_DYNAMIC)
            .ok_or(HookError::Parse("no PT_DYNAMIC segment"))?;

        let mut image = ElfImage {
            base,
            bias,
            symtab: core::ptr::null(),
            strtab: core::ptr::null(),
            bucket: core::ptr::null(),
            bucket_count: 0,
            chain: core::ptr::null(),
            chain_count: 0,
            gnu_bloom: core::ptr::null(),
            gnu_bloom_count: 0,
            gnu_bloom_shift: 0,
            gnu_bucket: core::ptr::null(),
            gnu_bucket_count: 0,
            gnu_chain: core::ptr::null(),
            gnu_symoffset: 0,
            jmprel: 0,
            jmprel_size: 0,
            jmprel_is_rela: true,
        };

        let mut entry = (bias.wrapping_add(dynamic.p_vaddr)) as *const Elf64Dyn;
        while (*entry).d_tag != DT_NULL {
            let d = &*entry;
            match d.d_tag {
                DT_SYMTAB => image.symtab = image.rebase(d.d_un) as *const Elf64Sym,
                DT_STRTAB => image.strtab = image.rebase(d.d_un) as *const u8,
                DT_HASH => {
                    let table = image.rebase(d.d_un) as *const u32;
                    image.bucket_count = *table;
                    image.chain_count = *table.add(1);
                    image.bucket = table.add(2);
                    image.chain = table.add(2 + image.bucket_count as usize);
                }
                DT_GNU_HASH => {
                    let table = image.rebase(d.d_un) as *const u32;
                    image.gnu_bucket_count = *table;
                    image.gnu_symoffset = *table.add(1);
                    image.gnu_bloom_count = *table.add(2);
                    image.gnu_bloom_shift = *table.add(3);
                    image.gnu_bloom = table.add(4) as *const u64;
                    image.gnu_bucket = image.gnu_bloom.add(image.gnu_bloom_count as usize) as *const u32;
                    image.gnu_chain = image.gnu_bucket.add(image.gnu_bucket_count as usize);
                }
                DT_JMPREL => image.jmprel = image.rebase(d.d_un),
                DT_PLTRELSZ => image.jmprel_size = d.d_un as usize,
                DT_PLTREL => image.jmprel_is_rela = d.d_un as i64 == DT_RELA,
                _ => {}
            }
            entry = entry.add(1);
        }

        if image.symtab.is_null() || image.strtab.is_null() {
            return Err(HookError::Parse("no dynamic symbol table"));
        }
        Ok(image)
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    /// Dynamic-table pointer values are link-time vaddrs on most loaders
    /// but already-rebased absolute addresses on some; values below the
    /// load base get the bias applied.
    fn rebase(&self, value: u64) -> u64 {
        if value >= self.base {
            value
        } else {
            self.bias.wrapping_add(value)
        }
    }

    unsafe fn sym(&self, index: u32) -> &Elf64Sym {
        &*self.symtab.add(index as usize)
    }

    unsafe fn sym_name(&self, sym: &Elf64Sym) -> &[u8] {
        CStr::from_ptr(self.strtab.add(sym.st_name as usize) as *const libc::c_char).to_bytes()
    }

    fn sym_defined(sym: &Elf64Sym) -> bool {
        sym.st_shndx != SHN_UNDEF && sym.st_value != 0
    }

    unsafe fn gnu_lookup(&self, name: &[u8]) -> Option<u32> {
        if self.gnu_bucket.is_null() || self.gnu_bucket_count == 0 || self.gnu_bloom_count == 0 {
            return None;
        }
        let hash = gnu_hash(name);
        let word = *self.gnu_bloom.add(((hash / 64) % self.gnu_bloom_count) as usize);
        let mask: u64 =
            (1u64 << (hash % 64)) | (1u64 << ((hash >> self.gnu_bloom_shift) % 64));
        if word & mask != mask {
            return None;
        }
        let mut index = *self.gnu_bucket.add((hash % self.gnu_bucket_count) as usize);
        if index < self.gnu_symoffset {
            return None;
        }
        loop {
            let chain_hash = *self.gnu_chain.add((index - self.gnu_symoffset) as usize);
            if chain_hash | 1 == hash | 1 && self.sym_name(self.sym(index)) == name {
                return Some(index);
            }
            if chain_hash & 1 != 0 {
                return None;
            }
            index += 1;
        }
    }

    unsafe fn sysv_lookup(&self, name: &[u8]) -> Option<u32> {
        if self.bucket.is_null() || self.bucket_count == 0 {
            return None;
        }
        let hash = sysv_hash(name);
        let mut index = *self.bucket.add((hash % self.bucket_count) as usize);
        while index != 0 {
            if self.sym_name(self.sym(index)) == name {
                return Some(index);
            }
            index = *self.chain.add(index as usize);
        }
        None
    }

    /// Number of dynamic symbols: the SysV chain count when present,
    /// otherwise recovered by walking the GNU hash chains.
    unsafe fn symbol_count(&self) -> u32 {
        if self.chain_count != 0 {
            return self.chain_count;
        }
        if self.gnu_bucket.is_null() {
            return 0;
        }
        let mut max = 0u32;
        for i in 0..self.gnu_bucket_count {
            let mut index = *self.gnu_bucket.add(i as usize);
            if index < self.gnu_symoffset {
                continue;
            }
            loop {
                let chain_hash = *self.gnu_chain.add((index - self.gnu_symoffset) as usize);
                max = max.max(index);
                if chain_hash & 1 != 0 {
                    break;
                }
                index += 1;
            }
        }
        if max == 0 {
            0
        } else {
            max + 1
        }
    }

    unsafe fn linear_lookup(&self, name: &[u8]) -> Option<u32> {
        let count = self.symbol_count();
        (1..count).find(|&i| self.sym_name(self.sym(i)) == name)
    }

    /// Resolve a dynamic symbol to its runtime address. IFUNC symbols are
    /// resolved by calling their resolver.
    pub fn find_symbol(&self, name: &str) -> Option<u64> {
        let bytes = name.as_bytes();
        unsafe {
            let index = self
                .gnu_lookup(bytes)
                .or_else(|| self.sysv_lookup(bytes))
                .or_else(|| self.linear_lookup(bytes))?;
            let sym = self.sym(index);
            if !Self::sym_defined(sym) {
                return None;
            }
            let addr = self.bias.wrapping_add(sym.st_value);
            if sym.st_info & 0xF == STT_GNU_IFUNC {
                let resolver: unsafe extern "C" fn() -> u64 = core::mem::transmute(addr as usize);
                let resolved = resolver();
                debug!("ifunc {name} resolved {addr:#x} -> {resolved:#x}");
                return Some(resolved);
            }
            Some(addr)
        }
    }

    /// The GOT slot address behind the PLT entry for `name`, found by
    /// scanning the JMPREL jump-slot relocations (both REL and RELA forms).
    pub fn plt_slot(&self, name: &str) -> Option<u64> {
        if self.jmprel == 0 || self.jmprel_size == 0 {
            return None;
        }
        let bytes = name.as_bytes();
        unsafe {
            if self.jmprel_is_rela {
                let count = self.jmprel_size / core::mem::size_of::<Elf64Rela>();
                let relas = core::slice::from_raw_parts(self.jmprel as *const Elf64Rela, count);
                for rela in relas {
                    if r_type(rela.r_info) != R_JUMP_SLOT {
                        continue;
                    }
                    if self.sym_name(self.sym(r_sym(rela.r_info))) == bytes {
                        return Some(self.rebase(rela.r_offset));
                    }
                }
            } else {
                let count = self.jmprel_size / core::mem::size_of::<Elf64Rel>();
                let rels = core::slice::from_raw_parts(self.jmprel as *const Elf64Rel, count);
                for rel in rels {
                    if r_type(rel.r_info) != R_JUMP_SLOT {
                        continue;
                    }
                    if self.sym_name(self.sym(r_sym(rel.r_info))) == bytes {
                        return Some(self.rebase(rel.r_offset));
                    }
                }
            }
        }
        None
    }
}

/// Resolve `name` in the module loaded at `base`.
///
/// # Safety
/// See [`ElfImage::from_base`].
pub unsafe fn find(base: u64, name: &str) -> Option<u64> {
    ElfImage::from_base(base).ok()?.find_symbol(name)
}
