use thiserror::Error;

/// Instruction-encoding failures. These are always fatal to the operation
/// that requested the emission; the code buffer is left unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodingError {
    /// A PC-relative displacement or immediate does not fit the
    /// instruction's field.
    #[error("{insn}: operand out of range")]
    OutOfRange { insn: &'static str },

    /// The value cannot be expressed as an AArch64 logical immediate
    /// (a rotated, repeating run of set bits).
    #[error("value {0:#x} is not encodable as a logical immediate")]
    InvalidBitmask(u64),

    /// FMOV between register classes/widths that have no direct encoding.
    #[error("unsupported fmov operand combination")]
    UnsupportedFmov,

    /// A register of the wrong class was passed (e.g. an FP register to an
    /// integer-only operation).
    #[error("{insn}: invalid operand register class")]
    InvalidOperand { insn: &'static str },
}

/// Errors surfaced by the public hooking APIs.
#[derive(Debug, Error)]
pub enum HookError {
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error(transparent)]
    Encoding(#[from] EncodingError),

    /// Nothing at the target decoded into instructions.
    #[error("failed to decode any instruction at {target:#x}")]
    DecodeFailed { target: u64 },

    /// The target function ends before enough bytes could be relocated to
    /// cover the patch.
    #[error("target {target:#x} too short: needed {required} relocatable bytes")]
    TargetTooShort { target: u64, required: usize },

    /// mmap failed under every placement policy.
    #[error("executable memory allocation failed")]
    AllocationFailed,

    /// mprotect or the patch write itself failed at the target.
    #[error("memory permission change or write failed at {addr:#x}")]
    MemoryPermission { addr: u64 },

    /// ELF metadata missing or malformed (PLT hooks).
    #[error("elf parse error: {0}")]
    Parse(&'static str),

    /// The requested dynamic symbol is not present in the module.
    #[error("symbol not found: {0}")]
    SymbolNotFound(String),
}

pub type Result<T> = core::result::Result<T, HookError>;
