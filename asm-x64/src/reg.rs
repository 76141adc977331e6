//! General-purpose register encodings.
//!
//! Registers are passed around as their hardware encodings (`u8`); the `enc`
//! module names them. Gencode only ever deals in fixed registers, so there is
//! no virtual-register indirection here.

/// A single register encoding can access a different number of bits.
#[derive(Copy, Clone, Debug)]
pub enum Size {
    /// An 8-bit access (low byte).
    Byte,
    /// A 32-bit access.
    Doubleword,
    /// A 64-bit access.
    Quadword,
}

pub const RAX: u8 = 0;
pub const RCX: u8 = 1;
pub const RDX: u8 = 2;
pub const RBX: u8 = 3;
pub const RSP: u8 = 4;
pub const RBP: u8 = 5;
pub const RSI: u8 = 6;
pub const RDI: u8 = 7;
pub const R8: u8 = 8;
pub const R9: u8 = 9;
pub const R10: u8 = 10;
pub const R11: u8 = 11;
pub const R12: u8 = 12;
pub const R13: u8 = 13;
pub const R14: u8 = 14;
pub const R15: u8 = 15;

/// Return the name of a GPR encoding at the given `size`.
///
/// # Panics
///
/// Panics if `enc` is not a valid register encoding.
#[must_use]
pub fn to_string(enc: u8, size: Size) -> &'static str {
    use Size::{Byte, Doubleword, Quadword};
    match enc {
        RAX => match size {
            Byte => "%al",
            Doubleword => "%eax",
            Quadword => "%rax",
        },
        RCX => match size {
            Byte => "%cl",
            Doubleword => "%ecx",
            Quadword => "%rcx",
        },
        RDX => match size {
            Byte => "%dl",
            Doubleword => "%edx",
            Quadword => "%rdx",
        },
        RBX => match size {
            Byte => "%bl",
            Doubleword => "%ebx",
            Quadword => "%rbx",
        },
        RSP => match size {
            Byte => "%spl",
            Doubleword => "%esp",
            Quadword => "%rsp",
        },
        RBP => match size {
            Byte => "%bpl",
            Doubleword => "%ebp",
            Quadword => "%rbp",
        },
        RSI => match size {
            Byte => "%sil",
            Doubleword => "%esi",
            Quadword => "%rsi",
        },
        RDI => match size {
            Byte => "%dil",
            Doubleword => "%edi",
            Quadword => "%rdi",
        },
        R8 => match size {
            Byte => "%r8b",
            Doubleword => "%r8d",
            Quadword => "%r8",
        },
        R9 => match size {
            Byte => "%r9b",
            Doubleword => "%r9d",
            Quadword => "%r9",
        },
        R10 => match size {
            Byte => "%r10b",
            Doubleword => "%r10d",
            Quadword => "%r10",
        },
        R11 => match size {
            Byte => "%r11b",
            Doubleword => "%r11d",
            Quadword => "%r11",
        },
        R12 => match size {
            Byte => "%r12b",
            Doubleword => "%r12d",
            Quadword => "%r12",
        },
        R13 => match size {
            Byte => "%r13b",
            Doubleword => "%r13d",
            Quadword => "%r13",
        },
        R14 => match size {
            Byte => "%r14b",
            Doubleword => "%r14d",
            Quadword => "%r14",
        },
        R15 => match size {
            Byte => "%r15b",
            Doubleword => "%r15d",
            Quadword => "%r15",
        },
        _ => panic!("invalid register: {enc}"),
    }
}
