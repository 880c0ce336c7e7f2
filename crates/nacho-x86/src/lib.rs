//! x86 interpreter and basic-block JIT front end.
//!
//! The interpreter models a small integer subset of the ISA with register-direct operands and a
//! ZF/SF-only flag model. Memory-operand forms are decoded in full (so the PC stays in sync) but
//! have no architectural effect.

#![forbid(unsafe_code)]

pub mod cpu;
pub mod decode;
pub mod jit;
pub mod regs;

pub use cpu::X86Cpu;
pub use decode::{
    decode, fetch, Cond, DecodeError, DecodedInstruction, FetchError, MemOperand, Mnemonic,
    Operand, RexFlags, MAX_INST_LEN,
};
pub use jit::X86Jit;
pub use regs::{Eflags, Gpr, X86Registers};
