//! Dalvik register-machine interpreter and whole-method JIT front end.
//!
//! Code is interpreted one method frame at a time over a flat file of 32-bit v-registers. The
//! object model is the shared [`nacho_core::Heap`]: references that do not resolve read as zero
//! and writes through them are dropped. Field access and invocation advance the PC but are
//! otherwise not modelled.

#![forbid(unsafe_code)]

pub mod decode;
pub mod interp;
pub mod jit;
pub mod opcode;

pub use decode::{decode, ArrayData, DecodeError, Instruction, PackedSwitch, SparseSwitch};
pub use interp::{DalvikConfig, DalvikError, DalvikInterpreter, DalvikRegisters, ExecOutcome};
pub use jit::DalvikJit;
pub use opcode::{Format, Opcode};
