//! Typed, SSA-like intermediate representation shared by the x86 and Dalvik JIT front ends.
//!
//! A compilation unit is one [`IrFunction`]: an ordered list of [`IrBasicBlock`]s whose last
//! instruction is a terminator (`RETURN`, `BR`, `BR_IF`). Virtual registers are assigned once per
//! unit by the [`IrBuilder`]; guest registers live in function locals.
//!
//! The [`IrOptimizer`] runs dead-code elimination, constant folding, block-local CSE and copy
//! propagation, in that order, until nothing changes.

#![forbid(unsafe_code)]

pub mod builder;
pub mod eval;
pub mod function;
pub mod inst;
pub mod opt;
pub mod types;

pub use builder::IrBuilder;
pub use function::{IrBasicBlock, IrError, IrFunction};
pub use inst::{IrInstruction, IrMetadata, IrOpcode, OpCategory};
pub use opt::{IrOptimizer, OptStats};
pub use types::{BlockId, Constant, IrType, IrValue, VReg};
