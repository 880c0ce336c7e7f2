//! Umbrella crate for the nacho interpreters.
//!
//! Re-exports the workspace crates under short names so embedders depend on one crate:
//! [`common`] for memory, faults and the [`Cpu`](nacho_core::Cpu) capability, [`ir`] and [`jit`]
//! for the compilation pipeline, and [`x86`] / [`dalvik`] for the two register machines.

#![forbid(unsafe_code)]

pub use nacho_core as common;
pub use nacho_dalvik as dalvik;
pub use nacho_ir as ir;
pub use nacho_jit as jit;
pub use nacho_x86 as x86;

pub use nacho_core::{Cpu, CpuFault, HaltReason, RunExit, RunState};
