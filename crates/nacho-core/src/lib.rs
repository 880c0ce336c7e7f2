//! Shared building blocks for the nacho interpreters and JIT.
//!
//! - [`memory`]: the bounds-checked, little-endian [`MemorySurface`] contract and two backing
//!   stores ([`FlatMemory`], [`SparseMemory`]).
//! - [`cpu`]: the [`Cpu`] capability implemented by both register machines, plus the run-state and
//!   fault types surfaced at the `run()` boundary.
//! - [`heap`]: the generational object arena used by the Dalvik object model and by compiled code
//!   that performs object operations.

#![forbid(unsafe_code)]

pub mod cpu;
pub mod heap;
pub mod memory;

pub use cpu::{
    Cpu, CpuFault, DecodeFault, GuestExceptionKind, HaltReason, InterruptHandler, RunExit,
    RunState,
};
pub use heap::{ArrayKind, Heap, HeapObject, ObjectRef, MAX_ARRAY_LEN};
pub use memory::{AccessKind, FlatMemory, MemoryFault, MemorySurface, SparseMemory};
