//! Hotness tracking, compiled-unit caching and pluggable code generation for the nacho JIT.
//!
//! The ISA-specific front ends (`nacho-x86`, `nacho-dalvik`) translate guest code into
//! [`nacho_ir::IrFunction`]s. Everything after translation is shared and lives here:
//!
//! - [`HotnessProfile`]: per-key dispatch counters and the one-shot promotion decision.
//! - [`CodeCache`]: compiled units keyed by guest address or method name. Unbounded; entries only
//!   leave through explicit eviction.
//! - [`CompileQueue`]: deferred compile requests, drained by the interpreter at an instruction
//!   boundary.
//! - [`backend`]: the [`CodegenBackend`] seam with a WebAssembly/wasmtime implementation and an IR
//!   interpreter implementation.
//! - [`JitEngine`]: glue that runs translate → optimize → codegen → cache for one key.

#![forbid(unsafe_code)]

pub mod abi;
pub mod backend;
mod cache;
mod config;
mod engine;
mod profile;
mod queue;

pub use backend::{
    ArtifactId, BackendError, CodegenBackend, CompiledArtifact, ExecContext, ExecError,
};
pub use cache::{CodeCache, CompiledUnit};
pub use config::{BackendKind, ConfigError, Isa, JitConfig};
pub use engine::{AbortReason, CompilationAbort, JitEngine, JitStats, Translation};
pub use profile::HotnessProfile;
pub use queue::CompileQueue;
