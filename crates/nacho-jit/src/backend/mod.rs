//! Code-generation backends.
//!
//! A backend turns an optimized, verified [`IrFunction`] into an executable artifact and runs it
//! against a register window (see [`crate::abi`]). The engine only depends on the
//! [`CodegenBackend`] trait.

use nacho_core::Heap;
use nacho_ir::{IrFunction, IrOpcode, IrType};
use thiserror::Error;

mod host;
pub mod interp;
pub mod wasm_codegen;
pub mod wasmtime;

/// Opaque handle for a compiled artifact, scoped to the backend that produced it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ArtifactId(pub u32);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompiledArtifact {
    pub id: ArtifactId,
    pub entry_point: String,
    pub code_size: usize,
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("IR function `{func}` is malformed: {source}")]
    InvalidIr {
        func: String,
        #[source]
        source: nacho_ir::IrError,
    },
    #[error("backend `{backend}` does not support {what}")]
    Unsupported { backend: &'static str, what: String },
    #[error("function needs {needed} register-window slots, the ABI provides {max}")]
    WindowTooLarge { needed: usize, max: u32 },
    #[error("wasmtime: {0}")]
    Wasmtime(String),
}

impl BackendError {
    pub(crate) fn unsupported_opcode(backend: &'static str, opcode: IrOpcode) -> Self {
        BackendError::Unsupported {
            backend,
            what: format!("opcode {opcode}"),
        }
    }

    pub(crate) fn unsupported_type(backend: &'static str, ty: IrType) -> Self {
        BackendError::Unsupported {
            backend,
            what: format!("type {ty}"),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExecError {
    #[error("unknown artifact {0:?}")]
    UnknownArtifact(ArtifactId),
    #[error("register window has {got} slots, artifact needs {needed}")]
    WindowTooSmall { needed: usize, got: usize },
    #[error("integer divide by zero or overflow")]
    IntegerTrap,
    #[error("scratch memory access out of bounds at 0x{addr:x}")]
    OutOfBounds { addr: u64 },
    #[error("negative array length {0}")]
    NegativeArrayLength(i32),
    #[error("heap exhausted")]
    HeapExhausted,
    #[error("trap: {0}")]
    Trap(String),
}

/// Live state a compiled unit runs against.
pub struct ExecContext<'a> {
    /// Register window, one 64-bit slot per IR local.
    pub regs: &'a mut [u64],
    /// Object heap used by `NEW_*`, `ARRAY_*` and field operations.
    pub heap: &'a mut Heap,
}

pub trait CodegenBackend {
    fn name(&self) -> &'static str;

    fn compile(&mut self, func: &IrFunction) -> Result<CompiledArtifact, BackendError>;

    /// Run an artifact. Returns the function's return value (zero-extended bits), or `None` for
    /// `void` functions. On error the register window is left untouched.
    fn execute(
        &mut self,
        artifact: ArtifactId,
        ctx: &mut ExecContext<'_>,
    ) -> Result<Option<u64>, ExecError>;

    /// Drop an artifact and everything the backend holds for it. Returns `false` for an unknown
    /// id. Ids are not handed out again, so executing a released id fails with
    /// [`ExecError::UnknownArtifact`].
    fn release(&mut self, artifact: ArtifactId) -> bool;

    /// Artifacts compiled and not yet released.
    fn live_artifacts(&self) -> usize;
}

/// Checks shared by every backend before lowering.
pub(crate) fn check_abi(backend: &'static str, func: &IrFunction) -> Result<(), BackendError> {
    func.verify().map_err(|source| BackendError::InvalidIr {
        func: func.name.clone(),
        source,
    })?;
    if !func.params.is_empty() {
        return Err(BackendError::Unsupported {
            backend,
            what: "function parameters (the ABI passes state through the register window)".into(),
        });
    }
    if func.locals.len() > crate::abi::MAX_WINDOW_SLOTS as usize {
        return Err(BackendError::WindowTooLarge {
            needed: func.locals.len(),
            max: crate::abi::MAX_WINDOW_SLOTS,
        });
    }
    if func.locals.iter().any(|ty| *ty == IrType::Void) {
        return Err(BackendError::unsupported_type(backend, IrType::Void));
    }
    Ok(())
}
