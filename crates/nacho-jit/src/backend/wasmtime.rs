use std::collections::HashMap;

use ::wasmtime::{
    Caller, Engine, Func, Linker, Memory, MemoryType, Module, Store, Trap, Val,
};
use nacho_core::Heap;
use nacho_ir::{IrFunction, IrType};
use tracing::{debug, trace};

use super::{host, wasm_codegen, ArtifactId, BackendError, CodegenBackend, CompiledArtifact};
use super::{ExecContext, ExecError};
use crate::abi::{
    self, IMPORT_ARRAY_GET, IMPORT_ARRAY_LENGTH, IMPORT_ARRAY_SET, IMPORT_GET_FIELD,
    IMPORT_MEMORY, IMPORT_MODULE, IMPORT_NEW_ARRAY, IMPORT_NEW_OBJECT, IMPORT_SET_FIELD,
};

/// Store data visible to host imports while a unit runs.
#[derive(Default)]
struct HostState {
    /// The caller's heap, swapped in for the duration of one call.
    heap: Heap,
    /// Typed cause of a trap raised by a host import.
    fault: Option<ExecError>,
}

/// One instantiated unit. Each unit owns its store, so dropping it frees the instance and its
/// memory.
struct Artifact {
    store: Store<HostState>,
    memory: Memory,
    func: Func,
    window_slots: usize,
    return_type: IrType,
}

impl Artifact {
    fn write_window(&mut self, regs: &[u64]) -> Result<(), ExecError> {
        let bytes: Vec<u8> = regs.iter().flat_map(|r| r.to_le_bytes()).collect();
        self.memory
            .write(&mut self.store, abi::WINDOW_PTR as usize, &bytes)
            .map_err(|_| ExecError::OutOfBounds {
                addr: u64::from(abi::WINDOW_PTR),
            })
    }

    fn read_window(&self, regs: &mut [u64]) -> Result<(), ExecError> {
        let mut bytes = vec![0u8; regs.len() * abi::SLOT_BYTES as usize];
        self.memory
            .read(&self.store, abi::WINDOW_PTR as usize, &mut bytes)
            .map_err(|_| ExecError::OutOfBounds {
                addr: u64::from(abi::WINDOW_PTR),
            })?;
        for (reg, chunk) in regs.iter_mut().zip(bytes.chunks_exact(8)) {
            let mut b = [0u8; 8];
            b.copy_from_slice(chunk);
            *reg = u64::from_le_bytes(b);
        }
        Ok(())
    }
}

/// Backend that lowers IR to WebAssembly (see [`wasm_codegen`]) and runs it on wasmtime.
///
/// ## ABI (`export entry(window_ptr: i32) -> ret`)
///
/// Every module imports a linear memory owned by its own store. Before a call the engine's
/// register window is copied to [`abi::WINDOW_PTR`]; after a successful return the (possibly
/// updated) slots are copied back. A trapping unit leaves the caller's window untouched.
///
/// Artifact ids are never reused, so a released id stays unknown.
pub struct WasmBackend {
    engine: Engine,
    /// Object-model imports only; the memory import is added per store.
    linker: Linker<HostState>,
    artifacts: HashMap<ArtifactId, Artifact>,
    next_id: u32,
}

impl WasmBackend {
    pub fn new() -> Result<Self, BackendError> {
        let engine = Engine::default();
        let mut linker = Linker::new(&engine);
        define_object_imports(&mut linker)?;

        Ok(Self {
            engine,
            linker,
            artifacts: HashMap::new(),
            next_id: 0,
        })
    }

    fn instantiate(
        &self,
        module: &Module,
    ) -> Result<(Store<HostState>, Memory, Func), BackendError> {
        let mut store = Store::new(&self.engine, HostState::default());
        let memory = Memory::new(&mut store, MemoryType::new(abi::MEMORY_PAGES, None))
            .map_err(wasmtime_err)?;
        let mut linker = self.linker.clone();
        linker
            .define(&mut store, IMPORT_MODULE, IMPORT_MEMORY, memory)
            .map_err(wasmtime_err)?;
        let instance = linker.instantiate(&mut store, module).map_err(wasmtime_err)?;
        let entry = instance
            .get_func(&mut store, abi::EXPORT_ENTRY)
            .ok_or_else(|| BackendError::Wasmtime(format!("missing `{}` export", abi::EXPORT_ENTRY)))?;
        Ok((store, memory, entry))
    }
}

impl CodegenBackend for WasmBackend {
    fn name(&self) -> &'static str {
        "wasm"
    }

    fn compile(&mut self, func: &IrFunction) -> Result<CompiledArtifact, BackendError> {
        let bytes = wasm_codegen::lower(func)?;
        let module = Module::new(&self.engine, &bytes).map_err(wasmtime_err)?;
        let (store, memory, entry) = self.instantiate(&module)?;

        let id = ArtifactId(self.next_id);
        self.next_id = self.next_id.wrapping_add(1);
        self.artifacts.insert(
            id,
            Artifact {
                store,
                memory,
                func: entry,
                window_slots: func.locals.len(),
                return_type: func.return_type,
            },
        );
        debug!(func = %func.name, artifact = id.0, bytes = bytes.len(), "instantiated wasm unit");

        Ok(CompiledArtifact {
            id,
            entry_point: abi::EXPORT_ENTRY.to_string(),
            code_size: bytes.len(),
        })
    }

    fn execute(
        &mut self,
        artifact: ArtifactId,
        ctx: &mut ExecContext<'_>,
    ) -> Result<Option<u64>, ExecError> {
        let unit = self
            .artifacts
            .get_mut(&artifact)
            .ok_or(ExecError::UnknownArtifact(artifact))?;
        let needed = unit.window_slots;
        if ctx.regs.len() < needed {
            return Err(ExecError::WindowTooSmall {
                needed,
                got: ctx.regs.len(),
            });
        }

        unit.write_window(&ctx.regs[..needed])?;

        let mut results = match unit.return_type {
            IrType::Void => Vec::new(),
            IrType::I64 => vec![Val::I64(0)],
            IrType::F32 => vec![Val::F32(0)],
            IrType::F64 => vec![Val::F64(0)],
            IrType::I32 | IrType::Ref => vec![Val::I32(0)],
        };

        std::mem::swap(ctx.heap, &mut unit.store.data_mut().heap);
        unit.store.data_mut().fault = None;
        let outcome = unit.func.call(
            &mut unit.store,
            &[Val::I32(abi::WINDOW_PTR as i32)],
            &mut results,
        );
        std::mem::swap(ctx.heap, &mut unit.store.data_mut().heap);

        if let Err(err) = outcome {
            let fault = unit.store.data_mut().fault.take();
            trace!(artifact = artifact.0, error = %err, "wasm unit trapped");
            return Err(fault.unwrap_or_else(|| trap_to_exec_error(&err)));
        }

        unit.read_window(&mut ctx.regs[..needed])?;

        Ok(results.first().map(|v| match *v {
            Val::I32(x) => x as u32 as u64,
            Val::I64(x) => x as u64,
            Val::F32(bits) => u64::from(bits),
            Val::F64(bits) => bits,
            _ => 0,
        }))
    }

    fn release(&mut self, artifact: ArtifactId) -> bool {
        let released = self.artifacts.remove(&artifact).is_some();
        if released {
            debug!(artifact = artifact.0, "dropped wasm unit");
        }
        released
    }

    fn live_artifacts(&self) -> usize {
        self.artifacts.len()
    }
}

fn wasmtime_err(err: impl std::fmt::Display) -> BackendError {
    BackendError::Wasmtime(format!("{err:#}"))
}

fn trap_to_exec_error(err: &::wasmtime::Error) -> ExecError {
    match err.downcast_ref::<Trap>() {
        Some(Trap::IntegerDivisionByZero | Trap::IntegerOverflow) => ExecError::IntegerTrap,
        Some(Trap::MemoryOutOfBounds) => ExecError::OutOfBounds { addr: 0 },
        _ => ExecError::Trap(format!("{err:#}")),
    }
}

/// Record a host-side failure so `execute` can report it typed, then trap.
fn host_fault<T>(caller: &mut Caller<'_, HostState>, fault: ExecError) -> ::wasmtime::Result<T> {
    let msg = fault.to_string();
    caller.data_mut().fault = Some(fault);
    Err(::wasmtime::Error::msg(msg))
}

fn define_object_imports(linker: &mut Linker<HostState>) -> Result<(), BackendError> {
    linker
        .func_wrap(
            IMPORT_MODULE,
            IMPORT_NEW_OBJECT,
            |mut caller: Caller<'_, HostState>, type_idx: i32| -> ::wasmtime::Result<i32> {
                match host::new_object(&mut caller.data_mut().heap, type_idx) {
                    Ok(r) => Ok(r),
                    Err(fault) => host_fault(&mut caller, fault),
                }
            },
        )
        .map_err(wasmtime_err)?;
    linker
        .func_wrap(
            IMPORT_MODULE,
            IMPORT_NEW_ARRAY,
            |mut caller: Caller<'_, HostState>, len: i32| -> ::wasmtime::Result<i32> {
                match host::new_array(&mut caller.data_mut().heap, len) {
                    Ok(r) => Ok(r),
                    Err(fault) => host_fault(&mut caller, fault),
                }
            },
        )
        .map_err(wasmtime_err)?;
    linker
        .func_wrap(
            IMPORT_MODULE,
            IMPORT_ARRAY_LENGTH,
            |caller: Caller<'_, HostState>, array: i32| -> i32 {
                host::array_length(&caller.data().heap, array)
            },
        )
        .map_err(wasmtime_err)?;
    linker
        .func_wrap(
            IMPORT_MODULE,
            IMPORT_ARRAY_GET,
            |caller: Caller<'_, HostState>, array: i32, index: i32| -> i32 {
                host::array_get(&caller.data().heap, array, index)
            },
        )
        .map_err(wasmtime_err)?;
    linker
        .func_wrap(
            IMPORT_MODULE,
            IMPORT_ARRAY_SET,
            |mut caller: Caller<'_, HostState>, array: i32, index: i32, value: i32| {
                host::array_set(&mut caller.data_mut().heap, array, index, value)
            },
        )
        .map_err(wasmtime_err)?;
    linker
        .func_wrap(
            IMPORT_MODULE,
            IMPORT_GET_FIELD,
            |caller: Caller<'_, HostState>, object: i32, field: i32| -> i32 {
                host::get_field(&caller.data().heap, object, field)
            },
        )
        .map_err(wasmtime_err)?;
    linker
        .func_wrap(
            IMPORT_MODULE,
            IMPORT_SET_FIELD,
            |mut caller: Caller<'_, HostState>, object: i32, field: i32, value: i32| {
                host::set_field(&mut caller.data_mut().heap, object, field, value)
            },
        )
        .map_err(wasmtime_err)?;
    Ok(())
}
