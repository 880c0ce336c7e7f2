//! Basic-block JIT for the x86 interpreter.
//!
//! The CPU reports every block-leader dispatch, interpreted or compiled, through
//! [`X86Jit::note_dispatch`]. A block that crosses the hotness threshold is queued, and the queue
//! is drained between instructions by [`X86Jit::service_queue`]. Compiled blocks run against a
//! register window holding the eight GPRs and EFLAGS, and return the next EIP.

mod translate;

use std::sync::Arc;

use nacho_core::{Heap, MemorySurface};
use nacho_jit::{
    BackendError, CodegenBackend, CompileQueue, CompiledUnit, ExecContext, ExecError, JitConfig,
    JitEngine,
};
use tracing::debug;

use crate::regs::{Eflags, X86Registers};

pub use translate::translate_block;

/// IR local holding EFLAGS; locals `0..8` hold the GPRs.
pub const EFLAGS_SLOT: u32 = 8;
pub const WINDOW_SLOTS: usize = 9;

#[derive(Debug)]
pub struct X86Jit {
    engine: JitEngine<u64>,
    queue: CompileQueue<u32>,
    window: [u64; WINDOW_SLOTS],
    /// Compiled x86 blocks never allocate; the heap only satisfies the execution ABI.
    heap: Heap,
}

impl X86Jit {
    pub fn new(config: JitConfig) -> Result<Self, BackendError> {
        Ok(Self::from_engine(JitEngine::new(config)?))
    }

    pub fn with_backend(config: JitConfig, backend: Box<dyn CodegenBackend>) -> Self {
        Self::from_engine(JitEngine::with_backend(config, backend))
    }

    fn from_engine(engine: JitEngine<u64>) -> Self {
        Self {
            engine,
            queue: CompileQueue::new(),
            window: [0; WINDOW_SLOTS],
            heap: Heap::new(),
        }
    }

    pub fn engine(&self) -> &JitEngine<u64> {
        &self.engine
    }

    /// Count one dispatch of the block at `addr`; `true` at and above the hotness threshold.
    pub fn should_compile(&mut self, addr: u32) -> bool {
        self.engine.should_compile(&u64::from(addr))
    }

    /// Count one dispatch of the block leader at `addr`, queueing it once it becomes hot.
    pub fn note_dispatch(&mut self, addr: u32) {
        if self.engine.note_dispatch(&u64::from(addr)) {
            debug!(addr, "queueing x86 block for compilation");
            self.queue.push(addr);
        }
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub fn get_compiled_function(&mut self, addr: u32) -> Option<Arc<CompiledUnit<u64>>> {
        self.engine.lookup(&u64::from(addr))
    }

    /// Translate, optimize and compile the block at `addr`. `None` if any part of that fails.
    pub fn compile_basic_block<M: MemorySurface + ?Sized>(
        &mut self,
        memory: &M,
        addr: u32,
    ) -> Option<Arc<CompiledUnit<u64>>> {
        let max_insts = self.engine.config().max_block_insts;
        self.engine.compile(u64::from(addr), |b| {
            translate_block(b, memory, addr, max_insts)
        })
    }

    /// Compile every queued block.
    pub fn service_queue<M: MemorySurface + ?Sized>(&mut self, memory: &M) {
        while let Some(addr) = self.queue.pop() {
            self.compile_basic_block(memory, addr);
        }
    }

    /// Run a compiled block. On success the registers hold the block's results and EIP points at
    /// the next instruction; on error they are unchanged.
    pub fn execute(
        &mut self,
        unit: &CompiledUnit<u64>,
        regs: &mut X86Registers,
    ) -> Result<(), ExecError> {
        self.window[..8].copy_from_slice(&regs.gpr);
        self.window[EFLAGS_SLOT as usize] = u64::from(regs.eflags.bits());

        let next = self.engine.execute(
            unit,
            &mut ExecContext {
                regs: &mut self.window,
                heap: &mut self.heap,
            },
        )?;
        let next = next.ok_or_else(|| ExecError::Trap("block returned no EIP".into()))?;

        regs.gpr.copy_from_slice(&self.window[..8]);
        regs.eflags = Eflags::from_bits_retain(self.window[EFLAGS_SLOT as usize] as u32);
        regs.eip = next as u32;
        Ok(())
    }

    pub fn evict(&mut self, addr: u32) {
        self.engine.evict(&u64::from(addr));
    }

    /// Evict blocks translated from bytes in `[addr, addr + len)`.
    pub fn invalidate(&mut self, addr: u64, len: u64) {
        self.engine.invalidate_range(addr, len);
    }
}
