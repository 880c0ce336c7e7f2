//! Whole-method JIT for the Dalvik interpreter.
//!
//! [`DalvikJit::note_invocation`] counts calls per method name and queues a method once it is
//! hot; [`DalvikJit::service_queue`] compiles queued methods once the interpreter has finished
//! the call that made them hot. A compiled method runs against a window of the v-registers,
//! zero-extended into 8-byte slots.

mod translate;

use std::sync::Arc;

use nacho_core::Heap;
use nacho_jit::abi::MAX_WINDOW_SLOTS;
use nacho_jit::{
    BackendError, CodegenBackend, CompileQueue, CompiledUnit, ExecContext, ExecError, JitConfig,
    JitEngine,
};
use tracing::debug;

use crate::interp::DalvikRegisters;

pub use translate::translate_method;

#[derive(Debug)]
pub struct DalvikJit {
    engine: JitEngine<String>,
    queue: CompileQueue<(String, Arc<[u8]>)>,
    window: Vec<u64>,
}

impl DalvikJit {
    pub fn new(config: JitConfig) -> Result<Self, BackendError> {
        Ok(Self::from_engine(JitEngine::new(config)?))
    }

    pub fn with_backend(config: JitConfig, backend: Box<dyn CodegenBackend>) -> Self {
        Self::from_engine(JitEngine::with_backend(config, backend))
    }

    fn from_engine(engine: JitEngine<String>) -> Self {
        Self {
            engine,
            queue: CompileQueue::new(),
            window: Vec::new(),
        }
    }

    pub fn engine(&self) -> &JitEngine<String> {
        &self.engine
    }

    /// Count one invocation of `method`; `true` at and above the hotness threshold.
    pub fn should_compile(&mut self, method: &str) -> bool {
        self.engine.should_compile(&method.to_string())
    }

    /// Count one invocation of `method`, queueing its code once the method becomes hot.
    pub fn note_invocation(&mut self, method: &str, code: &[u8]) {
        let key = method.to_string();
        if self.engine.note_dispatch(&key) {
            debug!(method, "queueing Dalvik method for compilation");
            self.queue.push((key, Arc::from(code)));
        }
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub fn get_compiled_method(&mut self, method: &str) -> Option<Arc<CompiledUnit<String>>> {
        self.engine.lookup(&method.to_string())
    }

    /// Translate, optimize and compile `method`. `None` if any part of that fails.
    pub fn compile_method(
        &mut self,
        method: &str,
        code: &[u8],
    ) -> Option<Arc<CompiledUnit<String>>> {
        let max_insts = self.engine.config().max_block_insts;
        self.engine.compile(method.to_string(), |b| {
            translate_method(b, method, code, max_insts)
        })
    }

    /// Compile every queued method.
    pub fn service_queue(&mut self) {
        while let Some((method, code)) = self.queue.pop() {
            self.compile_method(&method, &code);
        }
    }

    /// Run a compiled method. On success the v-registers hold the method's final values; on
    /// error they are unchanged.
    pub fn execute(
        &mut self,
        unit: &CompiledUnit<String>,
        regs: &mut DalvikRegisters,
        heap: &mut Heap,
    ) -> Result<Option<u64>, ExecError> {
        let slots = regs.v.len().min(MAX_WINDOW_SLOTS as usize);
        self.window.clear();
        self.window
            .extend(regs.v[..slots].iter().map(|&v| u64::from(v)));

        let ret = self.engine.execute(
            unit,
            &mut ExecContext {
                regs: &mut self.window,
                heap,
            },
        )?;

        for (dst, &slot) in regs.v.iter_mut().zip(&self.window) {
            *dst = slot as u32;
        }
        Ok(ret)
    }

    pub fn evict(&mut self, method: &str) {
        self.engine.evict(&method.to_string());
    }
}
