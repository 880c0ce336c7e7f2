use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use nacho_ir::{IrBuilder, IrError, IrFunction, IrOptimizer};
use thiserror::Error;
use tracing::{debug, warn};

use crate::backend::{BackendError, CodegenBackend, ExecContext, ExecError};
use crate::cache::{CodeCache, CompiledUnit};
use crate::config::JitConfig;
use crate::profile::HotnessProfile;

/// Why a front end gave up translating a unit. An aborted key is interpreted from then on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AbortReason {
    UnsupportedOpcode { pc: u64, opcode: u16 },
    UnsupportedOperand { pc: u64, what: &'static str },
    Truncated { pc: u64 },
    MixedReturnTypes,
    /// The unit both returns explicitly and runs off the end of its code.
    MixedExits,
    Empty,
    Ir(IrError),
    Backend(String),
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortReason::UnsupportedOpcode { pc, opcode } => {
                write!(f, "unsupported opcode 0x{opcode:02x} at pc 0x{pc:x}")
            }
            AbortReason::UnsupportedOperand { pc, what } => {
                write!(f, "unsupported operand ({what}) at pc 0x{pc:x}")
            }
            AbortReason::Truncated { pc } => write!(f, "code truncated at pc 0x{pc:x}"),
            AbortReason::MixedReturnTypes => f.write_str("method returns values of different types"),
            AbortReason::MixedExits => {
                f.write_str("method both returns and runs off the end of its code")
            }
            AbortReason::Empty => f.write_str("nothing to translate"),
            AbortReason::Ir(err) => write!(f, "IR construction failed: {err}"),
            AbortReason::Backend(msg) => write!(f, "backend rejected unit: {msg}"),
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("compilation aborted: {reason}")]
pub struct CompilationAbort {
    pub reason: AbortReason,
}

impl CompilationAbort {
    pub fn new(reason: AbortReason) -> Self {
        Self { reason }
    }

    pub fn unsupported_opcode(pc: u64, opcode: u16) -> Self {
        Self::new(AbortReason::UnsupportedOpcode { pc, opcode })
    }

    pub fn unsupported_operand(pc: u64, what: &'static str) -> Self {
        Self::new(AbortReason::UnsupportedOperand { pc, what })
    }
}

impl From<IrError> for CompilationAbort {
    fn from(err: IrError) -> Self {
        Self::new(AbortReason::Ir(err))
    }
}

impl From<BackendError> for CompilationAbort {
    fn from(err: BackendError) -> Self {
        Self::new(AbortReason::Backend(err.to_string()))
    }
}

/// Output of a front end's translator for one unit.
#[derive(Clone, Debug)]
pub struct Translation {
    pub func: IrFunction,
    /// Guest instructions in one straight-line pass through the unit.
    pub guest_instructions: u32,
    /// Guest code bytes the unit was translated from.
    pub source_len: u32,
    /// Every exit of the unit runs off the end of its guest code instead of returning.
    pub falls_off_end: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct JitStats {
    pub compiles: u64,
    pub aborts: u64,
    pub compiled_executions: u64,
}

/// Shared JIT pipeline for one front end: hotness profile, code cache and backend.
///
/// `K` is the unit key, a guest address for x86 blocks and a method name for Dalvik.
pub struct JitEngine<K> {
    config: JitConfig,
    profile: HotnessProfile<K>,
    cache: CodeCache<K>,
    builder: IrBuilder,
    optimizer: IrOptimizer,
    backend: Box<dyn CodegenBackend>,
    stats: JitStats,
}

impl<K> fmt::Debug for JitEngine<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JitEngine")
            .field("config", &self.config)
            .field("backend", &self.backend.name())
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl<K: Eq + Hash + Clone + fmt::Debug> JitEngine<K> {
    /// Build an engine with the backend named in `config`.
    pub fn new(config: JitConfig) -> Result<Self, BackendError> {
        let backend = config.backend.instantiate()?;
        Ok(Self::with_backend(config, backend))
    }

    pub fn with_backend(config: JitConfig, backend: Box<dyn CodegenBackend>) -> Self {
        Self {
            profile: HotnessProfile::new(config.hot_threshold),
            cache: CodeCache::new(),
            builder: IrBuilder::new(),
            optimizer: IrOptimizer::new(),
            backend,
            stats: JitStats::default(),
            config,
        }
    }

    pub fn config(&self) -> &JitConfig {
        &self.config
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn stats(&self) -> JitStats {
        self.stats
    }

    pub fn profile(&self) -> &HotnessProfile<K> {
        &self.profile
    }

    pub fn cache(&self) -> &CodeCache<K> {
        &self.cache
    }

    /// Count one dispatch of `key`; `true` once the key is at or past the hotness threshold.
    pub fn should_compile(&mut self, key: &K) -> bool {
        self.profile.should_compile(key)
    }

    /// Count one dispatch and report whether a compile request should be queued for `key` now.
    /// Returns `true` at most once per key (until it is evicted).
    pub fn note_dispatch(&mut self, key: &K) -> bool {
        if !self.config.enabled {
            return false;
        }
        let compiled = self.cache.contains(key);
        self.profile.record_hit(key, compiled)
    }

    /// Cached unit for `key`, if any. Counts as a cache hit or miss.
    pub fn lookup(&mut self, key: &K) -> Option<Arc<CompiledUnit<K>>> {
        self.cache.get(key)
    }

    pub fn is_aborted(&self, key: &K) -> bool {
        self.profile.is_aborted(key)
    }

    /// Translate, optimize and compile the unit for `key`.
    ///
    /// A key that is already cached returns the cached unit without running `translate`. A key
    /// whose translation failed before is not retried. On failure the key is marked aborted and
    /// `None` is returned; the caller keeps interpreting.
    pub fn compile<F>(&mut self, key: K, translate: F) -> Option<Arc<CompiledUnit<K>>>
    where
        F: FnOnce(&mut IrBuilder) -> Result<Translation, CompilationAbort>,
    {
        if let Some(unit) = self.cache.peek(&key) {
            return Some(Arc::clone(unit));
        }
        if self.profile.is_aborted(&key) {
            return None;
        }

        match self.try_compile(&key, translate) {
            Ok(unit) => {
                self.profile.mark_compiled(&key);
                self.stats.compiles += 1;
                Some(self.cache.insert(unit))
            }
            Err(abort) => {
                self.profile.mark_aborted(&key);
                self.stats.aborts += 1;
                match &abort.reason {
                    AbortReason::Backend(_) => warn!(?key, %abort, "JIT compilation failed"),
                    _ => debug!(?key, %abort, "JIT translation aborted"),
                }
                None
            }
        }
    }

    fn try_compile<F>(&mut self, key: &K, translate: F) -> Result<CompiledUnit<K>, CompilationAbort>
    where
        F: FnOnce(&mut IrBuilder) -> Result<Translation, CompilationAbort>,
    {
        self.builder.reset();
        let Translation {
            mut func,
            guest_instructions,
            source_len,
            falls_off_end,
        } = translate(&mut self.builder)?;
        let before = func.instruction_count();
        let opt = self.optimizer.optimize(&mut func);
        let artifact = self.backend.compile(&func)?;

        debug!(
            ?key,
            func = %func.name,
            ir_before = before,
            ir_after = func.instruction_count(),
            opt_changes = opt.total_changes(),
            code_size = artifact.code_size,
            backend = self.backend.name(),
            "compiled unit"
        );

        Ok(CompiledUnit {
            key: key.clone(),
            artifact: artifact.id,
            entry_point: artifact.entry_point,
            code_size: artifact.code_size,
            ir_instructions: func.instruction_count(),
            guest_instructions,
            source_len,
            falls_off_end,
            return_type: func.return_type,
        })
    }

    /// Run a compiled unit against `ctx`.
    pub fn execute(
        &mut self,
        unit: &CompiledUnit<K>,
        ctx: &mut ExecContext<'_>,
    ) -> Result<Option<u64>, ExecError> {
        self.stats.compiled_executions += 1;
        self.backend.execute(unit.artifact, ctx)
    }

    /// Drop the cached unit for `key`, release its backend artifact and forget its profile, so it
    /// can become hot again. Handles to the evicted unit stay valid but no longer execute.
    pub fn evict(&mut self, key: &K) -> Option<Arc<CompiledUnit<K>>> {
        self.profile.reset(key);
        let unit = self.cache.evict(key)?;
        self.backend.release(unit.artifact);
        Some(unit)
    }

    /// Backend artifacts currently alive, one per cached unit.
    pub fn live_artifacts(&self) -> usize {
        self.backend.live_artifacts()
    }
}

impl JitEngine<u64> {
    /// Evict every unit whose guest bytes overlap `[addr, addr + len)`. Returns the evicted keys.
    pub fn invalidate_range(&mut self, addr: u64, len: u64) -> Vec<u64> {
        let keys = self.cache.keys_overlapping(addr, len);
        for key in &keys {
            debug!(key = *key, "invalidating compiled block");
            self.evict(key);
        }
        keys
    }
}
