//! Backend that executes optimized IR directly.
//!
//! Useful where a native code generator is unavailable and as a reference for the wasm backend:
//! both share the register-window ABI, the scratch memory layout and the object-model semantics,
//! so a unit produces the same results on either.

use std::collections::HashMap;

use nacho_ir::{eval, Constant, IrFunction, IrInstruction, IrOpcode, IrType, IrValue, OpCategory};
use tracing::debug;

use super::{check_abi, host, ArtifactId, BackendError, CodegenBackend, CompiledArtifact};
use super::{ExecContext, ExecError};
use crate::abi;

const BACKEND: &str = "interp";

pub struct IrInterpBackend {
    functions: HashMap<ArtifactId, IrFunction>,
    next_id: u32,
    /// Linear memory with the same layout as the wasm backend's.
    memory: Vec<u8>,
}

impl Default for IrInterpBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl IrInterpBackend {
    pub fn new() -> Self {
        Self {
            functions: HashMap::new(),
            next_id: 0,
            memory: vec![0; abi::MEMORY_BYTES as usize],
        }
    }
}

impl CodegenBackend for IrInterpBackend {
    fn name(&self) -> &'static str {
        BACKEND
    }

    fn compile(&mut self, func: &IrFunction) -> Result<CompiledArtifact, BackendError> {
        check_abi(BACKEND, func)?;
        for inst in func.instructions() {
            if inst.opcode == IrOpcode::Call {
                return Err(BackendError::unsupported_opcode(BACKEND, inst.opcode));
            }
            if inst.opcode == IrOpcode::Return
                && inst.operands.is_empty() != (func.return_type == IrType::Void)
            {
                return Err(BackendError::Unsupported {
                    backend: BACKEND,
                    what: format!("RETURN arity mismatch for {}", func.return_type),
                });
            }
        }

        let id = ArtifactId(self.next_id);
        self.next_id = self.next_id.wrapping_add(1);
        let code_size = func.instruction_count();
        self.functions.insert(id, func.clone());
        debug!(func = %func.name, artifact = id.0, "registered IR unit");

        Ok(CompiledArtifact {
            id,
            entry_point: func.name.clone(),
            code_size,
        })
    }

    fn execute(
        &mut self,
        artifact: ArtifactId,
        ctx: &mut ExecContext<'_>,
    ) -> Result<Option<u64>, ExecError> {
        let func = self
            .functions
            .get(&artifact)
            .ok_or(ExecError::UnknownArtifact(artifact))?;
        let needed = func.locals.len();
        if ctx.regs.len() < needed {
            return Err(ExecError::WindowTooSmall {
                needed,
                got: ctx.regs.len(),
            });
        }

        for (i, reg) in ctx.regs[..needed].iter().enumerate() {
            let off = abi::WINDOW_PTR as usize + i * abi::SLOT_BYTES as usize;
            self.memory[off..off + 8].copy_from_slice(&reg.to_le_bytes());
        }

        let mut frame = Frame {
            func,
            locals: ctx.regs[..needed]
                .iter()
                .zip(&func.locals)
                .map(|(bits, ty)| canon(*ty, *bits))
                .collect(),
            vregs: vec![0; func.registers.len()],
            memory: &mut self.memory,
        };
        let ret = frame.run(ctx)?;
        ctx.regs[..needed].copy_from_slice(&frame.locals);
        Ok(ret)
    }

    fn release(&mut self, artifact: ArtifactId) -> bool {
        self.functions.remove(&artifact).is_some()
    }

    fn live_artifacts(&self) -> usize {
        self.functions.len()
    }
}

/// Narrow raw bits to the canonical (zero-extended) representation of `ty`.
fn canon(ty: IrType, bits: u64) -> u64 {
    match ty {
        IrType::I32 | IrType::F32 | IrType::Ref => bits as u32 as u64,
        _ => bits,
    }
}

struct Frame<'a> {
    func: &'a IrFunction,
    locals: Vec<u64>,
    vregs: Vec<u64>,
    memory: &'a mut [u8],
}

enum Flow {
    Next,
    Jump(usize),
    Return(Option<u64>),
}

impl Frame<'_> {
    fn run(&mut self, ctx: &mut ExecContext<'_>) -> Result<Option<u64>, ExecError> {
        let mut block = self.func.entry.index();
        loop {
            let func = self.func;
            let insts = &func.blocks[block].instructions;
            let mut next = None;
            for inst in insts {
                match self.step(inst, ctx)? {
                    Flow::Next => {}
                    Flow::Jump(target) => {
                        next = Some(target);
                        break;
                    }
                    Flow::Return(value) => return Ok(value),
                }
            }
            // Verified functions always end blocks with a terminator.
            block = next.ok_or_else(|| ExecError::Trap("fell off the end of a block".into()))?;
        }
    }

    fn value(&self, v: IrValue) -> u64 {
        match v {
            IrValue::Register(r) => self.vregs[r.id as usize],
            IrValue::Constant(c) => canon(c.ty(), c.bits()),
            IrValue::Label(b) => u64::from(b.0),
        }
    }

    fn operand(&self, inst: &IrInstruction, i: usize) -> Result<u64, ExecError> {
        inst.operands
            .get(i)
            .map(|v| self.value(*v))
            .ok_or_else(|| ExecError::Trap(format!("{} is missing operand {i}", inst.opcode)))
    }

    fn set(&mut self, inst: &IrInstruction, bits: u64) {
        if let Some(r) = inst.result_reg() {
            self.vregs[r.id as usize] = canon(inst.ty, bits);
        }
    }

    fn label(inst: &IrInstruction, i: usize) -> Result<usize, ExecError> {
        inst.operands
            .get(i)
            .and_then(|v| v.as_label())
            .map(|b| b.index())
            .ok_or_else(|| ExecError::Trap(format!("{} without a label", inst.opcode)))
    }

    fn mem_range(&self, addr: u64, len: usize) -> Result<std::ops::Range<usize>, ExecError> {
        let start = addr as u32 as usize;
        let end = start + len;
        if end > self.memory.len() {
            return Err(ExecError::OutOfBounds { addr });
        }
        Ok(start..end)
    }

    fn step(&mut self, inst: &IrInstruction, ctx: &mut ExecContext<'_>) -> Result<Flow, ExecError> {
        use IrOpcode::*;

        let op = inst.opcode;
        match op.category() {
            OpCategory::Constant => {
                let v = self.operand(inst, 0)?;
                self.set(inst, v);
                return Ok(Flow::Next);
            }
            OpCategory::Arithmetic
            | OpCategory::Bitwise
            | OpCategory::Conversion
            | OpCategory::Compare => {
                let args: Vec<Constant> = inst
                    .operands
                    .iter()
                    .map(|v| {
                        let ty = match v.ty() {
                            IrType::Ref => IrType::I32,
                            ty => ty,
                        };
                        Constant::from_bits(ty, self.value(*v)).unwrap_or(Constant::I32(0))
                    })
                    .collect();
                let result = match eval::eval(op, &args) {
                    Some(c) => c,
                    None if matches!(op, DivI32 | RemI32 | DivI64 | RemI64) => {
                        return Err(ExecError::IntegerTrap)
                    }
                    None => return Err(ExecError::Trap(format!("cannot evaluate {op}"))),
                };
                self.set(inst, result.bits());
                return Ok(Flow::Next);
            }
            _ => {}
        }

        match op {
            Br => return Ok(Flow::Jump(Self::label(inst, 0)?)),
            BrIf => {
                let cond = self.operand(inst, 0)? as u32 != 0;
                let target = Self::label(inst, if cond { 1 } else { 2 })?;
                return Ok(Flow::Jump(target));
            }
            Return => {
                let value = match inst.operands.first() {
                    Some(v) => Some(canon(self.func.return_type, self.value(*v))),
                    None => None,
                };
                return Ok(Flow::Return(value));
            }
            Copy => {
                let v = self.operand(inst, 0)?;
                self.set(inst, v);
            }
            LocalGet => {
                let index = inst.local_index().unwrap_or(0) as usize;
                let v = self.locals[index];
                self.set(inst, v);
            }
            LocalSet => {
                let index = inst.local_index().unwrap_or(0) as usize;
                let v = self.operand(inst, 1)?;
                self.locals[index] = canon(self.func.locals[index], v);
            }
            LoadI32 | LoadI64 => {
                let width = if op == LoadI32 { 4 } else { 8 };
                let range = self.mem_range(self.operand(inst, 0)?, width)?;
                let mut b = [0u8; 8];
                b[..width].copy_from_slice(&self.memory[range]);
                self.set(inst, u64::from_le_bytes(b));
            }
            StoreI32 | StoreI64 => {
                let width = if op == StoreI32 { 4 } else { 8 };
                let range = self.mem_range(self.operand(inst, 0)?, width)?;
                let v = self.operand(inst, 1)?.to_le_bytes();
                self.memory[range].copy_from_slice(&v[..width]);
            }
            NewObject => {
                let r = host::new_object(ctx.heap, self.operand(inst, 0)? as i32)?;
                self.set(inst, r as u32 as u64);
            }
            NewArray => {
                let r = host::new_array(ctx.heap, self.operand(inst, 0)? as i32)?;
                self.set(inst, r as u32 as u64);
            }
            ArrayLength => {
                let n = host::array_length(ctx.heap, self.operand(inst, 0)? as i32);
                self.set(inst, n as u32 as u64);
            }
            ArrayGet => {
                let v = host::array_get(
                    ctx.heap,
                    self.operand(inst, 0)? as i32,
                    self.operand(inst, 1)? as i32,
                );
                self.set(inst, v as u32 as u64);
            }
            ArraySet => host::array_set(
                ctx.heap,
                self.operand(inst, 0)? as i32,
                self.operand(inst, 1)? as i32,
                self.operand(inst, 2)? as i32,
            ),
            GetField => {
                let v = host::get_field(
                    ctx.heap,
                    self.operand(inst, 0)? as i32,
                    self.operand(inst, 1)? as i32,
                );
                self.set(inst, v as u32 as u64);
            }
            SetField => host::set_field(
                ctx.heap,
                self.operand(inst, 0)? as i32,
                self.operand(inst, 1)? as i32,
                self.operand(inst, 2)? as i32,
            ),
            Nop => {}
            _ => return Err(ExecError::Trap(format!("unsupported opcode {op}"))),
        }
        Ok(Flow::Next)
    }
}
