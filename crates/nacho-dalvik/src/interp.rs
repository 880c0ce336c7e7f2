//! The Dalvik register-machine interpreter.
//!
//! One frame at a time: [`DalvikInterpreter::execute`] (or [`DalvikInterpreter::load`] followed by
//! [`Cpu::run`]) runs a method's code buffer until a `return*` or the end of the buffer. Heap
//! accesses through absent references are permissive, unlike the x86 memory surface: reads yield
//! zero and writes are dropped.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use nacho_core::{
    ArrayKind, Cpu, CpuFault, DecodeFault, GuestExceptionKind, HaltReason, Heap, HeapObject,
    InterruptHandler, ObjectRef, RunExit, RunState,
};
use nacho_jit::{BackendError, JitConfig};
use thiserror::Error;
use tracing::{trace, warn};

use crate::decode::{self, ArrayData, DecodeError, Instruction};
use crate::jit::DalvikJit;
use crate::opcode::Opcode;

/// Width assumed for an opcode byte the decoder does not know.
const UNKNOWN_OPCODE_WIDTH: u32 = 2;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DalvikConfig {
    /// Number of 32-bit v-registers in a frame.
    pub register_count: usize,
    /// Instructions one `execute()` call may retire before it gives up.
    pub max_instructions: u64,
    pub jit: JitConfig,
}

impl Default for DalvikConfig {
    fn default() -> Self {
        Self {
            register_count: 256,
            max_instructions: 1_000_000,
            jit: JitConfig::dalvik(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DalvikRegisters {
    pub v: Vec<u32>,
    /// Byte offset into the current method's code.
    pub pc: u32,
    /// Slot read by `move-result*`.
    pub result: u64,
    /// Last thrown object, read by `move-exception`.
    pub exception: u32,
}

impl DalvikRegisters {
    pub fn new(count: usize) -> Self {
        Self {
            v: vec![0; count],
            pc: 0,
            result: 0,
            exception: 0,
        }
    }

    pub fn get(&self, index: u32) -> Option<u32> {
        self.v.get(index as usize).copied()
    }

    pub fn set(&mut self, index: u32, value: u32) -> bool {
        match self.v.get_mut(index as usize) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    /// The register pair `index`, `index + 1` (low word first).
    pub fn get_wide(&self, index: u32) -> Option<u64> {
        let lo = self.get(index)?;
        let hi = self.get(index.checked_add(1)?)?;
        Some(u64::from(lo) | (u64::from(hi) << 32))
    }

    pub fn set_wide(&mut self, index: u32, value: u64) -> bool {
        if index as usize + 1 >= self.v.len() {
            return false;
        }
        self.set(index, value as u32) && self.set(index + 1, (value >> 32) as u32)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecOutcome {
    /// Value of a `return`, `return-wide` or `return-object`.
    pub return_value: Option<u64>,
    pub halt: HaltReason,
    /// Whether a compiled unit ran instead of the interpreter.
    pub compiled: bool,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DalvikError {
    #[error("{method}: {fault}")]
    Fault { method: String, fault: CpuFault },
    #[error("{method}: instruction limit of {limit} reached")]
    InstructionLimit { method: String, limit: u64 },
}

struct Frame {
    method: String,
    code: Arc<[u8]>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum PoolConstant {
    String(u32),
    Class(u32),
}

enum Flow {
    Next,
    Jump(usize),
    Halt(HaltReason),
}

#[derive(Clone, Copy)]
enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    Ushr,
    Rsub,
}

use BinOp::*;

/// Operator order shared by the int and long groups of every binary family.
const INTEGER_OPS: [BinOp; 11] = [Add, Sub, Mul, Div, Rem, And, Or, Xor, Shl, Shr, Ushr];
/// The `/lit16` and `/lit8` groups put reverse subtraction where `sub` would be.
const LITERAL_OPS: [BinOp; 11] = [Add, Rsub, Mul, Div, Rem, And, Or, Xor, Shl, Shr, Ushr];

struct DivideByZero;

fn int_op(op: BinOp, a: i32, b: i32) -> Result<i32, DivideByZero> {
    Ok(match op {
        Add => a.wrapping_add(b),
        Sub => a.wrapping_sub(b),
        Rsub => b.wrapping_sub(a),
        Mul => a.wrapping_mul(b),
        Div | Rem if b == 0 => return Err(DivideByZero),
        Div => a.wrapping_div(b),
        Rem => a.wrapping_rem(b),
        And => a & b,
        Or => a | b,
        Xor => a ^ b,
        Shl => a.wrapping_shl(b as u32 & 31),
        Shr => a.wrapping_shr(b as u32 & 31),
        Ushr => ((a as u32) >> (b as u32 & 31)) as i32,
    })
}

fn long_op(op: BinOp, a: i64, b: i64) -> Result<i64, DivideByZero> {
    Ok(match op {
        Add => a.wrapping_add(b),
        Sub => a.wrapping_sub(b),
        Rsub => b.wrapping_sub(a),
        Mul => a.wrapping_mul(b),
        Div | Rem if b == 0 => return Err(DivideByZero),
        Div => a.wrapping_div(b),
        Rem => a.wrapping_rem(b),
        And => a & b,
        Or => a | b,
        Xor => a ^ b,
        Shl => a.wrapping_shl(b as u32 & 63),
        Shr => a.wrapping_shr(b as u32 & 63),
        Ushr => ((a as u64) >> (b as u32 & 63)) as i64,
    })
}

macro_rules! float_op {
    ($op:expr, $a:expr, $b:expr) => {
        match $op {
            Add => $a + $b,
            Sub => $a - $b,
            Mul => $a * $b,
            Div => $a / $b,
            _ => $a % $b,
        }
    };
}

/// `cmpl-*` biases NaN comparisons to -1, `cmpg-*` to 1.
fn compare<T: PartialOrd>(a: T, b: T, nan_bias: i32) -> i32 {
    match a.partial_cmp(&b) {
        Some(std::cmp::Ordering::Less) => -1,
        Some(std::cmp::Ordering::Equal) => 0,
        Some(std::cmp::Ordering::Greater) => 1,
        None => nan_bias,
    }
}

pub struct DalvikInterpreter {
    config: DalvikConfig,
    regs: DalvikRegisters,
    heap: Heap,
    frame: Option<Frame>,
    state: RunState,
    handler: Option<InterruptHandler<DalvikRegisters>>,
    jit: Option<DalvikJit>,
    constants: HashMap<PoolConstant, ObjectRef>,
    return_value: Option<u64>,
    /// Opcode byte of the instruction being executed, for fault reports.
    current: u16,
}

impl fmt::Debug for DalvikInterpreter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DalvikInterpreter")
            .field("method", &self.frame.as_ref().map(|frame| &frame.method))
            .field("pc", &self.regs.pc)
            .field("state", &self.state)
            .field("heap_objects", &self.heap.len())
            .field("jit", &self.jit)
            .finish_non_exhaustive()
    }
}

impl DalvikInterpreter {
    /// An interpreter without a JIT.
    pub fn new(config: DalvikConfig) -> Self {
        Self {
            regs: DalvikRegisters::new(config.register_count),
            heap: Heap::new(),
            frame: None,
            state: RunState::Idle,
            handler: None,
            jit: None,
            constants: HashMap::new(),
            return_value: None,
            current: 0,
            config,
        }
    }

    pub fn with_jit(config: DalvikConfig, jit: DalvikJit) -> Self {
        Self {
            jit: Some(jit),
            ..Self::new(config)
        }
    }

    /// An interpreter with a JIT built from `config.jit`.
    pub fn from_config(config: DalvikConfig) -> Result<Self, BackendError> {
        let jit = DalvikJit::new(config.jit.clone())?;
        Ok(Self::with_jit(config, jit))
    }

    pub fn config(&self) -> &DalvikConfig {
        &self.config
    }

    pub fn regs(&self) -> &DalvikRegisters {
        &self.regs
    }

    pub fn regs_mut(&mut self) -> &mut DalvikRegisters {
        &mut self.regs
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    pub fn jit(&self) -> Option<&DalvikJit> {
        self.jit.as_ref()
    }

    pub fn jit_mut(&mut self) -> Option<&mut DalvikJit> {
        self.jit.as_mut()
    }

    pub fn method(&self) -> Option<&str> {
        self.frame.as_ref().map(|frame| frame.method.as_str())
    }

    /// Value produced by the last `return*` of the loaded frame.
    pub fn return_value(&self) -> Option<u64> {
        self.return_value
    }

    /// Set up a frame for `method` at PC 0. Registers keep their values; they carry arguments.
    pub fn load(&mut self, code: &[u8], method: &str) {
        self.frame = Some(Frame {
            method: method.to_string(),
            code: Arc::from(code),
        });
        self.regs.pc = 0;
        self.return_value = None;
        self.state = RunState::Idle;
    }

    /// Run `method` to completion, preferring a compiled unit when one is cached.
    ///
    /// Every call counts toward the method's hotness, compiled or not; a method that becomes hot
    /// is compiled after the interpreter finishes with it, and later calls run the compiled unit.
    /// A compiled call reports the same halt reason and return value as the interpreted one. A
    /// compiled unit that fails is evicted and the call is interpreted with the registers it
    /// started with.
    pub fn execute(&mut self, code: &[u8], method: &str) -> Result<ExecOutcome, DalvikError> {
        if let Some(jit) = self.jit.as_mut() {
            jit.note_invocation(method, code);
            if let Some(unit) = jit.get_compiled_method(method) {
                match jit.execute(&unit, &mut self.regs, &mut self.heap) {
                    Ok(return_value) => {
                        self.return_value = return_value;
                        self.state = RunState::Idle;
                        let halt = if unit.falls_off_end {
                            HaltReason::EndOfCode
                        } else {
                            HaltReason::Returned
                        };
                        return Ok(ExecOutcome {
                            return_value,
                            halt,
                            compiled: true,
                        });
                    }
                    Err(err) => {
                        warn!(method, %err, "compiled method failed, falling back to the interpreter");
                        jit.evict(method);
                        jit.note_invocation(method, code);
                    }
                }
            }
        }

        self.load(code, method);
        let limit = self.config.max_instructions;
        let exit = self.run(limit);
        if let Some(jit) = self.jit.as_mut() {
            jit.service_queue();
        }

        match exit {
            RunExit::Halted(halt) => Ok(ExecOutcome {
                return_value: self.return_value,
                halt,
                compiled: false,
            }),
            RunExit::Faulted(fault) => Err(DalvikError::Fault {
                method: method.to_string(),
                fault,
            }),
            RunExit::BudgetExhausted => {
                self.state = RunState::Idle;
                Err(DalvikError::InstructionLimit {
                    method: method.to_string(),
                    limit,
                })
            }
        }
    }

    fn decode_fault(&self, reason: &'static str) -> CpuFault {
        CpuFault::Decode(DecodeFault {
            pc: u64::from(self.regs.pc),
            opcode: self.current,
            reason,
        })
    }

    fn vreg(&self, index: u32) -> Result<u32, CpuFault> {
        self.regs
            .get(index)
            .ok_or_else(|| self.decode_fault("register index out of range"))
    }

    fn set_vreg(&mut self, index: u32, value: u32) -> Result<(), CpuFault> {
        if self.regs.set(index, value) {
            Ok(())
        } else {
            Err(self.decode_fault("register index out of range"))
        }
    }

    fn vwide(&self, index: u32) -> Result<u64, CpuFault> {
        self.regs
            .get_wide(index)
            .ok_or_else(|| self.decode_fault("register pair out of range"))
    }

    fn set_vwide(&mut self, index: u32, value: u64) -> Result<(), CpuFault> {
        if self.regs.set_wide(index, value) {
            Ok(())
        } else {
            Err(self.decode_fault("register pair out of range"))
        }
    }

    fn vfloat(&self, index: u32) -> Result<f32, CpuFault> {
        self.vreg(index).map(f32::from_bits)
    }

    fn vdouble(&self, index: u32) -> Result<f64, CpuFault> {
        self.vwide(index).map(f64::from_bits)
    }

    /// Report a guest exception to the handler and turn it into a fault.
    fn raise(&mut self, kind: GuestExceptionKind) -> CpuFault {
        if let GuestExceptionKind::Throw { object } = kind {
            self.regs.exception = object;
        }
        if let Some(handler) = self.handler.as_mut() {
            handler(kind.vector(), &mut self.regs);
        }
        CpuFault::GuestException {
            pc: u64::from(self.regs.pc),
            kind,
        }
    }

    fn branch(&self, code: &[u8], offset: i64) -> Result<Flow, CpuFault> {
        decode::branch_target(code, self.regs.pc as usize, offset)
            .map(Flow::Jump)
            .ok_or_else(|| self.decode_fault("branch target outside the method"))
    }

    fn pool_constant(&mut self, constant: PoolConstant) -> Result<u32, CpuFault> {
        if let Some(obj) = self.constants.get(&constant) {
            if self.heap.contains(*obj) {
                return Ok(obj.bits());
            }
        }
        let object = match constant {
            PoolConstant::String(string_idx) => HeapObject::String { string_idx },
            PoolConstant::Class(type_idx) => HeapObject::Class { type_idx },
        };
        let obj = self
            .heap
            .alloc(object)
            .ok_or_else(|| self.raise(GuestExceptionKind::OutOfMemory))?;
        self.constants.insert(constant, obj);
        Ok(obj.bits())
    }

    fn alloc(&mut self, obj: Option<ObjectRef>) -> Result<u32, CpuFault> {
        match obj {
            Some(obj) => Ok(obj.bits()),
            None => Err(self.raise(GuestExceptionKind::OutOfMemory)),
        }
    }

    /// Decode and execute the instruction at the PC.
    fn dispatch(&mut self) -> Result<Option<HaltReason>, CpuFault> {
        let Some(frame) = self.frame.as_ref() else {
            return Ok(Some(HaltReason::EndOfCode));
        };
        let code = Arc::clone(&frame.code);
        let pc = self.regs.pc as usize;
        if pc >= code.len() {
            return Ok(Some(HaltReason::EndOfCode));
        }
        self.current = u16::from(code[pc]);

        let inst = match decode::decode(&code, pc) {
            Ok(inst) => inst,
            Err(DecodeError::Unknown(opcode)) => {
                warn!(pc, opcode, "unknown Dalvik opcode, skipping");
                self.regs.pc += UNKNOWN_OPCODE_WIDTH;
                return Ok(None);
            }
            Err(DecodeError::Truncated { .. }) => {
                return Err(self.decode_fault("instruction runs past the end of the method"))
            }
            Err(DecodeError::BadPayload { .. }) => {
                return Err(self.decode_fault("malformed payload"))
            }
        };
        trace!(pc, op = %inst.opcode, "dalvik step");

        match self.exec(&code, &inst)? {
            Flow::Next => {
                self.regs.pc += inst.width as u32;
                Ok(None)
            }
            Flow::Jump(target) => {
                self.regs.pc = target as u32;
                Ok(None)
            }
            Flow::Halt(reason) => Ok(Some(reason)),
        }
    }

    fn exec(&mut self, code: &[u8], inst: &Instruction) -> Result<Flow, CpuFault> {
        use Opcode::*;

        let (a, b, c) = (inst.a, inst.b, inst.c);
        let op = inst.opcode;
        match op {
            Nop | MonitorEnter | MonitorExit | CheckCast => {}

            Move | MoveFrom16 | Move16 | MoveObject | MoveObjectFrom16 | MoveObject16 => {
                let value = self.vreg(b)?;
                self.set_vreg(a, value)?;
            }
            MoveWide | MoveWideFrom16 | MoveWide16 => {
                let value = self.vwide(b)?;
                self.set_vwide(a, value)?;
            }
            MoveResult | MoveResultObject => self.set_vreg(a, self.regs.result as u32)?,
            MoveResultWide => self.set_vwide(a, self.regs.result)?,
            MoveException => self.set_vreg(a, self.regs.exception)?,

            ReturnVoid => {
                self.return_value = None;
                return Ok(Flow::Halt(HaltReason::Returned));
            }
            Return | ReturnObject => {
                self.return_value = Some(u64::from(self.vreg(a)?));
                return Ok(Flow::Halt(HaltReason::Returned));
            }
            ReturnWide => {
                self.return_value = Some(self.vwide(a)?);
                return Ok(Flow::Halt(HaltReason::Returned));
            }

            Const4 | Const16 | Const | ConstHigh16 => self.set_vreg(a, inst.literal as u32)?,
            ConstWide16 | ConstWide32 | ConstWide | ConstWideHigh16 => {
                self.set_vwide(a, inst.literal as u64)?
            }
            ConstString | ConstStringJumbo => {
                let obj = self.pool_constant(PoolConstant::String(b))?;
                self.set_vreg(a, obj)?;
            }
            ConstClass => {
                let obj = self.pool_constant(PoolConstant::Class(b))?;
                self.set_vreg(a, obj)?;
            }

            InstanceOf => {
                let obj = self.vreg(b)?;
                self.set_vreg(a, u32::from(obj != 0))?;
            }
            ArrayLength => {
                let array = ObjectRef::from_bits(self.vreg(b)?);
                self.set_vreg(a, self.heap.array_len(array).unwrap_or(0))?;
            }
            NewInstance => {
                let obj = self.heap.alloc_instance(b);
                let obj = self.alloc(obj)?;
                self.set_vreg(a, obj)?;
            }
            NewArray => {
                let len = self.vreg(b)? as i32;
                let Ok(len) = usize::try_from(len) else {
                    return Err(self.raise(GuestExceptionKind::NegativeArraySize));
                };
                let obj = self.heap.alloc_array(ArrayKind::Int, len);
                let obj = self.alloc(obj)?;
                self.set_vreg(a, obj)?;
            }
            FilledNewArray | FilledNewArrayRange => {
                let values = inst
                    .args
                    .iter()
                    .map(|&r| self.vreg(r).map(u64::from))
                    .collect::<Result<Vec<_>, _>>()?;
                let obj = self.heap.alloc_array_from(ArrayKind::Int, values);
                self.regs.result = u64::from(self.alloc(obj)?);
            }
            FillArrayData => {
                let array = ObjectRef::from_bits(self.vreg(a)?);
                let at = decode::branch_target(code, self.regs.pc as usize, inst.literal)
                    .ok_or_else(|| self.decode_fault("payload outside the method"))?;
                let payload =
                    ArrayData::parse(code, at).map_err(|_| self.decode_fault("malformed payload"))?;
                if let Some(HeapObject::Array { data, .. }) = self.heap.get_mut(array) {
                    for (slot, value) in data.iter_mut().zip(payload.elements) {
                        *slot = value;
                    }
                }
            }
            Throw => {
                let object = self.vreg(a)?;
                return Err(self.raise(GuestExceptionKind::Throw { object }));
            }

            Goto | Goto16 | Goto32 => return self.branch(code, inst.literal),
            PackedSwitch | SparseSwitch => {
                let key = self.vreg(a)? as i32;
                let at = decode::branch_target(code, self.regs.pc as usize, inst.literal)
                    .ok_or_else(|| self.decode_fault("payload outside the method"))?;
                let target = if op == Opcode::PackedSwitch {
                    decode::PackedSwitch::parse(code, at).map(|table| table.lookup(key))
                } else {
                    decode::SparseSwitch::parse(code, at).map(|table| table.lookup(key))
                }
                .map_err(|_| self.decode_fault("malformed payload"))?;
                if let Some(offset) = target {
                    return self.branch(code, i64::from(offset));
                }
            }

            CmplFloat | CmpgFloat => {
                let bias = if op == CmplFloat { -1 } else { 1 };
                let r = compare(self.vfloat(b)?, self.vfloat(c)?, bias);
                self.set_vreg(a, r as u32)?;
            }
            CmplDouble | CmpgDouble => {
                let bias = if op == CmplDouble { -1 } else { 1 };
                let r = compare(self.vdouble(b)?, self.vdouble(c)?, bias);
                self.set_vreg(a, r as u32)?;
            }
            CmpLong => {
                let r = compare(self.vwide(b)? as i64, self.vwide(c)? as i64, 0);
                self.set_vreg(a, r as u32)?;
            }

            IfEq | IfNe | IfLt | IfGe | IfGt | IfLe => {
                let (x, y) = (self.vreg(a)? as i32, self.vreg(b)? as i32);
                let taken = match op {
                    IfEq => x == y,
                    IfNe => x != y,
                    IfLt => x < y,
                    IfGe => x >= y,
                    IfGt => x > y,
                    _ => x <= y,
                };
                if taken {
                    return self.branch(code, inst.literal);
                }
            }
            IfEqz | IfNez | IfLtz | IfGez | IfGtz | IfLez => {
                let x = self.vreg(a)? as i32;
                let taken = match op {
                    IfEqz => x == 0,
                    IfNez => x != 0,
                    IfLtz => x < 0,
                    IfGez => x >= 0,
                    IfGtz => x > 0,
                    _ => x <= 0,
                };
                if taken {
                    return self.branch(code, inst.literal);
                }
            }

            Aget | AgetWide | AgetObject | AgetBoolean | AgetByte | AgetChar | AgetShort => {
                let array = ObjectRef::from_bits(self.vreg(b)?);
                let index = self.vreg(c)? as i32;
                let raw = self.heap.array_get(array, index).unwrap_or(0);
                match op {
                    AgetWide => self.set_vwide(a, raw)?,
                    AgetBoolean => self.set_vreg(a, u32::from(raw as u8))?,
                    AgetByte => self.set_vreg(a, raw as i8 as i32 as u32)?,
                    AgetChar => self.set_vreg(a, u32::from(raw as u16))?,
                    AgetShort => self.set_vreg(a, raw as i16 as i32 as u32)?,
                    _ => self.set_vreg(a, raw as u32)?,
                }
            }
            Aput | AputWide | AputObject | AputBoolean | AputByte | AputChar | AputShort => {
                let array = ObjectRef::from_bits(self.vreg(b)?);
                let index = self.vreg(c)? as i32;
                let value = match op {
                    AputWide => self.vwide(a)?,
                    AputBoolean | AputByte => u64::from(self.vreg(a)? as u8),
                    AputChar | AputShort => u64::from(self.vreg(a)? as u16),
                    _ => u64::from(self.vreg(a)?),
                };
                self.heap.array_set(array, index, value);
            }

            Iget | IgetWide | IgetObject | IgetBoolean | IgetByte | IgetChar | IgetShort
            | Iput | IputWide | IputObject | IputBoolean | IputByte | IputChar | IputShort
            | Sget | SgetWide | SgetObject | SgetBoolean | SgetByte | SgetChar | SgetShort
            | Sput | SputWide | SputObject | SputBoolean | SputByte | SputChar | SputShort => {
                trace!(op = %op, "field access not modelled");
            }
            InvokeVirtual | InvokeSuper | InvokeDirect | InvokeStatic | InvokeInterface
            | InvokeVirtualRange | InvokeSuperRange | InvokeDirectRange | InvokeStaticRange
            | InvokeInterfaceRange => {
                trace!(op = %op, method_idx = b, "invoke not modelled");
                self.regs.result = 0;
            }

            NegInt => {
                let v = self.vreg(b)? as i32;
                self.set_vreg(a, v.wrapping_neg() as u32)?;
            }
            NotInt => {
                let v = self.vreg(b)?;
                self.set_vreg(a, !v)?;
            }
            NegLong => {
                let v = self.vwide(b)? as i64;
                self.set_vwide(a, v.wrapping_neg() as u64)?;
            }
            NotLong => {
                let v = self.vwide(b)?;
                self.set_vwide(a, !v)?;
            }
            NegFloat => {
                let v = self.vfloat(b)?;
                self.set_vreg(a, (-v).to_bits())?;
            }
            NegDouble => {
                let v = self.vdouble(b)?;
                self.set_vwide(a, (-v).to_bits())?;
            }
            IntToLong => {
                let v = self.vreg(b)? as i32;
                self.set_vwide(a, i64::from(v) as u64)?;
            }
            IntToFloat => {
                let v = self.vreg(b)? as i32;
                self.set_vreg(a, (v as f32).to_bits())?;
            }
            IntToDouble => {
                let v = self.vreg(b)? as i32;
                self.set_vwide(a, f64::from(v).to_bits())?;
            }
            LongToInt => {
                let v = self.vwide(b)?;
                self.set_vreg(a, v as u32)?;
            }
            LongToFloat => {
                let v = self.vwide(b)? as i64;
                self.set_vreg(a, (v as f32).to_bits())?;
            }
            LongToDouble => {
                let v = self.vwide(b)? as i64;
                self.set_vwide(a, (v as f64).to_bits())?;
            }
            FloatToInt => {
                let v = self.vfloat(b)?;
                self.set_vreg(a, v as i32 as u32)?;
            }
            FloatToLong => {
                let v = self.vfloat(b)?;
                self.set_vwide(a, v as i64 as u64)?;
            }
            FloatToDouble => {
                let v = self.vfloat(b)?;
                self.set_vwide(a, f64::from(v).to_bits())?;
            }
            DoubleToInt => {
                let v = self.vdouble(b)?;
                self.set_vreg(a, v as i32 as u32)?;
            }
            DoubleToLong => {
                let v = self.vdouble(b)?;
                self.set_vwide(a, v as i64 as u64)?;
            }
            DoubleToFloat => {
                let v = self.vdouble(b)?;
                self.set_vreg(a, (v as f32).to_bits())?;
            }
            IntToByte => {
                let v = self.vreg(b)?;
                self.set_vreg(a, v as i8 as i32 as u32)?;
            }
            IntToChar => {
                let v = self.vreg(b)?;
                self.set_vreg(a, u32::from(v as u16))?;
            }
            IntToShort => {
                let v = self.vreg(b)?;
                self.set_vreg(a, v as i16 as i32 as u32)?;
            }

            AddInt | SubInt | MulInt | DivInt | RemInt | AndInt | OrInt | XorInt | ShlInt
            | ShrInt | UshrInt => {
                let bin = INTEGER_OPS[usize::from(op.byte() - AddInt.byte())];
                self.int_binary(bin, a, self.vreg(b)?, self.vreg(c)?)?;
            }
            AddInt2Addr | SubInt2Addr | MulInt2Addr | DivInt2Addr | RemInt2Addr
            | AndInt2Addr | OrInt2Addr | XorInt2Addr | ShlInt2Addr | ShrInt2Addr
            | UshrInt2Addr => {
                let bin = INTEGER_OPS[usize::from(op.byte() - AddInt2Addr.byte())];
                self.int_binary(bin, a, self.vreg(a)?, self.vreg(b)?)?;
            }
            AddIntLit16 | RsubInt | MulIntLit16 | DivIntLit16 | RemIntLit16 | AndIntLit16
            | OrIntLit16 | XorIntLit16 => {
                let bin = LITERAL_OPS[usize::from(op.byte() - AddIntLit16.byte())];
                self.int_binary(bin, a, self.vreg(b)?, inst.literal as u32)?;
            }
            AddIntLit8 | RsubIntLit8 | MulIntLit8 | DivIntLit8 | RemIntLit8 | AndIntLit8
            | OrIntLit8 | XorIntLit8 | ShlIntLit8 | ShrIntLit8 | UshrIntLit8 => {
                let bin = LITERAL_OPS[usize::from(op.byte() - AddIntLit8.byte())];
                self.int_binary(bin, a, self.vreg(b)?, inst.literal as u32)?;
            }

            AddLong | SubLong | MulLong | DivLong | RemLong | AndLong | OrLong | XorLong
            | ShlLong | ShrLong | UshrLong => {
                let bin = INTEGER_OPS[usize::from(op.byte() - AddLong.byte())];
                let rhs = self.long_rhs(bin, c)?;
                self.long_binary(bin, a, self.vwide(b)?, rhs)?;
            }
            AddLong2Addr | SubLong2Addr | MulLong2Addr | DivLong2Addr | RemLong2Addr
            | AndLong2Addr | OrLong2Addr | XorLong2Addr | ShlLong2Addr | ShrLong2Addr
            | UshrLong2Addr => {
                let bin = INTEGER_OPS[usize::from(op.byte() - AddLong2Addr.byte())];
                let rhs = self.long_rhs(bin, b)?;
                self.long_binary(bin, a, self.vwide(a)?, rhs)?;
            }

            AddFloat | SubFloat | MulFloat | DivFloat | RemFloat => {
                let bin = INTEGER_OPS[usize::from(op.byte() - AddFloat.byte())];
                let (x, y) = (self.vfloat(b)?, self.vfloat(c)?);
                let r: f32 = float_op!(bin, x, y);
                self.set_vreg(a, r.to_bits())?;
            }
            AddFloat2Addr | SubFloat2Addr | MulFloat2Addr | DivFloat2Addr | RemFloat2Addr => {
                let bin = INTEGER_OPS[usize::from(op.byte() - AddFloat2Addr.byte())];
                let (x, y) = (self.vfloat(a)?, self.vfloat(b)?);
                let r: f32 = float_op!(bin, x, y);
                self.set_vreg(a, r.to_bits())?;
            }
            AddDouble | SubDouble | MulDouble | DivDouble | RemDouble => {
                let bin = INTEGER_OPS[usize::from(op.byte() - AddDouble.byte())];
                let (x, y) = (self.vdouble(b)?, self.vdouble(c)?);
                let r: f64 = float_op!(bin, x, y);
                self.set_vwide(a, r.to_bits())?;
            }
            AddDouble2Addr | SubDouble2Addr | MulDouble2Addr | DivDouble2Addr
            | RemDouble2Addr => {
                let bin = INTEGER_OPS[usize::from(op.byte() - AddDouble2Addr.byte())];
                let (x, y) = (self.vdouble(a)?, self.vdouble(b)?);
                let r: f64 = float_op!(bin, x, y);
                self.set_vwide(a, r.to_bits())?;
            }
        }
        Ok(Flow::Next)
    }

    fn int_binary(&mut self, op: BinOp, dst: u32, lhs: u32, rhs: u32) -> Result<(), CpuFault> {
        match int_op(op, lhs as i32, rhs as i32) {
            Ok(r) => self.set_vreg(dst, r as u32),
            Err(DivideByZero) => Err(self.raise(GuestExceptionKind::DivideByZero)),
        }
    }

    /// Long shifts take their count from a single int register.
    fn long_rhs(&self, op: BinOp, reg: u32) -> Result<u64, CpuFault> {
        match op {
            Shl | Shr | Ushr => self.vreg(reg).map(u64::from),
            _ => self.vwide(reg),
        }
    }

    fn long_binary(&mut self, op: BinOp, dst: u32, lhs: u64, rhs: u64) -> Result<(), CpuFault> {
        match long_op(op, lhs as i64, rhs as i64) {
            Ok(r) => self.set_vwide(dst, r as u64),
            Err(DivideByZero) => Err(self.raise(GuestExceptionKind::DivideByZero)),
        }
    }
}

impl Cpu for DalvikInterpreter {
    type Registers = DalvikRegisters;

    fn step(&mut self) -> Result<Option<HaltReason>, CpuFault> {
        match self.dispatch() {
            Ok(None) => Ok(None),
            Ok(Some(reason)) => {
                self.state = RunState::Idle;
                Ok(Some(reason))
            }
            Err(fault) => {
                self.state = RunState::Idle;
                Err(fault)
            }
        }
    }

    fn run(&mut self, cycles: u64) -> RunExit {
        self.state = RunState::Running;
        for _ in 0..cycles {
            match self.dispatch() {
                Ok(None) => {}
                Ok(Some(reason)) => {
                    self.state = RunState::Idle;
                    return RunExit::Halted(reason);
                }
                Err(fault) => {
                    self.state = RunState::Idle;
                    return RunExit::Faulted(fault);
                }
            }
        }
        RunExit::BudgetExhausted
    }

    /// Clear the register file and the heap, and restart the loaded method. Compiled methods are
    /// kept.
    fn reset(&mut self) {
        self.regs = DalvikRegisters::new(self.config.register_count);
        self.heap.clear();
        self.constants.clear();
        self.return_value = None;
        self.state = RunState::Idle;
    }

    fn registers(&self) -> DalvikRegisters {
        self.regs.clone()
    }

    fn set_registers(&mut self, regs: DalvikRegisters) {
        self.regs = regs;
    }

    fn set_interrupt_handler(&mut self, handler: InterruptHandler<DalvikRegisters>) {
        self.handler = Some(handler);
    }

    fn state(&self) -> RunState {
        self.state
    }
}
