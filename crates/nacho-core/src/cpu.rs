//! The capability shared by the x86 and Dalvik register machines.
//!
//! The two interpreters keep separate decode/dispatch tables and register files; they are unified
//! only here, at the [`Cpu`] boundary.

use thiserror::Error;

use crate::memory::MemoryFault;

/// Externally visible execution state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RunState {
    #[default]
    Idle,
    Running,
}

/// Why a CPU left the `Running` state without faulting.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HaltReason {
    /// x86 `HLT`.
    Hlt,
    /// x86 `RET` executed with an empty call stack.
    ReturnFromTop,
    /// The Dalvik program counter reached the end of the method's code buffer.
    EndOfCode,
    /// A Dalvik `return*` opcode completed the frame.
    Returned,
}

/// Result of a bounded `run(cycles)` call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RunExit {
    /// The cycle budget ran out; the CPU stays `Running` and may be resumed.
    BudgetExhausted,
    Halted(HaltReason),
    Faulted(CpuFault),
}

/// Instruction bytes the decoder could not map to a supported instruction.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
#[error("decode fault at pc=0x{pc:x}: {reason} (opcode 0x{opcode:02x})")]
pub struct DecodeFault {
    pub pc: u64,
    pub opcode: u16,
    pub reason: &'static str,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GuestExceptionKind {
    /// Explicit `throw` of the given object reference bits.
    Throw { object: u32 },
    DivideByZero,
    NegativeArraySize,
    OutOfMemory,
}

impl GuestExceptionKind {
    /// Vector reported to the interrupt handler before the exception is surfaced.
    pub fn vector(self) -> u8 {
        match self {
            GuestExceptionKind::Throw { .. } => 0x00,
            GuestExceptionKind::DivideByZero => 0x01,
            GuestExceptionKind::NegativeArraySize => 0x02,
            GuestExceptionKind::OutOfMemory => 0x03,
        }
    }
}

/// A fault that ends the current run. The CPU is `Idle` once this has been reported.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CpuFault {
    #[error(transparent)]
    Decode(#[from] DecodeFault),
    #[error(transparent)]
    Memory(#[from] MemoryFault),
    #[error("guest exception {kind:?} at pc=0x{pc:x}")]
    GuestException { pc: u64, kind: GuestExceptionKind },
}

/// Callback invoked synchronously on a software interrupt (or a guest exception, for Dalvik).
pub type InterruptHandler<R> = Box<dyn FnMut(u8, &mut R)>;

pub trait Cpu {
    type Registers: Clone;

    /// Execute exactly one guest instruction (or one compiled unit).
    ///
    /// Returns `Ok(Some(reason))` when the instruction halted the CPU.
    fn step(&mut self) -> Result<Option<HaltReason>, CpuFault>;

    /// Step until halted, faulted, or `cycles` instructions have been retired.
    fn run(&mut self, cycles: u64) -> RunExit;

    fn reset(&mut self);

    fn registers(&self) -> Self::Registers;

    fn set_registers(&mut self, regs: Self::Registers);

    fn set_interrupt_handler(&mut self, handler: InterruptHandler<Self::Registers>);

    fn state(&self) -> RunState;
}
