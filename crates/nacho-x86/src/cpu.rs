use nacho_core::{
    Cpu, CpuFault, DecodeFault, HaltReason, InterruptHandler, MemoryFault, MemorySurface, RunExit,
    RunState,
};
use tracing::{trace, warn};

use crate::decode::{fetch, DecodeError, DecodedInstruction, FetchError, Mnemonic, Operand};
use crate::jit::X86Jit;
use crate::regs::{Gpr, X86Registers};

/// x86 interpreter over a caller-supplied memory surface, with an optional basic-block JIT.
pub struct X86Cpu<M> {
    regs: X86Registers,
    memory: M,
    state: RunState,
    /// CALLs not yet matched by a RET. A RET at depth zero halts.
    call_depth: u32,
    handler: Option<InterruptHandler<X86Registers>>,
    jit: Option<X86Jit>,
    /// The next instruction starts a basic block (entry point or control-transfer target).
    at_leader: bool,
    entry: u32,
}

impl<M: MemorySurface> X86Cpu<M> {
    pub fn new(memory: M) -> Self {
        Self {
            regs: X86Registers::default(),
            memory,
            state: RunState::Idle,
            call_depth: 0,
            handler: None,
            jit: None,
            at_leader: true,
            entry: 0,
        }
    }

    pub fn with_jit(memory: M, jit: X86Jit) -> Self {
        Self {
            jit: Some(jit),
            ..Self::new(memory)
        }
    }

    /// Set the address `reset()` starts from, and jump there.
    pub fn set_entry(&mut self, eip: u32) {
        self.entry = eip;
        self.regs.eip = eip;
        self.at_leader = true;
    }

    pub fn memory(&self) -> &M {
        &self.memory
    }

    /// Direct memory access. Writes through this handle do not invalidate compiled blocks; use
    /// [`X86Cpu::load`] for code.
    pub fn memory_mut(&mut self) -> &mut M {
        &mut self.memory
    }

    /// Copy `bytes` into guest memory and drop compiled blocks built from the old contents.
    pub fn load(&mut self, addr: u64, bytes: &[u8]) -> Result<(), MemoryFault> {
        self.memory.load(addr, bytes)?;
        if let Some(jit) = self.jit.as_mut() {
            jit.invalidate(addr, bytes.len() as u64);
        }
        Ok(())
    }

    pub fn jit(&self) -> Option<&X86Jit> {
        self.jit.as_ref()
    }

    pub fn jit_mut(&mut self) -> Option<&mut X86Jit> {
        self.jit.as_mut()
    }

    pub fn call_depth(&self) -> u32 {
        self.call_depth
    }

    /// One instruction or compiled block within a budget of `budget` cycles.
    fn dispatch(&mut self, budget: u64) -> Result<(u64, Option<HaltReason>), CpuFault> {
        if self.at_leader {
            if let Some(retired) = self.run_compiled(budget) {
                self.service_jit();
                return Ok((retired, None));
            }
        }
        let result = self.interpret();
        self.service_jit();
        result.map(|halt| (1, halt))
    }

    fn run_compiled(&mut self, budget: u64) -> Option<u64> {
        let jit = self.jit.as_mut()?;
        let eip = self.regs.eip;
        let unit = jit.get_compiled_function(eip)?;
        let cost = u64::from(unit.guest_instructions);
        if cost > budget {
            return None;
        }
        match jit.execute(&unit, &mut self.regs) {
            Ok(()) => {
                jit.note_dispatch(eip);
                trace!(eip, next = self.regs.eip, cost, "ran compiled block");
                self.at_leader = true;
                Some(cost)
            }
            Err(err) => {
                warn!(eip, %err, "compiled block failed; evicting and interpreting");
                jit.evict(eip);
                None
            }
        }
    }

    fn service_jit(&mut self) {
        if let Some(jit) = self.jit.as_mut() {
            jit.service_queue(&self.memory);
        }
    }

    fn interpret(&mut self) -> Result<Option<HaltReason>, CpuFault> {
        let pc = self.regs.eip;
        if self.at_leader {
            if let Some(jit) = self.jit.as_mut() {
                jit.note_dispatch(pc);
            }
        }

        let inst = match fetch(&self.memory, pc) {
            Ok(inst) => inst,
            Err(FetchError::Memory(fault)) => return Err(fault.into()),
            Err(FetchError::Decode(err)) => {
                self.regs.eip = pc.wrapping_add(u32::from(err.consumed()));
                let (opcode, reason) = match err {
                    DecodeError::Unknown { opcode, .. } => (opcode, "unknown opcode"),
                    DecodeError::Unsupported { opcode, reason, .. } => (opcode, reason),
                    DecodeError::Truncated { .. } => (0, "truncated instruction"),
                };
                warn!(pc, opcode, reason, "x86 decode fault; halting");
                return Err(DecodeFault {
                    pc: u64::from(pc),
                    opcode,
                    reason,
                }
                .into());
            }
        };
        trace!(pc, %inst, "dispatch");

        let halt = self.execute(&inst)?;
        self.at_leader = inst.is_control_flow() || halt.is_some();
        Ok(halt)
    }

    fn read(&self, op: &Operand, width: u32) -> u64 {
        let value = match *op {
            Operand::Register(reg) => self.regs.get64(reg),
            Operand::Immediate(imm) => imm as u64,
            Operand::Memory(_) | Operand::Relative(_) => 0,
        };
        truncate(value, width)
    }

    fn write(&mut self, op: &Operand, value: u64, width: u32) {
        if let Operand::Register(reg) = *op {
            if width == 64 {
                self.regs.set64(reg, value);
            } else {
                self.regs.set32(reg, value as u32);
            }
        }
    }

    fn push32(&mut self, value: u32) -> Result<(), MemoryFault> {
        let esp = self.regs.get32(Gpr::Esp).wrapping_sub(4);
        self.memory.write_u32(u64::from(esp), value)?;
        self.regs.set32(Gpr::Esp, esp);
        if let Some(jit) = self.jit.as_mut() {
            jit.invalidate(u64::from(esp), 4);
        }
        Ok(())
    }

    fn pop32(&mut self) -> Result<u32, MemoryFault> {
        let esp = self.regs.get32(Gpr::Esp);
        let value = self.memory.read_u32(u64::from(esp))?;
        self.regs.set32(Gpr::Esp, esp.wrapping_add(4));
        Ok(value)
    }

    fn execute(&mut self, inst: &DecodedInstruction) -> Result<Option<HaltReason>, CpuFault> {
        let next = inst.next_pc();
        let width = if inst.wide() { 64 } else { 32 };
        let ops = inst.operands.as_slice();

        if inst.has_memory_operand() {
            warn!(pc = inst.pc, %inst, "memory operand not modelled; skipping");
            self.regs.eip = next;
            return Ok(None);
        }

        match inst.mnemonic {
            Mnemonic::Nop => {}
            Mnemonic::Hlt => {
                self.regs.eip = next;
                return Ok(Some(HaltReason::Hlt));
            }
            Mnemonic::Mov => {
                let value = self.read(&ops[1], width);
                self.write(&ops[0], value, width);
            }
            Mnemonic::Add
            | Mnemonic::Or
            | Mnemonic::And
            | Mnemonic::Sub
            | Mnemonic::Xor
            | Mnemonic::Cmp
            | Mnemonic::Test
            | Mnemonic::Imul => {
                let a = self.read(&ops[0], width);
                let b = self.read(&ops[1], width);
                let result = match inst.mnemonic {
                    Mnemonic::Add => a.wrapping_add(b),
                    Mnemonic::Or => a | b,
                    Mnemonic::And | Mnemonic::Test => a & b,
                    Mnemonic::Sub | Mnemonic::Cmp => a.wrapping_sub(b),
                    Mnemonic::Xor => a ^ b,
                    _ => a.wrapping_mul(b),
                };
                let result = truncate(result, width);
                if !matches!(inst.mnemonic, Mnemonic::Cmp | Mnemonic::Test) {
                    self.write(&ops[0], result, width);
                }
                self.regs.eflags.set_zs(result, width);
            }
            Mnemonic::Inc | Mnemonic::Dec | Mnemonic::Neg | Mnemonic::Not => {
                let a = self.read(&ops[0], width);
                let result = truncate(
                    match inst.mnemonic {
                        Mnemonic::Inc => a.wrapping_add(1),
                        Mnemonic::Dec => a.wrapping_sub(1),
                        Mnemonic::Neg => a.wrapping_neg(),
                        _ => !a,
                    },
                    width,
                );
                self.write(&ops[0], result, width);
                if inst.mnemonic != Mnemonic::Not {
                    self.regs.eflags.set_zs(result, width);
                }
            }
            Mnemonic::Shl | Mnemonic::Shr | Mnemonic::Sar => {
                let count = (self.read(&ops[1], width) & u64::from(width - 1)) as u32;
                if count != 0 {
                    let a = self.read(&ops[0], width);
                    let result = match inst.mnemonic {
                        Mnemonic::Shl => a << count,
                        Mnemonic::Shr => a >> count,
                        _ => (sign_extend(a, width) >> count) as u64,
                    };
                    let result = truncate(result, width);
                    self.write(&ops[0], result, width);
                    self.regs.eflags.set_zs(result, width);
                }
            }
            Mnemonic::Push => {
                let value = self.read(&ops[0], 32) as u32;
                self.push32(value)?;
            }
            Mnemonic::Pop => {
                let value = self.pop32()?;
                self.write(&ops[0], u64::from(value), 32);
            }
            Mnemonic::Call => {
                self.push32(next)?;
                self.call_depth += 1;
                self.regs.eip = inst.branch_target().unwrap_or(next);
                return Ok(None);
            }
            Mnemonic::Ret => {
                if self.call_depth == 0 {
                    self.regs.eip = next;
                    return Ok(Some(HaltReason::ReturnFromTop));
                }
                self.regs.eip = self.pop32()?;
                self.call_depth -= 1;
                return Ok(None);
            }
            Mnemonic::Jmp => {
                self.regs.eip = inst.branch_target().unwrap_or(next);
                return Ok(None);
            }
            Mnemonic::Jcc(cond) => {
                self.regs.eip = if cond.holds(self.regs.zf(), self.regs.sf()) {
                    inst.branch_target().unwrap_or(next)
                } else {
                    next
                };
                return Ok(None);
            }
            Mnemonic::Int => {
                let vector = self.read(&ops[0], 32) as u8;
                self.regs.eip = next;
                match self.handler.as_mut() {
                    Some(handler) => handler(vector, &mut self.regs),
                    None => warn!(vector, "INT with no interrupt handler installed"),
                }
                return Ok(None);
            }
        }

        self.regs.eip = next;
        Ok(None)
    }
}

fn truncate(value: u64, width: u32) -> u64 {
    if width >= 64 {
        value
    } else {
        value & ((1u64 << width) - 1)
    }
}

fn sign_extend(value: u64, width: u32) -> i64 {
    let shift = 64 - width;
    ((value << shift) as i64) >> shift
}

impl<M: MemorySurface> Cpu for X86Cpu<M> {
    type Registers = X86Registers;

    fn step(&mut self) -> Result<Option<HaltReason>, CpuFault> {
        match self.dispatch(u64::MAX) {
            Ok((_, None)) => Ok(None),
            Ok((_, Some(reason))) => {
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
        let mut retired = 0u64;
        while retired < cycles {
            match self.dispatch(cycles - retired) {
                Ok((n, None)) => retired += n,
                Ok((_, Some(reason))) => {
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

    fn reset(&mut self) {
        self.regs = X86Registers {
            eip: self.entry,
            ..X86Registers::default()
        };
        self.state = RunState::Idle;
        self.call_depth = 0;
        self.at_leader = true;
    }

    fn registers(&self) -> X86Registers {
        self.regs.clone()
    }

    fn set_registers(&mut self, regs: X86Registers) {
        self.regs = regs;
        self.at_leader = true;
    }

    fn set_interrupt_handler(&mut self, handler: InterruptHandler<X86Registers>) {
        self.handler = Some(handler);
    }

    fn state(&self) -> RunState {
        self.state
    }
}
