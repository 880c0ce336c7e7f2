//! x86 basic block → IR.
//!
//! Guest registers live in IR locals `0..8` (64-bit) and EFLAGS in local 8. Inside the block
//! registers are cached as 32-bit values and written back (zero-extended) before every exit.
//! Flags are lazy: only the result of the last flag-writing instruction is kept, and ZF/SF are
//! materialized into the EFLAGS local at exit.

use nacho_core::MemorySurface;
use nacho_ir::{IrBuilder, IrError, IrOpcode, IrType, IrValue};
use nacho_jit::{AbortReason, CompilationAbort, Translation};

use crate::decode::{fetch, Cond, DecodeError, DecodedInstruction, FetchError, Mnemonic, Operand};
use crate::regs::{Eflags, Gpr};

use super::EFLAGS_SLOT;

const ZS_MASK: u32 = Eflags::ZF.bits() | Eflags::SF.bits();

#[derive(Clone, Copy)]
struct Cached {
    value: IrValue,
    dirty: bool,
}

struct BlockTranslator<'b> {
    b: &'b mut IrBuilder,
    regs: [Option<Cached>; 8],
    /// 32-bit result that ZF/SF currently describe, if written inside this block.
    flags: Option<IrValue>,
    pc: u64,
}

/// What a translated instruction did to control flow.
enum Flow {
    Continue,
    Jump(u32),
    Branch { cond: Cond, taken: u32, fallthrough: u32 },
}

impl<'b> BlockTranslator<'b> {
    fn new(b: &'b mut IrBuilder) -> Self {
        Self {
            b,
            regs: [None; 8],
            flags: None,
            pc: 0,
        }
    }

    fn read(&mut self, reg: Gpr) -> Result<IrValue, IrError> {
        if let Some(cached) = self.regs[reg.index()] {
            return Ok(cached.value);
        }
        let wide = self.b.emit_local_get(reg.index() as u32)?;
        let value = self.b.emit_unary_op(IrOpcode::WrapI64, wide)?;
        self.regs[reg.index()] = Some(Cached {
            value,
            dirty: false,
        });
        Ok(value)
    }

    fn write(&mut self, reg: Gpr, value: IrValue) {
        self.regs[reg.index()] = Some(Cached { value, dirty: true });
    }

    fn operand(&mut self, op: &Operand) -> Result<IrValue, CompilationAbort> {
        match op {
            Operand::Register(reg) => Ok(self.read(*reg)?),
            Operand::Immediate(imm) => Ok(self.b.create_constant(*imm as i32)),
            Operand::Memory(_) | Operand::Relative(_) => Err(
                CompilationAbort::unsupported_operand(self.pc, "non-register source"),
            ),
        }
    }

    fn dest(&self, dst: Option<Gpr>) -> Result<Gpr, CompilationAbort> {
        dst.ok_or(CompilationAbort::unsupported_operand(
            self.pc,
            "non-register destination",
        ))
    }

    fn eflags(&mut self) -> Result<IrValue, IrError> {
        let wide = self.b.emit_local_get(EFLAGS_SLOT)?;
        self.b.emit_unary_op(IrOpcode::WrapI64, wide)
    }

    /// Store dirty registers and pending flags back to their locals.
    fn flush(&mut self) -> Result<(), IrError> {
        for reg in Gpr::ALL {
            if let Some(cached) = self.regs[reg.index()].as_mut() {
                if cached.dirty {
                    let wide = self.b.emit_unary_op(IrOpcode::ExtendI32U, cached.value)?;
                    self.b.emit_local_set(reg.index() as u32, wide)?;
                    cached.dirty = false;
                }
            }
        }
        if let Some(result) = self.flags {
            let old = self.eflags()?;
            let keep = self.b.create_constant(!ZS_MASK as i32);
            let kept = self.b.emit_bin_op(IrOpcode::AndI32, old, keep)?;
            let zf = self.b.emit_unary_op(IrOpcode::EqzI32, result)?;
            let six = self.b.create_constant(6);
            let zf = self.b.emit_bin_op(IrOpcode::ShlI32, zf, six)?;
            let thirty_one = self.b.create_constant(31);
            let sf = self.b.emit_bin_op(IrOpcode::UShrI32, result, thirty_one)?;
            let seven = self.b.create_constant(7);
            let sf = self.b.emit_bin_op(IrOpcode::ShlI32, sf, seven)?;
            let merged = self.b.emit_bin_op(IrOpcode::OrI32, kept, zf)?;
            let merged = self.b.emit_bin_op(IrOpcode::OrI32, merged, sf)?;
            let wide = self.b.emit_unary_op(IrOpcode::ExtendI32U, merged)?;
            self.b.emit_local_set(EFLAGS_SLOT, wide)?;
        }
        Ok(())
    }

    /// 1 when `cond` holds, 0 otherwise.
    fn condition(&mut self, cond: Cond) -> Result<IrValue, IrError> {
        let (bit, negate) = match cond {
            Cond::Z => (6, false),
            Cond::Nz => (6, true),
            Cond::S => (7, false),
            Cond::Ns => (7, true),
        };
        let set = match self.flags {
            Some(result) if bit == 6 => self.b.emit_unary_op(IrOpcode::EqzI32, result)?,
            Some(result) => {
                let thirty_one = self.b.create_constant(31);
                self.b.emit_bin_op(IrOpcode::UShrI32, result, thirty_one)?
            }
            None => {
                let flags = self.eflags()?;
                let shift = self.b.create_constant(bit);
                let shifted = self.b.emit_bin_op(IrOpcode::UShrI32, flags, shift)?;
                let one = self.b.create_constant(1);
                self.b.emit_bin_op(IrOpcode::AndI32, shifted, one)?
            }
        };
        if negate {
            self.b.emit_unary_op(IrOpcode::EqzI32, set)
        } else {
            Ok(set)
        }
    }

    fn instruction(&mut self, inst: &DecodedInstruction) -> Result<Flow, CompilationAbort> {
        self.pc = u64::from(inst.pc);
        self.b.set_source_pc(Some(self.pc));
        let ops = &inst.operands;
        let dst = match ops.first() {
            Some(Operand::Register(reg)) => Some(*reg),
            _ => None,
        };

        match inst.mnemonic {
            Mnemonic::Nop => {}
            Mnemonic::Mov => {
                let value = self.operand(&ops[1])?;
                self.write(self.dest(dst)?, value);
            }
            Mnemonic::Add
            | Mnemonic::Or
            | Mnemonic::And
            | Mnemonic::Sub
            | Mnemonic::Xor
            | Mnemonic::Cmp
            | Mnemonic::Test
            | Mnemonic::Imul => {
                let opcode = match inst.mnemonic {
                    Mnemonic::Add => IrOpcode::AddI32,
                    Mnemonic::Or => IrOpcode::OrI32,
                    Mnemonic::And | Mnemonic::Test => IrOpcode::AndI32,
                    Mnemonic::Sub | Mnemonic::Cmp => IrOpcode::SubI32,
                    Mnemonic::Xor => IrOpcode::XorI32,
                    _ => IrOpcode::MulI32,
                };
                let lhs = self.operand(&ops[0])?;
                let rhs = self.operand(&ops[1])?;
                let result = self.b.emit_bin_op(opcode, lhs, rhs)?;
                if !matches!(inst.mnemonic, Mnemonic::Cmp | Mnemonic::Test) {
                    self.write(self.dest(dst)?, result);
                }
                self.flags = Some(result);
            }
            Mnemonic::Inc | Mnemonic::Dec => {
                let opcode = if inst.mnemonic == Mnemonic::Inc {
                    IrOpcode::AddI32
                } else {
                    IrOpcode::SubI32
                };
                let value = self.operand(&ops[0])?;
                let one = self.b.create_constant(1);
                let result = self.b.emit_bin_op(opcode, value, one)?;
                self.write(self.dest(dst)?, result);
                self.flags = Some(result);
            }
            Mnemonic::Neg => {
                let value = self.operand(&ops[0])?;
                let result = self.b.emit_unary_op(IrOpcode::NegI32, value)?;
                self.write(self.dest(dst)?, result);
                self.flags = Some(result);
            }
            Mnemonic::Not => {
                let value = self.operand(&ops[0])?;
                let result = self.b.emit_unary_op(IrOpcode::NotI32, value)?;
                self.write(self.dest(dst)?, result);
            }
            Mnemonic::Shl | Mnemonic::Shr | Mnemonic::Sar => {
                let count = match ops[1] {
                    Operand::Immediate(count) => (count & 31) as i32,
                    _ => 0,
                };
                if count != 0 {
                    let opcode = match inst.mnemonic {
                        Mnemonic::Shl => IrOpcode::ShlI32,
                        Mnemonic::Shr => IrOpcode::UShrI32,
                        _ => IrOpcode::ShrI32,
                    };
                    let value = self.operand(&ops[0])?;
                    let count = self.b.create_constant(count);
                    let result = self.b.emit_bin_op(opcode, value, count)?;
                    self.write(self.dest(dst)?, result);
                    self.flags = Some(result);
                }
            }
            Mnemonic::Jmp => {
                return Ok(Flow::Jump(inst.branch_target().unwrap_or(inst.next_pc())));
            }
            Mnemonic::Jcc(cond) => {
                return Ok(Flow::Branch {
                    cond,
                    taken: inst.branch_target().unwrap_or(inst.next_pc()),
                    fallthrough: inst.next_pc(),
                });
            }
            _ => {
                return Err(CompilationAbort::unsupported_opcode(self.pc, inst.opcode));
            }
        }
        Ok(Flow::Continue)
    }

    fn exit(&mut self, next_pc: u32) -> Result<(), IrError> {
        self.flush()?;
        let target = self.b.create_constant(next_pc as i32);
        self.b.emit_return(Some(target))
    }

    fn branch(&mut self, cond: Cond, taken: u32, fallthrough: u32) -> Result<(), IrError> {
        self.flush()?;
        let holds = self.condition(cond)?;
        let taken_block = self.b.create_block("taken");
        let fallthrough_block = self.b.create_block("fallthrough");
        self.b.emit_branch_if(holds, taken_block, fallthrough_block)?;
        for (block, pc) in [(taken_block, taken), (fallthrough_block, fallthrough)] {
            self.b.set_insert_point(block)?;
            let target = self.b.create_constant(pc as i32);
            self.b.emit_return(Some(target))?;
        }
        Ok(())
    }
}

/// Why `inst` cannot be part of a compiled block, if it cannot.
fn unsupported(inst: &DecodedInstruction) -> Option<AbortReason> {
    let pc = u64::from(inst.pc);
    if inst.rex.is_some() {
        return Some(AbortReason::UnsupportedOperand {
            pc,
            what: "REX prefix",
        });
    }
    if inst.has_memory_operand() {
        return Some(AbortReason::UnsupportedOperand {
            pc,
            what: "memory operand",
        });
    }
    match inst.mnemonic {
        Mnemonic::Nop
        | Mnemonic::Mov
        | Mnemonic::Add
        | Mnemonic::Or
        | Mnemonic::And
        | Mnemonic::Sub
        | Mnemonic::Xor
        | Mnemonic::Cmp
        | Mnemonic::Test
        | Mnemonic::Inc
        | Mnemonic::Dec
        | Mnemonic::Not
        | Mnemonic::Neg
        | Mnemonic::Imul
        | Mnemonic::Shl
        | Mnemonic::Shr
        | Mnemonic::Sar
        | Mnemonic::Jmp
        | Mnemonic::Jcc(_) => None,
        Mnemonic::Hlt
        | Mnemonic::Push
        | Mnemonic::Pop
        | Mnemonic::Call
        | Mnemonic::Ret
        | Mnemonic::Int => Some(AbortReason::UnsupportedOpcode {
            pc,
            opcode: inst.opcode,
        }),
    }
}

fn fetch_error(pc: u32, err: FetchError) -> AbortReason {
    let pc = u64::from(pc);
    match err {
        FetchError::Memory(_) | FetchError::Decode(DecodeError::Truncated { .. }) => {
            AbortReason::Truncated { pc }
        }
        FetchError::Decode(DecodeError::Unknown { opcode, .. })
        | FetchError::Decode(DecodeError::Unsupported { opcode, .. }) => {
            AbortReason::UnsupportedOpcode { pc, opcode }
        }
    }
}

/// Translate the basic block starting at `start` into a function `() -> i32` returning the next
/// EIP.
///
/// The block ends after a `JMP`/`Jcc`, after `max_insts` instructions, or just before the first
/// instruction that cannot be compiled. If that is the very first instruction the translation
/// aborts.
pub fn translate_block<M: MemorySurface + ?Sized>(
    b: &mut IrBuilder,
    memory: &M,
    start: u32,
    max_insts: usize,
) -> Result<Translation, CompilationAbort> {
    let entry = b.create_block("entry");
    for _ in Gpr::ALL {
        b.declare_local(IrType::I64);
    }
    b.declare_local(IrType::I64);
    b.set_insert_point(entry)?;

    let mut t = BlockTranslator::new(b);
    let mut pc = start;
    let mut count = 0u32;

    loop {
        if count as usize >= max_insts.max(1) {
            t.exit(pc)?;
            break;
        }
        let inst = match fetch(memory, pc) {
            Ok(inst) => inst,
            Err(err) if count == 0 => return Err(CompilationAbort::new(fetch_error(pc, err))),
            Err(_) => {
                t.exit(pc)?;
                break;
            }
        };
        if let Some(reason) = unsupported(&inst) {
            if count == 0 {
                return Err(CompilationAbort::new(reason));
            }
            t.exit(pc)?;
            break;
        }

        count += 1;
        let next = inst.next_pc();
        match t.instruction(&inst)? {
            Flow::Continue => pc = next,
            Flow::Jump(target) => {
                pc = next;
                t.exit(target)?;
                break;
            }
            Flow::Branch {
                cond,
                taken,
                fallthrough,
            } => {
                pc = next;
                t.branch(cond, taken, fallthrough)?;
                break;
            }
        }
    }

    t.b.set_source_pc(None);
    let func = t.b.finish(format!("x86_block_{start:x}"), IrType::I32)?;
    Ok(Translation {
        func,
        guest_instructions: count,
        source_len: pc.wrapping_sub(start),
        falls_off_end: false,
    })
}

#[cfg(test)]
mod tests {
    use nacho_core::FlatMemory;

    use super::*;

    fn memory(code: &[u8]) -> FlatMemory {
        let mut mem = FlatMemory::new(0x100);
        mem.load(0, code).unwrap();
        mem
    }

    #[test]
    fn block_ends_at_jump() {
        // add eax, ebx; jmp 0
        let mem = memory(&[0x01, 0xd8, 0xeb, 0xfc, 0x90]);
        let mut b = IrBuilder::new();
        let t = translate_block(&mut b, &mem, 0, 64).unwrap();
        assert_eq!(t.guest_instructions, 2);
        assert_eq!(t.source_len, 4);
        assert_eq!(t.func.locals.len(), 9);
        assert_eq!(t.func.return_type, IrType::I32);
    }

    #[test]
    fn block_stops_before_uncompilable_instruction() {
        // mov eax, 1; push eax
        let mem = memory(&[0xb8, 1, 0, 0, 0, 0x50]);
        let mut b = IrBuilder::new();
        let t = translate_block(&mut b, &mem, 0, 64).unwrap();
        assert_eq!(t.guest_instructions, 1);
        assert_eq!(t.source_len, 5);
    }

    #[test]
    fn leading_uncompilable_instruction_aborts() {
        let mem = memory(&[0x50]);
        let mut b = IrBuilder::new();
        let err = translate_block(&mut b, &mem, 0, 64).unwrap_err();
        assert_eq!(
            err.reason,
            AbortReason::UnsupportedOpcode {
                pc: 0,
                opcode: 0x50
            }
        );

        let mem = memory(&[0x01, 0x00]);
        let err = translate_block(&mut b, &mem, 0, 64).unwrap_err();
        assert!(matches!(
            err.reason,
            AbortReason::UnsupportedOperand {
                what: "memory operand",
                ..
            }
        ));
    }

    #[test]
    fn conditional_branch_has_two_exits() {
        // sub eax, 1; jnz -5
        let mem = memory(&[0x83, 0xe8, 0x01, 0x75, 0xfb]);
        let mut b = IrBuilder::new();
        let t = translate_block(&mut b, &mem, 0, 64).unwrap();
        assert_eq!(t.func.blocks.len(), 3);
        assert_eq!(t.source_len, 5);
    }
}
