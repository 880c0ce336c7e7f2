//! Dalvik method → IR.
//!
//! v-register `n` lives in IR local `n` (I32). Every basic block starts at a leader (method entry,
//! branch target, or the instruction after a branch or return) and the end of the code buffer
//! gets a `return-void` block when control can fall off it.

use std::collections::{BTreeMap, BTreeSet};

use nacho_ir::{BlockId, IrBuilder, IrOpcode, IrType, IrValue};
use nacho_jit::abi::MAX_WINDOW_SLOTS;
use nacho_jit::{AbortReason, CompilationAbort, Translation};

use crate::decode::{self, DecodeError, Instruction};
use crate::opcode::{Format, Opcode};

struct Decoded {
    pc: usize,
    inst: Instruction,
}

/// Registers an instruction reads or writes, or `None` if the JIT cannot compile it.
fn register_operands(inst: &Instruction) -> Option<Vec<u32>> {
    use Opcode::*;

    let (a, b, c) = (inst.a, inst.b, inst.c);
    Some(match inst.opcode {
        Nop | ReturnVoid | Goto | Goto16 | Goto32 => vec![],
        Const4 | Const16 | Const | ConstHigh16 | NewInstance | Return | ReturnObject | IfEqz
        | IfNez | IfLtz | IfGez | IfGtz | IfLez => vec![a],
        Move | MoveFrom16 | Move16 | MoveObject | MoveObjectFrom16 | MoveObject16 | NegInt
        | NotInt | IntToByte | IntToChar | IntToShort | ArrayLength | NewArray | IfEq | IfNe
        | IfLt | IfGe | IfGt | IfLe => vec![a, b],
        op if binary_ir(op).is_some() => match op.format() {
            Format::F23x => vec![a, b, c],
            _ => vec![a, b],
        },
        Aget | Aput => vec![a, b, c],
        _ => return None,
    })
}

/// IR operator for an int binary opcode (any form), and whether its operands are swapped.
fn binary_ir(op: Opcode) -> Option<(IrOpcode, bool)> {
    use Opcode::*;

    Some(match op {
        AddInt | AddInt2Addr | AddIntLit16 | AddIntLit8 => (IrOpcode::AddI32, false),
        SubInt | SubInt2Addr => (IrOpcode::SubI32, false),
        RsubInt | RsubIntLit8 => (IrOpcode::SubI32, true),
        MulInt | MulInt2Addr | MulIntLit16 | MulIntLit8 => (IrOpcode::MulI32, false),
        AndInt | AndInt2Addr | AndIntLit16 | AndIntLit8 => (IrOpcode::AndI32, false),
        OrInt | OrInt2Addr | OrIntLit16 | OrIntLit8 => (IrOpcode::OrI32, false),
        XorInt | XorInt2Addr | XorIntLit16 | XorIntLit8 => (IrOpcode::XorI32, false),
        ShlInt | ShlInt2Addr | ShlIntLit8 => (IrOpcode::ShlI32, false),
        ShrInt | ShrInt2Addr | ShrIntLit8 => (IrOpcode::ShrI32, false),
        UshrInt | UshrInt2Addr | UshrIntLit8 => (IrOpcode::UShrI32, false),
        _ => return None,
    })
}

fn compare_ir(op: Opcode) -> Option<IrOpcode> {
    use Opcode::*;

    Some(match op {
        IfEq | IfEqz => IrOpcode::EqI32,
        IfNe | IfNez => IrOpcode::NeI32,
        IfLt | IfLtz => IrOpcode::LtI32,
        IfGe | IfGez => IrOpcode::GeI32,
        IfGt | IfGtz => IrOpcode::GtI32,
        IfLe | IfLez => IrOpcode::LeI32,
        _ => return None,
    })
}

fn ends_flow(op: Opcode) -> bool {
    op.is_return() || matches!(op, Opcode::Goto | Opcode::Goto16 | Opcode::Goto32)
}

fn decode_all(code: &[u8], max_insts: usize) -> Result<Vec<Decoded>, CompilationAbort> {
    let mut insts = Vec::new();
    let mut pc = 0;
    while pc < code.len() {
        let inst = decode::decode(code, pc).map_err(|err| match err {
            DecodeError::Unknown(opcode) => {
                CompilationAbort::unsupported_opcode(pc as u64, u16::from(opcode))
            }
            DecodeError::Truncated { .. } => {
                CompilationAbort::new(AbortReason::Truncated { pc: pc as u64 })
            }
            DecodeError::BadPayload { .. } => {
                CompilationAbort::unsupported_operand(pc as u64, "malformed payload")
            }
        })?;
        let width = inst.width;
        // Payload tables are data, not instructions.
        if !(inst.opcode == Opcode::Nop && width > 2) {
            if insts.len() == max_insts {
                return Err(CompilationAbort::unsupported_operand(
                    pc as u64,
                    "method longer than the JIT limit",
                ));
            }
            insts.push(Decoded { pc, inst });
        }
        pc += width;
    }
    Ok(insts)
}

struct MethodTranslator<'b> {
    b: &'b mut IrBuilder,
    blocks: BTreeMap<usize, BlockId>,
}

impl MethodTranslator<'_> {
    fn get(&mut self, reg: u32) -> Result<IrValue, CompilationAbort> {
        Ok(self.b.emit_local_get(reg)?)
    }

    fn set(&mut self, reg: u32, value: IrValue) -> Result<(), CompilationAbort> {
        Ok(self.b.emit_local_set(reg, value)?)
    }

    fn block_at(&self, pc: usize) -> Result<BlockId, CompilationAbort> {
        self.blocks
            .get(&pc)
            .copied()
            .ok_or_else(|| CompilationAbort::unsupported_operand(pc as u64, "branch target"))
    }

    fn target(&self, d: &Decoded) -> Result<BlockId, CompilationAbort> {
        let target = d.pc as i64 + d.inst.literal * 2;
        usize::try_from(target)
            .map_err(|_| {
                CompilationAbort::unsupported_operand(d.pc as u64, "branch outside the method")
            })
            .and_then(|target| self.block_at(target))
    }

    fn translate(&mut self, d: &Decoded) -> Result<(), CompilationAbort> {
        use Opcode::*;

        let inst = &d.inst;
        let (a, b, c) = (inst.a, inst.b, inst.c);
        let op = inst.opcode;
        match op {
            Nop => {}
            Move | MoveFrom16 | Move16 | MoveObject | MoveObjectFrom16 | MoveObject16 => {
                let v = self.get(b)?;
                self.set(a, v)?;
            }
            Const4 | Const16 | Const | ConstHigh16 => {
                let v = self.b.create_constant(inst.literal as i32);
                self.set(a, v)?;
            }
            NegInt | NotInt | IntToByte | IntToChar | IntToShort => {
                let unary = match op {
                    NegInt => IrOpcode::NegI32,
                    NotInt => IrOpcode::NotI32,
                    IntToByte => IrOpcode::Extend8S,
                    IntToChar => IrOpcode::Zext16,
                    _ => IrOpcode::Extend16S,
                };
                let v = self.get(b)?;
                let r = self.b.emit_unary_op(unary, v)?;
                self.set(a, r)?;
            }
            Goto | Goto16 | Goto32 => {
                let target = self.target(d)?;
                self.b.emit_branch(target)?;
            }
            IfEq | IfNe | IfLt | IfGe | IfGt | IfLe | IfEqz | IfNez | IfLtz | IfGez | IfGtz
            | IfLez => {
                let cmp = compare_ir(op).ok_or_else(|| {
                    CompilationAbort::unsupported_opcode(d.pc as u64, op.byte().into())
                })?;
                let lhs = self.get(a)?;
                let rhs = if op.format() == Format::F22t {
                    self.get(b)?
                } else {
                    self.b.create_constant(0)
                };
                let cond = self.b.emit_bin_op(cmp, lhs, rhs)?;
                let taken = self.target(d)?;
                let fallthrough = self.block_at(d.pc + inst.width)?;
                self.b.emit_branch_if(cond, taken, fallthrough)?;
            }
            ArrayLength => {
                let array = self.get(b)?;
                let len = self.b.emit_unary_op(IrOpcode::ArrayLength, array)?;
                self.set(a, len)?;
            }
            NewArray => {
                let len = self.get(b)?;
                let array = self.b.emit_unary_op(IrOpcode::NewArray, len)?;
                self.set(a, array)?;
            }
            NewInstance => {
                let type_idx = self.b.create_constant(b as i32);
                let obj = self.b.emit_unary_op(IrOpcode::NewObject, type_idx)?;
                self.set(a, obj)?;
            }
            Aget => {
                let array = self.get(b)?;
                let index = self.get(c)?;
                let v = self
                    .b
                    .emit_typed(IrOpcode::ArrayGet, IrType::I32, vec![array, index])?;
                self.set(a, v)?;
            }
            Aput => {
                let array = self.get(b)?;
                let index = self.get(c)?;
                let v = self.get(a)?;
                self.b
                    .emit(IrOpcode::ArraySet, IrType::Void, vec![array, index, v], None)?;
            }
            Return | ReturnObject => {
                let v = self.get(a)?;
                self.b.emit_return(Some(v))?;
            }
            ReturnVoid => self.b.emit_return(None)?,
            _ => {
                let Some((bin, swapped)) = binary_ir(op) else {
                    return Err(CompilationAbort::unsupported_opcode(
                        d.pc as u64,
                        op.byte().into(),
                    ));
                };
                let (lhs, rhs) = match op.format() {
                    Format::F23x => (self.get(b)?, self.get(c)?),
                    Format::F12x => (self.get(a)?, self.get(b)?),
                    _ => (self.get(b)?, self.b.create_constant(inst.literal as i32)),
                };
                let (lhs, rhs) = if swapped { (rhs, lhs) } else { (lhs, rhs) };
                let r = self.b.emit_bin_op(bin, lhs, rhs)?;
                self.set(a, r)?;
            }
        }
        Ok(())
    }
}

/// Translate the whole of `code` into one IR function.
///
/// Aborts on the first instruction outside the compiled subset, on methods that return both
/// values and nothing, on methods that both `return-void` and run off the end of their code, and
/// on methods that touch registers outside the execution window.
pub fn translate_method(
    b: &mut IrBuilder,
    method: &str,
    code: &[u8],
    max_insts: usize,
) -> Result<Translation, CompilationAbort> {
    let insts = decode_all(code, max_insts)?;
    if insts.is_empty() {
        return Err(CompilationAbort::new(AbortReason::Empty));
    }

    let mut max_reg = None;
    let mut returns_value = false;
    let mut returns_void = false;
    for d in &insts {
        let regs = register_operands(&d.inst).ok_or_else(|| {
            CompilationAbort::unsupported_opcode(d.pc as u64, d.inst.opcode.byte().into())
        })?;
        for reg in regs {
            if reg >= MAX_WINDOW_SLOTS {
                return Err(CompilationAbort::unsupported_operand(
                    d.pc as u64,
                    "register outside the JIT window",
                ));
            }
            max_reg = max_reg.max(Some(reg));
        }
        match d.inst.opcode {
            Opcode::ReturnVoid => returns_void = true,
            op if op.is_return() => returns_value = true,
            _ => {}
        }
    }

    let mut leaders = BTreeSet::from([0]);
    for d in &insts {
        let next = d.pc + d.inst.width;
        if d.inst.opcode.is_branch() {
            let target = d.pc as i64 + d.inst.literal * 2;
            if !(0..code.len() as i64).contains(&target) {
                return Err(CompilationAbort::unsupported_operand(
                    d.pc as u64,
                    "branch outside the method",
                ));
            }
            leaders.insert(target as usize);
        }
        if (d.inst.opcode.is_branch() || d.inst.opcode.is_return()) && next < code.len() {
            leaders.insert(next);
        }
    }
    let starts: BTreeSet<usize> = insts.iter().map(|d| d.pc).collect();
    if let Some(&bad) = leaders.iter().find(|pc| !starts.contains(pc)) {
        return Err(CompilationAbort::unsupported_operand(
            bad as u64,
            "branch into the middle of an instruction",
        ));
    }
    let last = &insts[insts.len() - 1];
    let falls_off = !ends_flow(last.inst.opcode);
    if falls_off {
        if returns_void {
            return Err(CompilationAbort::new(AbortReason::MixedExits));
        }
        leaders.insert(code.len());
        returns_void = true;
    }
    if returns_value && returns_void {
        return Err(CompilationAbort::new(AbortReason::MixedReturnTypes));
    }
    let return_type = if returns_value {
        IrType::I32
    } else {
        IrType::Void
    };

    if let Some(max_reg) = max_reg {
        for _ in 0..=max_reg {
            b.declare_local(IrType::I32);
        }
    }
    let blocks = leaders
        .iter()
        .map(|&pc| (pc, b.create_block(format!("pc_{pc:x}"))))
        .collect();

    let mut t = MethodTranslator { b, blocks };
    for d in &insts {
        if let Some(&block) = t.blocks.get(&d.pc) {
            if d.pc != 0 && !t.b.is_terminated() {
                t.b.emit_branch(block)?;
            }
            t.b.set_insert_point(block)?;
        }
        t.b.set_source_pc(Some(d.pc as u64));
        t.translate(d)?;
    }
    if let Some(&end) = t.blocks.get(&code.len()) {
        if !t.b.is_terminated() {
            t.b.emit_branch(end)?;
        }
        t.b.set_insert_point(end)?;
        t.b.set_source_pc(None);
        t.b.emit_return(None)?;
    }

    let func = t.b.finish(format!("dalvik_{method}"), return_type)?;
    Ok(Translation {
        func,
        guest_instructions: insts.len() as u32,
        source_len: code.len() as u32,
        falls_off_end: falls_off,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn code(units: &[u16]) -> Vec<u8> {
        units.iter().flat_map(|u| u.to_le_bytes()).collect()
    }

    #[test]
    fn counted_loop_has_one_block_per_leader() {
        // 0: const/4 v0, 0
        // 2: add-int/lit8 v0, v0, 1
        // 6: if-lt v0, v1, -2 (back to 2)
        // a: return v0
        let method = code(&[0x0012, 0x00d8, 0x0100, 0x1034, 0xfffe, 0x000f]);
        let mut b = IrBuilder::new();
        let t = translate_method(&mut b, "loop", &method, 4096).unwrap();
        assert_eq!(t.guest_instructions, 4);
        assert_eq!(t.source_len, 12);
        assert_eq!(t.func.locals.len(), 2);
        assert_eq!(t.func.return_type, IrType::I32);
        // pc 0, 2 (target) and 10 (after the branch)
        assert_eq!(t.func.blocks.len(), 3);
    }

    #[test]
    fn falling_off_the_end_returns_void() {
        // const/4 v3, 1
        let mut b = IrBuilder::new();
        let t = translate_method(&mut b, "m", &code(&[0x1312]), 4096).unwrap();
        assert_eq!(t.func.return_type, IrType::Void);
        assert_eq!(t.func.locals.len(), 4);
        assert!(t.falls_off_end);

        // const/4 v3, 1; return-void
        let mut b = IrBuilder::new();
        let t = translate_method(&mut b, "m", &code(&[0x1312, 0x000e]), 4096).unwrap();
        assert!(!t.falls_off_end);
    }

    #[test]
    fn returning_and_falling_off_abort() {
        // if-eqz v0, +3; return-void; const/4 v1, 0
        let mut b = IrBuilder::new();
        let err = translate_method(&mut b, "m", &code(&[0x0038, 0x0003, 0x000e, 0x0112]), 4096)
            .unwrap_err();
        assert_eq!(err.reason, AbortReason::MixedExits);
    }

    #[test]
    fn mixed_returns_abort() {
        // if-eqz v0, +3; return v0; return-void
        let mut b = IrBuilder::new();
        let err = translate_method(&mut b, "m", &code(&[0x0038, 0x0003, 0x000f, 0x000e]), 4096)
            .unwrap_err();
        assert_eq!(err.reason, AbortReason::MixedReturnTypes);
    }

    #[test]
    fn division_is_not_compiled() {
        // div-int v0, v1, v2; return v0
        let mut b = IrBuilder::new();
        let err = translate_method(&mut b, "m", &code(&[0x0093, 0x0201, 0x000f]), 4096)
            .unwrap_err();
        assert_eq!(
            err.reason,
            AbortReason::UnsupportedOpcode { pc: 0, opcode: 0x93 }
        );
    }

    #[test]
    fn long_methods_abort() {
        let mut b = IrBuilder::new();
        let err = translate_method(&mut b, "m", &code(&[0; 8]), 4).unwrap_err();
        assert!(matches!(err.reason, AbortReason::UnsupportedOperand { pc: 8, .. }));
    }
}
