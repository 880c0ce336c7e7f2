use std::collections::HashMap;

use crate::eval::eval;
use crate::function::IrFunction;
use crate::inst::{IrOpcode, OpCategory};
use crate::types::{Constant, IrType, IrValue};

fn foldable(op: IrOpcode) -> bool {
    match op.category() {
        OpCategory::Arithmetic | OpCategory::Bitwise | OpCategory::Conversion => {
            op.result_type().is_some_and(IrType::is_integer)
        }
        OpCategory::Compare => true,
        _ => false,
    }
}

/// Evaluate integer operations whose operands are all known constants.
///
/// Operands resolve either to literal constants or to registers defined by a `CONST_*`
/// instruction. A folded instruction becomes a `CONST_*` load of the result. `BR_IF` on a known
/// condition becomes an unconditional `BR`.
pub fn run(func: &mut IrFunction) -> usize {
    let mut known: HashMap<u32, Constant> = HashMap::new();
    for inst in func.instructions() {
        if inst.opcode.category() == OpCategory::Constant {
            if let (Some(r), Some(IrValue::Constant(c))) = (inst.result_reg(), inst.operands.first()) {
                known.insert(r.id, *c);
            }
        }
    }

    let resolve = |known: &HashMap<u32, Constant>, v: &IrValue| match *v {
        IrValue::Constant(c) => Some(c),
        IrValue::Register(r) => known.get(&r.id).copied(),
        IrValue::Label(_) => None,
    };

    let mut folded = 0;
    let mut dropped_edges = Vec::new();
    for block in &mut func.blocks {
        let block_id = block.id;
        for inst in &mut block.instructions {
            if inst.opcode == IrOpcode::BrIf {
                let cond = inst.operands.first().and_then(|v| resolve(&known, v));
                let (Some(Constant::I32(cond)), Some(t), Some(f)) = (
                    cond,
                    inst.operands.get(1).and_then(|v| v.as_label()),
                    inst.operands.get(2).and_then(|v| v.as_label()),
                ) else {
                    continue;
                };
                let (taken, untaken) = if cond != 0 { (t, f) } else { (f, t) };
                inst.opcode = IrOpcode::Br;
                inst.operands = vec![IrValue::Label(taken)];
                if taken != untaken {
                    dropped_edges.push((block_id, untaken));
                }
                folded += 1;
                continue;
            }

            if !foldable(inst.opcode) {
                continue;
            }
            let args: Option<Vec<Constant>> =
                inst.operands.iter().map(|v| resolve(&known, v)).collect();
            let Some(value) = args.and_then(|args| eval(inst.opcode, &args)) else {
                continue;
            };
            inst.make_const(value);
            if let Some(r) = inst.result_reg() {
                known.insert(r.id, value);
            }
            folded += 1;
        }
    }

    for (from, to) in dropped_edges {
        func.blocks[from.index()].succs.remove(&to);
        func.blocks[to.index()].preds.remove(&from);
    }
    folded
}
