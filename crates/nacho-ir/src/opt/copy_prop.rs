use std::collections::HashMap;

use crate::function::IrFunction;
use crate::inst::IrOpcode;
use crate::types::IrValue;

/// Rewrite uses of copies to their ultimate source.
///
/// Copies are `COPY` instructions and redundant local loads: within a block, a `LOCAL_GET` that
/// follows a `LOCAL_SET` or another `LOCAL_GET` of the same local yields the value already known
/// for that local. Known local values reset at block boundaries; register aliases are global since
/// every register has a single definition.
pub fn run(func: &mut IrFunction) -> usize {
    let mut alias: HashMap<u32, IrValue> = HashMap::new();

    for block in &func.blocks {
        let mut locals: HashMap<u32, IrValue> = HashMap::new();
        for inst in &block.instructions {
            match inst.opcode {
                IrOpcode::Copy => {
                    if let (Some(dst), Some(&src)) = (inst.result_reg(), inst.operands.first()) {
                        if src != IrValue::Register(dst) {
                            alias.insert(dst.id, src);
                        }
                    }
                }
                IrOpcode::LocalGet => {
                    let (Some(index), Some(dst)) = (inst.local_index(), inst.result_reg()) else {
                        continue;
                    };
                    match locals.get(&index) {
                        Some(&known) => {
                            alias.insert(dst.id, known);
                        }
                        None => {
                            locals.insert(index, IrValue::Register(dst));
                        }
                    }
                }
                IrOpcode::LocalSet => {
                    if let (Some(index), Some(&value)) = (inst.local_index(), inst.operands.get(1)) {
                        locals.insert(index, value);
                    }
                }
                _ => {}
            }
        }
    }

    if alias.is_empty() {
        return 0;
    }

    let resolve = |mut v: IrValue| {
        // Bounded walk; a well-formed function has no alias cycles.
        for _ in 0..=alias.len() {
            match v {
                IrValue::Register(r) => match alias.get(&r.id) {
                    Some(&next) => v = next,
                    None => break,
                },
                _ => break,
            }
        }
        v
    };

    let mut rewritten = 0;
    for inst in func.instructions_mut() {
        for operand in &mut inst.operands {
            if !matches!(operand, IrValue::Register(_)) {
                continue;
            }
            let source = resolve(*operand);
            if source != *operand {
                *operand = source;
                rewritten += 1;
            }
        }
    }
    rewritten
}
