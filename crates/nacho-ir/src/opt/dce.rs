use std::collections::HashSet;

use crate::function::IrFunction;

/// Drop instructions whose result is never referenced and that have no side effects.
///
/// Liveness is a single sweep: every register used as an operand anywhere in the function is
/// live. Chains of dead values shrink by one link per run.
pub fn run(func: &mut IrFunction) -> usize {
    let live: HashSet<u32> = func
        .instructions()
        .flat_map(|inst| inst.operand_regs())
        .map(|r| r.id)
        .collect();

    let mut removed = 0;
    for block in &mut func.blocks {
        let before = block.instructions.len();
        block.instructions.retain(|inst| {
            inst.opcode.has_side_effects()
                || inst.result_reg().is_some_and(|r| live.contains(&r.id))
        });
        removed += before - block.instructions.len();
    }
    removed
}
