use std::collections::HashMap;

use crate::function::IrFunction;
use crate::inst::IrOpcode;
use crate::types::{IrType, IrValue};

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct ExprKey {
    opcode: IrOpcode,
    ty: IrType,
    operands: Vec<IrValue>,
}

/// Block-local common-subexpression elimination over pure instructions.
///
/// The expression table is cleared at every block boundary. A repeated expression is rewritten
/// into a `COPY` of the first result; copy propagation then redirects its users.
pub fn run(func: &mut IrFunction) -> usize {
    let mut replaced = 0;
    for block in &mut func.blocks {
        let mut seen: HashMap<ExprKey, IrValue> = HashMap::new();
        for inst in &mut block.instructions {
            if !inst.opcode.is_pure() {
                continue;
            }
            let Some(result) = inst.result else {
                continue;
            };
            let key = ExprKey {
                opcode: inst.opcode,
                ty: inst.ty,
                operands: inst.operands.clone(),
            };
            match seen.get(&key) {
                Some(&earlier) => {
                    inst.make_copy(earlier);
                    replaced += 1;
                }
                None => {
                    seen.insert(key, result);
                }
            }
        }
    }
    replaced
}
