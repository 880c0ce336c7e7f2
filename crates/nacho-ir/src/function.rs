use std::collections::BTreeSet;
use std::fmt;

use thiserror::Error;

use crate::inst::{IrInstruction, IrOpcode};
use crate::types::{BlockId, IrType, IrValue};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum IrError {
    #[error("no insertion block selected")]
    NoInsertPoint,
    #[error("block {0} does not exist")]
    UnknownBlock(BlockId),
    #[error("block {0} is already terminated")]
    BlockTerminated(BlockId),
    #[error("block {0} does not end in a terminator")]
    MissingTerminator(BlockId),
    #[error("block {block} has a terminator before its last instruction (index {index})")]
    TerminatorNotLast { block: BlockId, index: usize },
    #[error("virtual register %{0} is not declared")]
    UnknownRegister(u32),
    #[error("local {0} is not declared")]
    UnknownLocal(u32),
    #[error("{opcode} expects {expected} operand(s), got {got}")]
    OperandCount {
        opcode: IrOpcode,
        expected: usize,
        got: usize,
    },
    #[error("function has no blocks")]
    Empty,
}

#[derive(Clone, Debug, PartialEq)]
pub struct IrBasicBlock {
    pub id: BlockId,
    pub label: String,
    pub instructions: Vec<IrInstruction>,
    pub preds: BTreeSet<BlockId>,
    pub succs: BTreeSet<BlockId>,
}

impl IrBasicBlock {
    pub fn new(id: BlockId, label: impl Into<String>) -> Self {
        Self {
            id,
            label: label.into(),
            instructions: Vec::new(),
            preds: BTreeSet::new(),
            succs: BTreeSet::new(),
        }
    }

    pub fn terminator(&self) -> Option<&IrInstruction> {
        self.instructions
            .last()
            .filter(|inst| inst.opcode.is_terminator())
    }

    pub fn is_terminated(&self) -> bool {
        self.terminator().is_some()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct IrFunction {
    pub name: String,
    pub params: Vec<IrType>,
    pub return_type: IrType,
    /// Function locals. In the backend ABI local `i` is register-window slot `i`.
    pub locals: Vec<IrType>,
    /// Type of every virtual register, indexed by register id.
    pub registers: Vec<IrType>,
    pub blocks: Vec<IrBasicBlock>,
    pub entry: BlockId,
}

impl IrFunction {
    pub fn block(&self, id: BlockId) -> Option<&IrBasicBlock> {
        self.blocks.get(id.index())
    }

    pub fn instruction_count(&self) -> usize {
        self.blocks.iter().map(|b| b.instructions.len()).sum()
    }

    pub fn instructions(&self) -> impl Iterator<Item = &IrInstruction> {
        self.blocks.iter().flat_map(|b| b.instructions.iter())
    }

    pub fn instructions_mut(&mut self) -> impl Iterator<Item = &mut IrInstruction> {
        self.blocks.iter_mut().flat_map(|b| b.instructions.iter_mut())
    }

    /// Check the structural invariants the optimizer and backends rely on.
    pub fn verify(&self) -> Result<(), IrError> {
        if self.blocks.is_empty() {
            return Err(IrError::Empty);
        }
        if self.block(self.entry).is_none() {
            return Err(IrError::UnknownBlock(self.entry));
        }

        for (pos, block) in self.blocks.iter().enumerate() {
            debug_assert_eq!(block.id.index(), pos);
            let last = block.instructions.len().checked_sub(1);
            if !block.is_terminated() {
                return Err(IrError::MissingTerminator(block.id));
            }

            for (index, inst) in block.instructions.iter().enumerate() {
                if inst.opcode.is_terminator() && Some(index) != last {
                    return Err(IrError::TerminatorNotLast {
                        block: block.id,
                        index,
                    });
                }
                self.verify_operands(inst)?;
            }
        }
        Ok(())
    }

    fn verify_operands(&self, inst: &IrInstruction) -> Result<(), IrError> {
        let arity = |expected: usize| {
            if inst.operands.len() == expected {
                Ok(())
            } else {
                Err(IrError::OperandCount {
                    opcode: inst.opcode,
                    expected,
                    got: inst.operands.len(),
                })
            }
        };
        match inst.opcode {
            IrOpcode::Br => arity(1)?,
            IrOpcode::BrIf => arity(3)?,
            IrOpcode::LocalGet => arity(1)?,
            IrOpcode::LocalSet => arity(2)?,
            op if op.is_binary() => arity(2)?,
            op if op.is_unary() => arity(1)?,
            _ => {}
        }

        if let Some(idx) = inst.local_index() {
            if idx as usize >= self.locals.len() {
                return Err(IrError::UnknownLocal(idx));
            }
        }

        let values = inst.operands.iter().chain(inst.result.iter());
        for value in values {
            match *value {
                IrValue::Register(r) if r.id as usize >= self.registers.len() => {
                    return Err(IrError::UnknownRegister(r.id));
                }
                IrValue::Label(b) if self.block(b).is_none() => {
                    return Err(IrError::UnknownBlock(b));
                }
                _ => {}
            }
        }
        Ok(())
    }
}

impl fmt::Display for IrFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fn {}(", self.name)?;
        for (i, p) in self.params.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{p}")?;
        }
        writeln!(f, ") -> {} {{", self.return_type)?;
        if !self.locals.is_empty() {
            f.write_str("  locals:")?;
            for (i, ty) in self.locals.iter().enumerate() {
                write!(f, " ${i}:{ty}")?;
            }
            writeln!(f)?;
        }
        for block in &self.blocks {
            let entry = if block.id == self.entry { " (entry)" } else { "" };
            writeln!(f, "{} \"{}\"{entry}:", block.id, block.label)?;
            for inst in &block.instructions {
                writeln!(f, "    {inst}")?;
            }
        }
        f.write_str("}")
    }
}
