use crate::function::{IrBasicBlock, IrError, IrFunction};
use crate::inst::{IrInstruction, IrMetadata, IrOpcode};
use crate::types::{BlockId, Constant, IrType, IrValue, VReg};

/// Incremental constructor for [`IrFunction`]s.
///
/// A builder is owned by a JIT front end and reused across compilation units: [`IrBuilder::finish`]
/// hands the blocks over and [`IrBuilder::reset`] clears counters, keeping allocations around.
#[derive(Debug, Default)]
pub struct IrBuilder {
    blocks: Vec<IrBasicBlock>,
    registers: Vec<IrType>,
    locals: Vec<IrType>,
    insert: Option<BlockId>,
    source_pc: Option<u64>,
}

impl IrBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear all blocks, registers and locals so the next unit starts numbering from zero.
    pub fn reset(&mut self) {
        self.blocks.clear();
        self.registers.clear();
        self.locals.clear();
        self.insert = None;
        self.source_pc = None;
    }

    pub fn create_block(&mut self, label: impl Into<String>) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(IrBasicBlock::new(id, label));
        id
    }

    pub fn set_insert_point(&mut self, block: BlockId) -> Result<(), IrError> {
        if block.index() >= self.blocks.len() {
            return Err(IrError::UnknownBlock(block));
        }
        self.insert = Some(block);
        Ok(())
    }

    pub fn insert_point(&self) -> Option<BlockId> {
        self.insert
    }

    /// Whether the current insertion block already ends in a terminator.
    pub fn is_terminated(&self) -> bool {
        self.insert
            .and_then(|b| self.blocks.get(b.index()))
            .is_some_and(IrBasicBlock::is_terminated)
    }

    pub fn block(&self, id: BlockId) -> Option<&IrBasicBlock> {
        self.blocks.get(id.index())
    }

    /// Attach the guest PC to every instruction emitted until the next call.
    pub fn set_source_pc(&mut self, pc: Option<u64>) {
        self.source_pc = pc;
    }

    pub fn create_register(&mut self, ty: IrType) -> IrValue {
        let id = self.registers.len() as u32;
        self.registers.push(ty);
        IrValue::Register(VReg { id, ty })
    }

    pub fn create_constant(&self, value: impl Into<Constant>) -> IrValue {
        IrValue::Constant(value.into())
    }

    pub fn declare_local(&mut self, ty: IrType) -> u32 {
        self.locals.push(ty);
        (self.locals.len() - 1) as u32
    }

    pub fn local_type(&self, index: u32) -> Option<IrType> {
        self.locals.get(index as usize).copied()
    }

    pub fn emit(
        &mut self,
        opcode: IrOpcode,
        ty: IrType,
        operands: Vec<IrValue>,
        result: Option<IrValue>,
    ) -> Result<(), IrError> {
        let block = self.insert.ok_or(IrError::NoInsertPoint)?;
        let source_pc = self.source_pc;
        let target = self
            .blocks
            .get_mut(block.index())
            .ok_or(IrError::UnknownBlock(block))?;
        if target.is_terminated() {
            return Err(IrError::BlockTerminated(block));
        }
        let mut inst = IrInstruction::new(opcode, ty, operands, result);
        inst.meta = source_pc.map(IrMetadata::SourcePc);
        target.instructions.push(inst);
        Ok(())
    }

    /// Emit an instruction into a freshly allocated result register of type `ty`.
    fn emit_value(
        &mut self,
        opcode: IrOpcode,
        ty: IrType,
        operands: Vec<IrValue>,
    ) -> Result<IrValue, IrError> {
        let result = self.create_register(ty);
        self.emit(opcode, ty, operands, Some(result))?;
        Ok(result)
    }

    pub fn emit_bin_op(
        &mut self,
        opcode: IrOpcode,
        lhs: IrValue,
        rhs: IrValue,
    ) -> Result<IrValue, IrError> {
        let ty = opcode.result_type().unwrap_or(lhs.ty());
        self.emit_value(opcode, ty, vec![lhs, rhs])
    }

    pub fn emit_unary_op(&mut self, opcode: IrOpcode, value: IrValue) -> Result<IrValue, IrError> {
        let ty = opcode.result_type().unwrap_or(value.ty());
        self.emit_value(opcode, ty, vec![value])
    }

    /// Materialise `value` into a register with a `CONST_*` instruction.
    pub fn emit_const(&mut self, value: impl Into<Constant>) -> Result<IrValue, IrError> {
        let c = value.into();
        self.emit_value(IrOpcode::const_for(c), c.ty(), vec![IrValue::Constant(c)])
    }

    pub fn emit_copy(&mut self, value: IrValue) -> Result<IrValue, IrError> {
        self.emit_value(IrOpcode::Copy, value.ty(), vec![value])
    }

    pub fn emit_local_get(&mut self, index: u32) -> Result<IrValue, IrError> {
        let ty = self.local_type(index).ok_or(IrError::UnknownLocal(index))?;
        self.emit_value(IrOpcode::LocalGet, ty, vec![local_operand(index)])
    }

    pub fn emit_local_set(&mut self, index: u32, value: IrValue) -> Result<(), IrError> {
        if self.local_type(index).is_none() {
            return Err(IrError::UnknownLocal(index));
        }
        self.emit(
            IrOpcode::LocalSet,
            IrType::Void,
            vec![local_operand(index), value],
            None,
        )
    }

    /// Emit an instruction with a result of type `ty` (used for ops whose type is not implied by
    /// the opcode, such as `ARRAY_GET`).
    pub fn emit_typed(
        &mut self,
        opcode: IrOpcode,
        ty: IrType,
        operands: Vec<IrValue>,
    ) -> Result<IrValue, IrError> {
        self.emit_value(opcode, ty, operands)
    }

    pub fn emit_branch(&mut self, target: BlockId) -> Result<(), IrError> {
        let from = self.insert.ok_or(IrError::NoInsertPoint)?;
        self.check_block(target)?;
        self.emit(IrOpcode::Br, IrType::Void, vec![IrValue::Label(target)], None)?;
        self.link(from, target);
        Ok(())
    }

    pub fn emit_branch_if(
        &mut self,
        cond: IrValue,
        then_block: BlockId,
        else_block: BlockId,
    ) -> Result<(), IrError> {
        let from = self.insert.ok_or(IrError::NoInsertPoint)?;
        self.check_block(then_block)?;
        self.check_block(else_block)?;
        self.emit(
            IrOpcode::BrIf,
            IrType::Void,
            vec![cond, IrValue::Label(then_block), IrValue::Label(else_block)],
            None,
        )?;
        self.link(from, then_block);
        self.link(from, else_block);
        Ok(())
    }

    pub fn emit_return(&mut self, value: Option<IrValue>) -> Result<(), IrError> {
        let ty = value.map_or(IrType::Void, IrValue::ty);
        self.emit(IrOpcode::Return, ty, value.into_iter().collect(), None)
    }

    fn check_block(&self, id: BlockId) -> Result<(), IrError> {
        match self.blocks.get(id.index()) {
            Some(_) => Ok(()),
            None => Err(IrError::UnknownBlock(id)),
        }
    }

    fn link(&mut self, from: BlockId, to: BlockId) {
        self.blocks[from.index()].succs.insert(to);
        self.blocks[to.index()].preds.insert(from);
    }

    /// Package everything built since the last reset into a verified function.
    ///
    /// The first created block is the entry. The builder is reset afterwards.
    pub fn finish(
        &mut self,
        name: impl Into<String>,
        return_type: IrType,
    ) -> Result<IrFunction, IrError> {
        let func = IrFunction {
            name: name.into(),
            params: Vec::new(),
            return_type,
            locals: std::mem::take(&mut self.locals),
            registers: std::mem::take(&mut self.registers),
            blocks: std::mem::take(&mut self.blocks),
            entry: BlockId(0),
        };
        self.reset();
        func.verify()?;
        Ok(func)
    }
}

fn local_operand(index: u32) -> IrValue {
    IrValue::Constant(Constant::I32(index as i32))
}
