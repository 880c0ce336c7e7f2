//! IR → WebAssembly lowering.
//!
//! ## Module shape
//!
//! - imports: `env.memory` plus the object-model host functions from [`crate::abi`]
//! - one function, exported as [`abi::EXPORT_ENTRY`], with signature `(window_ptr: i32) -> ret`
//!
//! ## Control flow
//!
//! IR blocks become arms of a dispatch loop. A `label` local holds the index of the next block;
//! `br_table` jumps into the matching arm:
//!
//! ```text
//! loop
//!   block ... block          ;; one per IR block
//!     local.get $label
//!     br_table 0 1 .. n-1
//!   end  <code for block 0>  ;; ends with `br $loop` or `return`
//!   ...
//!   end  <code for block n-1>
//! end
//! unreachable
//! ```
//!
//! Every virtual register gets its own wasm local, so no stack scheduling is needed.

use wasm_encoder::{
    BlockType, CodeSection, EntityType, ExportKind, ExportSection, Function, FunctionSection,
    ImportSection, Instruction, MemArg, MemoryType, Module, TypeSection, ValType,
};

use nacho_ir::{IrFunction, IrInstruction, IrOpcode, IrType, IrValue, OpCategory};

use super::{check_abi, BackendError};
use crate::abi;

const BACKEND: &str = "wasm";

/// Function indices of the host imports. The entry function follows them.
mod func_idx {
    pub const NEW_OBJECT: u32 = 0;
    pub const NEW_ARRAY: u32 = 1;
    pub const ARRAY_LENGTH: u32 = 2;
    pub const ARRAY_GET: u32 = 3;
    pub const ARRAY_SET: u32 = 4;
    pub const GET_FIELD: u32 = 5;
    pub const SET_FIELD: u32 = 6;
    pub const ENTRY: u32 = 7;
}

fn val_type(ty: IrType) -> Result<ValType, BackendError> {
    match ty {
        IrType::I32 | IrType::Ref => Ok(ValType::I32),
        IrType::I64 => Ok(ValType::I64),
        IrType::F32 => Ok(ValType::F32),
        IrType::F64 => Ok(ValType::F64),
        IrType::Void => Err(BackendError::unsupported_type(BACKEND, ty)),
    }
}

fn memarg(offset: u32, align: u32) -> MemArg {
    MemArg {
        offset: u64::from(offset),
        align,
        memory_index: 0,
    }
}

/// Lower a function to a standalone WebAssembly module.
pub fn lower(func: &IrFunction) -> Result<Vec<u8>, BackendError> {
    check_abi(BACKEND, func)?;

    let mut module = Module::new();

    let results: Vec<ValType> = match func.return_type {
        IrType::Void => Vec::new(),
        ty => vec![val_type(ty)?],
    };
    let mut types = TypeSection::new();
    types.ty().function([ValType::I32], results);
    let ty_entry = 0;
    types.ty().function([ValType::I32], [ValType::I32]);
    let ty_i32_to_i32 = 1;
    types.ty().function([ValType::I32, ValType::I32], [ValType::I32]);
    let ty_i32x2_to_i32 = 2;
    types
        .ty()
        .function([ValType::I32, ValType::I32, ValType::I32], Vec::<ValType>::new());
    let ty_i32x3 = 3;
    module.section(&types);

    let mut imports = ImportSection::new();
    imports.import(
        abi::IMPORT_MODULE,
        abi::IMPORT_MEMORY,
        MemoryType {
            minimum: u64::from(abi::MEMORY_PAGES),
            maximum: None,
            memory64: false,
            shared: false,
            page_size_log2: None,
        },
    );
    // Order must match `func_idx`.
    for (name, ty) in [
        (abi::IMPORT_NEW_OBJECT, ty_i32_to_i32),
        (abi::IMPORT_NEW_ARRAY, ty_i32_to_i32),
        (abi::IMPORT_ARRAY_LENGTH, ty_i32_to_i32),
        (abi::IMPORT_ARRAY_GET, ty_i32x2_to_i32),
        (abi::IMPORT_ARRAY_SET, ty_i32x3),
        (abi::IMPORT_GET_FIELD, ty_i32x2_to_i32),
        (abi::IMPORT_SET_FIELD, ty_i32x3),
    ] {
        imports.import(abi::IMPORT_MODULE, name, EntityType::Function(ty));
    }
    module.section(&imports);

    let mut funcs = FunctionSection::new();
    funcs.function(ty_entry);
    module.section(&funcs);

    let mut exports = ExportSection::new();
    exports.export(abi::EXPORT_ENTRY, ExportKind::Func, func_idx::ENTRY);
    module.section(&exports);

    let layout = LocalsLayout {
        locals: func.locals.len() as u32,
        registers: func.registers.len() as u32,
    };
    let mut decls = Vec::with_capacity(func.locals.len() + func.registers.len() + 1);
    for ty in func.locals.iter().chain(func.registers.iter()) {
        decls.push((1, val_type(*ty)?));
    }
    decls.push((1, ValType::I32));

    let mut emitter = Emitter {
        func: Function::new(decls),
        ir: func,
        layout,
    };
    emitter.emit_body()?;

    let mut code = CodeSection::new();
    code.function(&emitter.func);
    module.section(&code);

    Ok(module.finish())
}

/// Wasm local indices. Local 0 is the `window_ptr` parameter.
#[derive(Clone, Copy)]
struct LocalsLayout {
    locals: u32,
    registers: u32,
}

impl LocalsLayout {
    const WINDOW_PTR: u32 = 0;

    fn ir_local(self, index: u32) -> u32 {
        1 + index
    }

    fn vreg(self, id: u32) -> u32 {
        1 + self.locals + id
    }

    fn label(self) -> u32 {
        1 + self.locals + self.registers
    }
}

struct Emitter<'a> {
    func: Function,
    ir: &'a IrFunction,
    layout: LocalsLayout,
}

impl Emitter<'_> {
    fn ins(&mut self, inst: Instruction<'_>) {
        self.func.instruction(&inst);
    }

    fn emit_body(&mut self) -> Result<(), BackendError> {
        self.emit_prologue()?;

        let n = self.ir.blocks.len() as u32;
        self.ins(Instruction::I32Const(self.ir.entry.0 as i32));
        self.ins(Instruction::LocalSet(self.layout.label()));

        self.ins(Instruction::Loop(BlockType::Empty));
        for _ in 0..n {
            self.ins(Instruction::Block(BlockType::Empty));
        }
        self.ins(Instruction::LocalGet(self.layout.label()));
        let targets: Vec<u32> = (0..n).collect();
        self.ins(Instruction::BrTable(targets.into(), n - 1));

        let ir = self.ir;
        for (pos, block) in ir.blocks.iter().enumerate() {
            self.ins(Instruction::End);
            // Blocks still open around this arm: the arms after it, then the loop.
            let loop_depth = n - 1 - pos as u32;
            for inst in &block.instructions {
                self.emit_inst(inst, loop_depth)?;
            }
        }
        self.ins(Instruction::End);
        self.ins(Instruction::Unreachable);
        self.ins(Instruction::End);
        Ok(())
    }

    fn emit_prologue(&mut self) -> Result<(), BackendError> {
        let ir = self.ir;
        for (i, ty) in ir.locals.iter().enumerate() {
            let offset = abi::WINDOW_PTR + i as u32 * abi::SLOT_BYTES;
            self.ins(Instruction::LocalGet(LocalsLayout::WINDOW_PTR));
            self.ins(match ty {
                IrType::I32 | IrType::Ref => Instruction::I32Load(memarg(offset, 2)),
                IrType::I64 => Instruction::I64Load(memarg(offset, 3)),
                IrType::F32 => Instruction::F32Load(memarg(offset, 2)),
                IrType::F64 => Instruction::F64Load(memarg(offset, 3)),
                IrType::Void => return Err(BackendError::unsupported_type(BACKEND, *ty)),
            });
            self.ins(Instruction::LocalSet(self.layout.ir_local(i as u32)));
        }
        Ok(())
    }

    fn emit_epilogue(&mut self) -> Result<(), BackendError> {
        let ir = self.ir;
        for (i, ty) in ir.locals.iter().enumerate() {
            let offset = abi::WINDOW_PTR + i as u32 * abi::SLOT_BYTES;
            self.ins(Instruction::LocalGet(LocalsLayout::WINDOW_PTR));
            self.ins(Instruction::LocalGet(self.layout.ir_local(i as u32)));
            // 32-bit locals write back the whole slot, zero-extended.
            match ty {
                IrType::I32 | IrType::Ref => self.ins(Instruction::I64ExtendI32U),
                IrType::F32 => {
                    self.ins(Instruction::I32ReinterpretF32);
                    self.ins(Instruction::I64ExtendI32U);
                }
                IrType::F64 => self.ins(Instruction::I64ReinterpretF64),
                IrType::I64 => {}
                IrType::Void => return Err(BackendError::unsupported_type(BACKEND, *ty)),
            }
            self.ins(Instruction::I64Store(memarg(offset, 3)));
        }
        Ok(())
    }

    fn push_value(&mut self, value: IrValue) -> Result<(), BackendError> {
        use nacho_ir::Constant;
        match value {
            IrValue::Register(r) => self.ins(Instruction::LocalGet(self.layout.vreg(r.id))),
            IrValue::Constant(c) => match c {
                Constant::I32(v) => self.ins(Instruction::I32Const(v)),
                Constant::I64(v) => self.ins(Instruction::I64Const(v)),
                Constant::F32(bits) => {
                    self.ins(Instruction::I32Const(bits as i32));
                    self.ins(Instruction::F32ReinterpretI32);
                }
                Constant::F64(bits) => {
                    self.ins(Instruction::I64Const(bits as i64));
                    self.ins(Instruction::F64ReinterpretI64);
                }
                Constant::Null => self.ins(Instruction::I32Const(0)),
            },
            IrValue::Label(_) => {
                return Err(BackendError::Unsupported {
                    backend: BACKEND,
                    what: "label used as a value".into(),
                })
            }
        }
        Ok(())
    }

    fn push_operands(&mut self, inst: &IrInstruction) -> Result<(), BackendError> {
        for &op in &inst.operands {
            self.push_value(op)?;
        }
        Ok(())
    }

    fn set_result(&mut self, inst: &IrInstruction) {
        match inst.result_reg() {
            Some(r) => self.ins(Instruction::LocalSet(self.layout.vreg(r.id))),
            None => self.ins(Instruction::Drop),
        }
    }

    fn emit_inst(&mut self, inst: &IrInstruction, loop_depth: u32) -> Result<(), BackendError> {
        use IrOpcode::*;

        let op = inst.opcode;
        match op.category() {
            OpCategory::Constant => {
                self.push_operands(inst)?;
                self.set_result(inst);
                return Ok(());
            }
            OpCategory::Arithmetic
            | OpCategory::Bitwise
            | OpCategory::Conversion
            | OpCategory::Compare => {
                self.emit_pure(inst)?;
                self.set_result(inst);
                return Ok(());
            }
            _ => {}
        }

        match op {
            Br => {
                let target = label_operand(inst, 0)?;
                self.ins(Instruction::I32Const(target as i32));
                self.ins(Instruction::LocalSet(self.layout.label()));
                self.ins(Instruction::Br(loop_depth));
            }
            BrIf => {
                let then_block = label_operand(inst, 1)?;
                let else_block = label_operand(inst, 2)?;
                self.ins(Instruction::I32Const(then_block as i32));
                self.ins(Instruction::I32Const(else_block as i32));
                self.push_value(inst.operands[0])?;
                self.ins(Instruction::Select);
                self.ins(Instruction::LocalSet(self.layout.label()));
                self.ins(Instruction::Br(loop_depth));
            }
            Return => {
                let value = inst.operands.first().copied();
                match (self.ir.return_type, value) {
                    (IrType::Void, None) => {}
                    (IrType::Void, Some(_)) | (_, None) => {
                        return Err(BackendError::Unsupported {
                            backend: BACKEND,
                            what: format!("RETURN arity mismatch for {}", self.ir.return_type),
                        })
                    }
                    (_, Some(_)) => {}
                }
                self.emit_epilogue()?;
                if let Some(v) = value {
                    self.push_value(v)?;
                }
                self.ins(Instruction::Return);
            }
            Copy => {
                self.push_operands(inst)?;
                self.set_result(inst);
            }
            LocalGet => {
                let index = inst.local_index().unwrap_or(0);
                self.ins(Instruction::LocalGet(self.layout.ir_local(index)));
                self.set_result(inst);
            }
            LocalSet => {
                let index = inst.local_index().unwrap_or(0);
                self.push_value(inst.operands[1])?;
                self.ins(Instruction::LocalSet(self.layout.ir_local(index)));
            }
            LoadI32 | LoadI64 => {
                self.push_operands(inst)?;
                self.ins(if op == LoadI32 {
                    Instruction::I32Load(memarg(0, 2))
                } else {
                    Instruction::I64Load(memarg(0, 3))
                });
                self.set_result(inst);
            }
            StoreI32 | StoreI64 => {
                self.push_operands(inst)?;
                self.ins(if op == StoreI32 {
                    Instruction::I32Store(memarg(0, 2))
                } else {
                    Instruction::I64Store(memarg(0, 3))
                });
            }
            NewObject | NewArray | ArrayLength | ArrayGet | GetField => {
                if !matches!(inst.ty, IrType::I32 | IrType::Ref) {
                    return Err(BackendError::unsupported_type(BACKEND, inst.ty));
                }
                self.push_operands(inst)?;
                self.ins(Instruction::Call(match op {
                    NewObject => func_idx::NEW_OBJECT,
                    NewArray => func_idx::NEW_ARRAY,
                    ArrayLength => func_idx::ARRAY_LENGTH,
                    ArrayGet => func_idx::ARRAY_GET,
                    _ => func_idx::GET_FIELD,
                }));
                self.set_result(inst);
            }
            ArraySet | SetField => {
                let value_ty = inst.operands.get(2).map(|v| v.ty());
                if !matches!(value_ty, Some(IrType::I32 | IrType::Ref)) {
                    return Err(BackendError::Unsupported {
                        backend: BACKEND,
                        what: format!("{op} with a non-32-bit value"),
                    });
                }
                self.push_operands(inst)?;
                self.ins(Instruction::Call(if op == ArraySet {
                    func_idx::ARRAY_SET
                } else {
                    func_idx::SET_FIELD
                }));
            }
            Nop => {}
            Call => return Err(BackendError::unsupported_opcode(BACKEND, op)),
            _ => return Err(BackendError::unsupported_opcode(BACKEND, op)),
        }
        Ok(())
    }

    fn emit_pure(&mut self, inst: &IrInstruction) -> Result<(), BackendError> {
        use IrOpcode::*;

        let op = inst.opcode;
        let value = |i: usize| {
            inst.operands.get(i).copied().ok_or(BackendError::Unsupported {
                backend: BACKEND,
                what: format!("{op} with missing operands"),
            })
        };

        match op {
            NegI32 => {
                self.ins(Instruction::I32Const(0));
                self.push_value(value(0)?)?;
                self.ins(Instruction::I32Sub);
                return Ok(());
            }
            NegI64 => {
                self.ins(Instruction::I64Const(0));
                self.push_value(value(0)?)?;
                self.ins(Instruction::I64Sub);
                return Ok(());
            }
            NotI32 => {
                self.push_value(value(0)?)?;
                self.ins(Instruction::I32Const(-1));
                self.ins(Instruction::I32Xor);
                return Ok(());
            }
            Zext16 => {
                self.push_value(value(0)?)?;
                self.ins(Instruction::I32Const(0xffff));
                self.ins(Instruction::I32And);
                return Ok(());
            }
            _ => {}
        }

        self.push_operands(inst)?;
        let wasm = match op {
            AddI32 => Instruction::I32Add,
            SubI32 => Instruction::I32Sub,
            MulI32 => Instruction::I32Mul,
            DivI32 => Instruction::I32DivS,
            RemI32 => Instruction::I32RemS,
            AddI64 => Instruction::I64Add,
            SubI64 => Instruction::I64Sub,
            MulI64 => Instruction::I64Mul,
            DivI64 => Instruction::I64DivS,
            RemI64 => Instruction::I64RemS,
            AddF32 => Instruction::F32Add,
            SubF32 => Instruction::F32Sub,
            MulF32 => Instruction::F32Mul,
            DivF32 => Instruction::F32Div,
            AddF64 => Instruction::F64Add,
            SubF64 => Instruction::F64Sub,
            MulF64 => Instruction::F64Mul,
            DivF64 => Instruction::F64Div,
            AndI32 => Instruction::I32And,
            OrI32 => Instruction::I32Or,
            XorI32 => Instruction::I32Xor,
            ShlI32 => Instruction::I32Shl,
            ShrI32 => Instruction::I32ShrS,
            UShrI32 => Instruction::I32ShrU,
            AndI64 => Instruction::I64And,
            OrI64 => Instruction::I64Or,
            XorI64 => Instruction::I64Xor,
            ShlI64 => Instruction::I64Shl,
            ShrI64 => Instruction::I64ShrS,
            UShrI64 => Instruction::I64ShrU,
            WrapI64 => Instruction::I32WrapI64,
            ExtendI32S => Instruction::I64ExtendI32S,
            ExtendI32U => Instruction::I64ExtendI32U,
            Extend8S => Instruction::I32Extend8S,
            Extend16S => Instruction::I32Extend16S,
            EqI32 => Instruction::I32Eq,
            NeI32 => Instruction::I32Ne,
            LtI32 => Instruction::I32LtS,
            LeI32 => Instruction::I32LeS,
            GtI32 => Instruction::I32GtS,
            GeI32 => Instruction::I32GeS,
            EqzI32 => Instruction::I32Eqz,
            _ => return Err(BackendError::unsupported_opcode(BACKEND, op)),
        };
        self.ins(wasm);
        Ok(())
    }
}

fn label_operand(inst: &IrInstruction, index: usize) -> Result<u32, BackendError> {
    inst.operands
        .get(index)
        .and_then(|v| v.as_label())
        .map(|b| b.0)
        .ok_or(BackendError::Unsupported {
            backend: BACKEND,
            what: format!("{} without a label operand", inst.opcode),
        })
}
