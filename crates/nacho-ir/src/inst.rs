use std::fmt;

use crate::types::{Constant, IrType, IrValue, VReg};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OpCategory {
    Constant,
    Arithmetic,
    Bitwise,
    Conversion,
    Compare,
    ControlFlow,
    Memory,
    Locals,
    Object,
    Special,
}

/// IR opcodes.
///
/// Operand conventions:
/// - `Const*`: `[constant]`
/// - binary ops: `[lhs, rhs]`; unary ops and conversions: `[value]`
/// - `Br`: `[label]`; `BrIf`: `[cond, then_label, else_label]`; `Return`: `[]` or `[value]`
/// - `Call`: arguments; callee name in [`IrMetadata::Callee`]
/// - `Load*`: `[addr]`; `Store*`: `[addr, value]` (backend linear memory, byte addressed)
/// - `LocalGet`: `[index]`; `LocalSet`: `[index, value]` (index is an `I32` constant)
/// - `NewObject`: `[type_idx]`; `NewArray`: `[len]`; `ArrayLength`: `[array]`;
///   `ArrayGet`: `[array, index]`; `ArraySet`: `[array, index, value]`;
///   `GetField`: `[object, field]`; `SetField`: `[object, field, value]` (field is an `I32` constant)
/// - `Copy`: `[value]`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IrOpcode {
    ConstI32,
    ConstI64,
    ConstF32,
    ConstF64,
    ConstNull,

    AddI32,
    SubI32,
    MulI32,
    DivI32,
    RemI32,
    NegI32,
    AddI64,
    SubI64,
    MulI64,
    DivI64,
    RemI64,
    NegI64,
    AddF32,
    SubF32,
    MulF32,
    DivF32,
    AddF64,
    SubF64,
    MulF64,
    DivF64,

    AndI32,
    OrI32,
    XorI32,
    ShlI32,
    ShrI32,
    UShrI32,
    NotI32,
    AndI64,
    OrI64,
    XorI64,
    ShlI64,
    ShrI64,
    UShrI64,

    WrapI64,
    ExtendI32S,
    ExtendI32U,
    Extend8S,
    Extend16S,
    Zext16,

    EqI32,
    NeI32,
    LtI32,
    LeI32,
    GtI32,
    GeI32,
    EqzI32,

    Br,
    BrIf,
    Return,
    Call,

    LoadI32,
    LoadI64,
    StoreI32,
    StoreI64,

    LocalGet,
    LocalSet,

    NewObject,
    NewArray,
    ArrayLength,
    ArrayGet,
    ArraySet,
    GetField,
    SetField,

    Copy,
    Nop,
}

impl IrOpcode {
    pub fn category(self) -> OpCategory {
        use IrOpcode::*;
        match self {
            ConstI32 | ConstI64 | ConstF32 | ConstF64 | ConstNull => OpCategory::Constant,
            AddI32 | SubI32 | MulI32 | DivI32 | RemI32 | NegI32 | AddI64 | SubI64 | MulI64
            | DivI64 | RemI64 | NegI64 | AddF32 | SubF32 | MulF32 | DivF32 | AddF64 | SubF64
            | MulF64 | DivF64 => OpCategory::Arithmetic,
            AndI32 | OrI32 | XorI32 | ShlI32 | ShrI32 | UShrI32 | NotI32 | AndI64 | OrI64
            | XorI64 | ShlI64 | ShrI64 | UShrI64 => OpCategory::Bitwise,
            WrapI64 | ExtendI32S | ExtendI32U | Extend8S | Extend16S | Zext16 => {
                OpCategory::Conversion
            }
            EqI32 | NeI32 | LtI32 | LeI32 | GtI32 | GeI32 | EqzI32 => OpCategory::Compare,
            Br | BrIf | Return | Call => OpCategory::ControlFlow,
            LoadI32 | LoadI64 | StoreI32 | StoreI64 => OpCategory::Memory,
            LocalGet | LocalSet => OpCategory::Locals,
            NewObject | NewArray | ArrayLength | ArrayGet | ArraySet | GetField | SetField => {
                OpCategory::Object
            }
            Copy | Nop => OpCategory::Special,
        }
    }

    pub fn is_terminator(self) -> bool {
        matches!(self, IrOpcode::Br | IrOpcode::BrIf | IrOpcode::Return)
    }

    /// Instructions that must survive dead-code elimination even when their result is unused.
    pub fn has_side_effects(self) -> bool {
        use IrOpcode::*;
        matches!(
            self,
            StoreI32 | StoreI64 | Call | Return | Br | BrIf | SetField | ArraySet | LocalSet
        )
    }

    /// Result depends only on the operands, so identical expressions are interchangeable.
    pub fn is_pure(self) -> bool {
        matches!(
            self.category(),
            OpCategory::Constant
                | OpCategory::Arithmetic
                | OpCategory::Bitwise
                | OpCategory::Conversion
                | OpCategory::Compare
        )
    }

    pub fn is_unary(self) -> bool {
        use IrOpcode::*;
        matches!(
            self,
            NegI32 | NegI64 | NotI32 | WrapI64 | ExtendI32S | ExtendI32U | Extend8S | Extend16S
                | Zext16 | EqzI32
        )
    }

    pub fn is_binary(self) -> bool {
        matches!(
            self.category(),
            OpCategory::Arithmetic | OpCategory::Bitwise | OpCategory::Compare
        ) && !self.is_unary()
    }

    /// Result type for opcodes whose type is fixed by the opcode itself.
    pub fn result_type(self) -> Option<IrType> {
        use IrOpcode::*;
        Some(match self {
            ConstI32 | AddI32 | SubI32 | MulI32 | DivI32 | RemI32 | NegI32 | AndI32 | OrI32
            | XorI32 | ShlI32 | ShrI32 | UShrI32 | NotI32 | WrapI64 | Extend8S | Extend16S
            | Zext16 | EqI32 | NeI32 | LtI32 | LeI32 | GtI32 | GeI32 | EqzI32 | LoadI32
            | ArrayLength => IrType::I32,
            ConstI64 | AddI64 | SubI64 | MulI64 | DivI64 | RemI64 | NegI64 | AndI64 | OrI64
            | XorI64 | ShlI64 | ShrI64 | UShrI64 | ExtendI32S | ExtendI32U | LoadI64 => IrType::I64,
            ConstF32 | AddF32 | SubF32 | MulF32 | DivF32 => IrType::F32,
            ConstF64 | AddF64 | SubF64 | MulF64 | DivF64 => IrType::F64,
            ConstNull | NewObject | NewArray => IrType::Ref,
            Br | BrIf | Return | StoreI32 | StoreI64 | LocalSet | ArraySet | SetField | Nop => {
                IrType::Void
            }
            Call | LocalGet | ArrayGet | GetField | Copy => return None,
        })
    }

    /// Opcode that materialises a constant of the given type.
    pub fn const_for(c: Constant) -> IrOpcode {
        match c {
            Constant::I32(_) => IrOpcode::ConstI32,
            Constant::I64(_) => IrOpcode::ConstI64,
            Constant::F32(_) => IrOpcode::ConstF32,
            Constant::F64(_) => IrOpcode::ConstF64,
            Constant::Null => IrOpcode::ConstNull,
        }
    }

    pub fn mnemonic(self) -> &'static str {
        use IrOpcode::*;
        match self {
            ConstI32 => "CONST_I32",
            ConstI64 => "CONST_I64",
            ConstF32 => "CONST_F32",
            ConstF64 => "CONST_F64",
            ConstNull => "CONST_NULL",
            AddI32 => "ADD_I32",
            SubI32 => "SUB_I32",
            MulI32 => "MUL_I32",
            DivI32 => "DIV_I32",
            RemI32 => "REM_I32",
            NegI32 => "NEG_I32",
            AddI64 => "ADD_I64",
            SubI64 => "SUB_I64",
            MulI64 => "MUL_I64",
            DivI64 => "DIV_I64",
            RemI64 => "REM_I64",
            NegI64 => "NEG_I64",
            AddF32 => "ADD_F32",
            SubF32 => "SUB_F32",
            MulF32 => "MUL_F32",
            DivF32 => "DIV_F32",
            AddF64 => "ADD_F64",
            SubF64 => "SUB_F64",
            MulF64 => "MUL_F64",
            DivF64 => "DIV_F64",
            AndI32 => "AND_I32",
            OrI32 => "OR_I32",
            XorI32 => "XOR_I32",
            ShlI32 => "SHL_I32",
            ShrI32 => "SHR_I32",
            UShrI32 => "USHR_I32",
            NotI32 => "NOT_I32",
            AndI64 => "AND_I64",
            OrI64 => "OR_I64",
            XorI64 => "XOR_I64",
            ShlI64 => "SHL_I64",
            ShrI64 => "SHR_I64",
            UShrI64 => "USHR_I64",
            WrapI64 => "WRAP_I64",
            ExtendI32S => "EXTEND_I32_S",
            ExtendI32U => "EXTEND_I32_U",
            Extend8S => "EXTEND8_S",
            Extend16S => "EXTEND16_S",
            Zext16 => "ZEXT16",
            EqI32 => "EQ_I32",
            NeI32 => "NE_I32",
            LtI32 => "LT_I32",
            LeI32 => "LE_I32",
            GtI32 => "GT_I32",
            GeI32 => "GE_I32",
            EqzI32 => "EQZ_I32",
            Br => "BR",
            BrIf => "BR_IF",
            Return => "RETURN",
            Call => "CALL",
            LoadI32 => "LOAD_I32",
            LoadI64 => "LOAD_I64",
            StoreI32 => "STORE_I32",
            StoreI64 => "STORE_I64",
            LocalGet => "LOCAL_GET",
            LocalSet => "LOCAL_SET",
            NewObject => "NEW_OBJECT",
            NewArray => "NEW_ARRAY",
            ArrayLength => "ARRAY_LENGTH",
            ArrayGet => "ARRAY_GET",
            ArraySet => "ARRAY_SET",
            GetField => "GET_FIELD",
            SetField => "SET_FIELD",
            Copy => "COPY",
            Nop => "NOP",
        }
    }
}

impl fmt::Display for IrOpcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mnemonic())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum IrMetadata {
    /// The instruction was produced by constant folding.
    Folded(Constant),
    /// Target of a `CALL`.
    Callee(String),
    /// Guest program counter the instruction was translated from.
    SourcePc(u64),
}

#[derive(Clone, Debug, PartialEq)]
pub struct IrInstruction {
    pub opcode: IrOpcode,
    pub ty: IrType,
    pub operands: Vec<IrValue>,
    pub result: Option<IrValue>,
    pub meta: Option<IrMetadata>,
}

impl IrInstruction {
    pub fn new(
        opcode: IrOpcode,
        ty: IrType,
        operands: Vec<IrValue>,
        result: Option<IrValue>,
    ) -> Self {
        Self {
            opcode,
            ty,
            operands,
            result,
            meta: None,
        }
    }

    pub fn result_reg(&self) -> Option<VReg> {
        self.result.and_then(IrValue::as_register)
    }

    pub fn operand_regs(&self) -> impl Iterator<Item = VReg> + '_ {
        self.operands.iter().filter_map(|v| v.as_register())
    }

    /// Local index operand of `LocalGet`/`LocalSet`.
    pub fn local_index(&self) -> Option<u32> {
        match self.opcode {
            IrOpcode::LocalGet | IrOpcode::LocalSet => self
                .operands
                .first()
                .and_then(|v| v.as_constant())
                .and_then(Constant::as_i32)
                .map(|i| i as u32),
            _ => None,
        }
    }

    /// Rewrite this instruction in place into a constant load, keeping its result register.
    pub fn make_const(&mut self, c: Constant) {
        self.opcode = IrOpcode::const_for(c);
        self.ty = c.ty();
        self.operands = vec![IrValue::Constant(c)];
        self.meta = Some(IrMetadata::Folded(c));
    }

    /// Rewrite this instruction in place into a copy of `src`, keeping its result register.
    pub fn make_copy(&mut self, src: IrValue) {
        self.opcode = IrOpcode::Copy;
        self.operands = vec![src];
        self.meta = None;
    }
}

impl fmt::Display for IrInstruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(result) = self.result {
            write!(f, "{result}:{} = ", self.ty)?;
        }
        f.write_str(self.opcode.mnemonic())?;
        for (i, op) in self.operands.iter().enumerate() {
            let sep = if i == 0 { " " } else { ", " };
            write!(f, "{sep}{op}")?;
        }
        match &self.meta {
            Some(IrMetadata::Callee(name)) => write!(f, " @{name}"),
            Some(IrMetadata::SourcePc(pc)) => write!(f, "  ; pc=0x{pc:x}"),
            Some(IrMetadata::Folded(_)) => f.write_str("  ; folded"),
            None => Ok(()),
        }
    }
}
