use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IrType {
    I32,
    I64,
    F32,
    F64,
    /// Object reference. Represented as 32-bit handle bits at runtime.
    Ref,
    Void,
}

impl IrType {
    pub fn is_integer(self) -> bool {
        matches!(self, IrType::I32 | IrType::I64)
    }
}

impl fmt::Display for IrType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            IrType::I32 => "i32",
            IrType::I64 => "i64",
            IrType::F32 => "f32",
            IrType::F64 => "f64",
            IrType::Ref => "ref",
            IrType::Void => "void",
        };
        f.write_str(s)
    }
}

/// Typed literal. Floats are stored as raw bits so constants stay `Eq + Hash`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Constant {
    I32(i32),
    I64(i64),
    F32(u32),
    F64(u64),
    Null,
}

impl Constant {
    pub fn ty(self) -> IrType {
        match self {
            Constant::I32(_) => IrType::I32,
            Constant::I64(_) => IrType::I64,
            Constant::F32(_) => IrType::F32,
            Constant::F64(_) => IrType::F64,
            Constant::Null => IrType::Ref,
        }
    }

    pub fn f32(v: f32) -> Self {
        Constant::F32(v.to_bits())
    }

    pub fn f64(v: f64) -> Self {
        Constant::F64(v.to_bits())
    }

    /// Raw 64-bit payload: integers sign-extended, floats as bits, null as zero.
    pub fn bits(self) -> u64 {
        match self {
            Constant::I32(v) => v as i64 as u64,
            Constant::I64(v) => v as u64,
            Constant::F32(v) => v as u64,
            Constant::F64(v) => v,
            Constant::Null => 0,
        }
    }

    /// Rebuild a constant of type `ty` from a raw payload (inverse of [`Constant::bits`]).
    pub fn from_bits(ty: IrType, bits: u64) -> Option<Self> {
        Some(match ty {
            IrType::I32 => Constant::I32(bits as i32),
            IrType::I64 => Constant::I64(bits as i64),
            IrType::F32 => Constant::F32(bits as u32),
            IrType::F64 => Constant::F64(bits),
            IrType::Ref if bits == 0 => Constant::Null,
            IrType::Ref | IrType::Void => return None,
        })
    }

    pub fn as_i32(self) -> Option<i32> {
        match self {
            Constant::I32(v) => Some(v),
            _ => None,
        }
    }
}

impl From<i32> for Constant {
    fn from(v: i32) -> Self {
        Constant::I32(v)
    }
}

impl From<i64> for Constant {
    fn from(v: i64) -> Self {
        Constant::I64(v)
    }
}

impl From<f32> for Constant {
    fn from(v: f32) -> Self {
        Constant::f32(v)
    }
}

impl From<f64> for Constant {
    fn from(v: f64) -> Self {
        Constant::f64(v)
    }
}

impl fmt::Display for Constant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Constant::I32(v) => write!(f, "{v}"),
            Constant::I64(v) => write!(f, "{v}L"),
            Constant::F32(v) => write!(f, "{}f", f32::from_bits(v)),
            Constant::F64(v) => write!(f, "{}d", f64::from_bits(v)),
            Constant::Null => f.write_str("null"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u32);

impl BlockId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bb{}", self.0)
    }
}

/// Virtual register: assigned at most once per compilation unit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct VReg {
    pub id: u32,
    pub ty: IrType,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IrValue {
    Register(VReg),
    Constant(Constant),
    Label(BlockId),
}

impl IrValue {
    pub fn ty(self) -> IrType {
        match self {
            IrValue::Register(r) => r.ty,
            IrValue::Constant(c) => c.ty(),
            IrValue::Label(_) => IrType::Void,
        }
    }

    pub fn as_register(self) -> Option<VReg> {
        match self {
            IrValue::Register(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_constant(self) -> Option<Constant> {
        match self {
            IrValue::Constant(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_label(self) -> Option<BlockId> {
        match self {
            IrValue::Label(b) => Some(b),
            _ => None,
        }
    }
}

impl From<Constant> for IrValue {
    fn from(c: Constant) -> Self {
        IrValue::Constant(c)
    }
}

impl From<BlockId> for IrValue {
    fn from(b: BlockId) -> Self {
        IrValue::Label(b)
    }
}

impl fmt::Display for IrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IrValue::Register(r) => write!(f, "%{}", r.id),
            IrValue::Constant(c) => write!(f, "{c}"),
            IrValue::Label(b) => write!(f, "{b}"),
        }
    }
}
