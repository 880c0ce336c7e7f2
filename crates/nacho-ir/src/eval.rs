//! Reference semantics for pure IR opcodes.
//!
//! Shared by constant folding and the IR interpreter backend so both agree bit-for-bit.
//! Integer arithmetic wraps and shifts mask the count to the operand width. Division and remainder
//! return `None` for a zero divisor, and division also for `MIN / -1`; those trap at runtime.

use crate::inst::IrOpcode;
use crate::types::Constant;

pub fn eval(op: IrOpcode, args: &[Constant]) -> Option<Constant> {
    use Constant::*;
    use IrOpcode::*;

    match (op, args) {
        (ConstI32 | ConstI64 | ConstF32 | ConstF64 | ConstNull | Copy, [c]) => Some(*c),

        (AddI32, [I32(a), I32(b)]) => Some(I32(a.wrapping_add(*b))),
        (SubI32, [I32(a), I32(b)]) => Some(I32(a.wrapping_sub(*b))),
        (MulI32, [I32(a), I32(b)]) => Some(I32(a.wrapping_mul(*b))),
        (DivI32, [I32(a), I32(b)]) => a.checked_div(*b).map(I32),
        (RemI32, [I32(a), I32(b)]) => (*b != 0).then(|| I32(a.wrapping_rem(*b))),
        (NegI32, [I32(a)]) => Some(I32(a.wrapping_neg())),
        (AndI32, [I32(a), I32(b)]) => Some(I32(a & b)),
        (OrI32, [I32(a), I32(b)]) => Some(I32(a | b)),
        (XorI32, [I32(a), I32(b)]) => Some(I32(a ^ b)),
        (ShlI32, [I32(a), I32(b)]) => Some(I32(a.wrapping_shl(*b as u32))),
        (ShrI32, [I32(a), I32(b)]) => Some(I32(a.wrapping_shr(*b as u32))),
        (UShrI32, [I32(a), I32(b)]) => Some(I32((*a as u32).wrapping_shr(*b as u32) as i32)),
        (NotI32, [I32(a)]) => Some(I32(!a)),

        (AddI64, [I64(a), I64(b)]) => Some(I64(a.wrapping_add(*b))),
        (SubI64, [I64(a), I64(b)]) => Some(I64(a.wrapping_sub(*b))),
        (MulI64, [I64(a), I64(b)]) => Some(I64(a.wrapping_mul(*b))),
        (DivI64, [I64(a), I64(b)]) => a.checked_div(*b).map(I64),
        (RemI64, [I64(a), I64(b)]) => (*b != 0).then(|| I64(a.wrapping_rem(*b))),
        (NegI64, [I64(a)]) => Some(I64(a.wrapping_neg())),
        (AndI64, [I64(a), I64(b)]) => Some(I64(a & b)),
        (OrI64, [I64(a), I64(b)]) => Some(I64(a | b)),
        (XorI64, [I64(a), I64(b)]) => Some(I64(a ^ b)),
        (ShlI64, [I64(a), I64(b)]) => Some(I64(a.wrapping_shl(*b as u32))),
        (ShrI64, [I64(a), I64(b)]) => Some(I64(a.wrapping_shr(*b as u32))),
        (UShrI64, [I64(a), I64(b)]) => Some(I64((*a as u64).wrapping_shr(*b as u32) as i64)),

        (AddF32, [F32(a), F32(b)]) => Some(f32_op(*a, *b, |x, y| x + y)),
        (SubF32, [F32(a), F32(b)]) => Some(f32_op(*a, *b, |x, y| x - y)),
        (MulF32, [F32(a), F32(b)]) => Some(f32_op(*a, *b, |x, y| x * y)),
        (DivF32, [F32(a), F32(b)]) => Some(f32_op(*a, *b, |x, y| x / y)),
        (AddF64, [F64(a), F64(b)]) => Some(f64_op(*a, *b, |x, y| x + y)),
        (SubF64, [F64(a), F64(b)]) => Some(f64_op(*a, *b, |x, y| x - y)),
        (MulF64, [F64(a), F64(b)]) => Some(f64_op(*a, *b, |x, y| x * y)),
        (DivF64, [F64(a), F64(b)]) => Some(f64_op(*a, *b, |x, y| x / y)),

        (WrapI64, [I64(a)]) => Some(I32(*a as i32)),
        (ExtendI32S, [I32(a)]) => Some(I64(*a as i64)),
        (ExtendI32U, [I32(a)]) => Some(I64(*a as u32 as i64)),
        (Extend8S, [I32(a)]) => Some(I32(*a as i8 as i32)),
        (Extend16S, [I32(a)]) => Some(I32(*a as i16 as i32)),
        (Zext16, [I32(a)]) => Some(I32(*a & 0xffff)),

        (EqI32, [I32(a), I32(b)]) => Some(bool_i32(a == b)),
        (NeI32, [I32(a), I32(b)]) => Some(bool_i32(a != b)),
        (LtI32, [I32(a), I32(b)]) => Some(bool_i32(a < b)),
        (LeI32, [I32(a), I32(b)]) => Some(bool_i32(a <= b)),
        (GtI32, [I32(a), I32(b)]) => Some(bool_i32(a > b)),
        (GeI32, [I32(a), I32(b)]) => Some(bool_i32(a >= b)),
        (EqzI32, [I32(a)]) => Some(bool_i32(*a == 0)),

        _ => None,
    }
}

fn bool_i32(v: bool) -> Constant {
    Constant::I32(v as i32)
}

fn f32_op(a: u32, b: u32, f: impl Fn(f32, f32) -> f32) -> Constant {
    Constant::f32(f(f32::from_bits(a), f32::from_bits(b)))
}

fn f64_op(a: u64, b: u64, f: impl Fn(f64, f64) -> f64) -> Constant {
    Constant::f64(f(f64::from_bits(a), f64::from_bits(b)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn i32_arithmetic_wraps() {
        assert_eq!(
            eval(IrOpcode::AddI32, &[Constant::I32(i32::MAX), Constant::I32(1)]),
            Some(Constant::I32(i32::MIN))
        );
        assert_eq!(
            eval(IrOpcode::MulI32, &[Constant::I32(0x10000), Constant::I32(0x10000)]),
            Some(Constant::I32(0))
        );
    }

    #[test]
    fn trapping_division_does_not_evaluate() {
        assert_eq!(eval(IrOpcode::DivI32, &[Constant::I32(1), Constant::I32(0)]), None);
        assert_eq!(eval(IrOpcode::RemI32, &[Constant::I32(1), Constant::I32(0)]), None);
        assert_eq!(
            eval(IrOpcode::DivI32, &[Constant::I32(i32::MIN), Constant::I32(-1)]),
            None
        );
        assert_eq!(
            eval(IrOpcode::RemI32, &[Constant::I32(i32::MIN), Constant::I32(-1)]),
            Some(Constant::I32(0))
        );
    }

    #[test]
    fn shift_counts_are_masked() {
        assert_eq!(
            eval(IrOpcode::ShlI32, &[Constant::I32(1), Constant::I32(33)]),
            Some(Constant::I32(2))
        );
        assert_eq!(
            eval(IrOpcode::UShrI32, &[Constant::I32(-1), Constant::I32(28)]),
            Some(Constant::I32(0xf))
        );
    }

    #[test]
    fn mismatched_operand_types_do_not_evaluate() {
        assert_eq!(eval(IrOpcode::AddI32, &[Constant::I32(1), Constant::I64(1)]), None);
    }
}
