//! Operand extraction for the Dalvik formats, plus the switch and array-data payload tables.
//!
//! Code is a little-endian byte buffer of 16-bit code units. Offsets in branch instructions
//! are counted in code units relative to the branching instruction.

use thiserror::Error;

use crate::opcode::{Format, Opcode};

#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("unknown opcode 0x{0:02x}")]
    Unknown(u8),
    #[error("instruction at 0x{pc:x} runs past the end of the code")]
    Truncated { pc: usize },
    #[error("malformed payload at 0x{pc:x}")]
    BadPayload { pc: usize },
}

/// One decoded instruction.
///
/// `a`, `b` and `c` follow the vA/vB/vC naming of the format; for `*c` formats `b` (or `c` for
/// `22c`) is the pool index. `literal` holds immediates and branch offsets, already
/// sign-extended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Instruction {
    pub opcode: Opcode,
    pub a: u32,
    pub b: u32,
    pub c: u32,
    pub literal: i64,
    /// Argument registers of `35c`/`3rc` instructions.
    pub args: Vec<u32>,
    /// Width in bytes. Larger than the format width for payload pseudo-instructions.
    pub width: usize,
}

fn unit(code: &[u8], pc: usize, index: usize) -> Result<u16, DecodeError> {
    let at = pc + index * 2;
    match code.get(at..at + 2) {
        Some(bytes) => Ok(u16::from_le_bytes([bytes[0], bytes[1]])),
        None => Err(DecodeError::Truncated { pc }),
    }
}

fn u32_at(code: &[u8], pc: usize, index: usize) -> Result<u32, DecodeError> {
    let lo = unit(code, pc, index)?;
    let hi = unit(code, pc, index + 1)?;
    Ok(u32::from(lo) | (u32::from(hi) << 16))
}

/// Width in code units of a payload table starting with `ident`, or `None` if `ident` does not
/// introduce one.
fn payload_units(code: &[u8], pc: usize, ident: u8) -> Result<Option<usize>, DecodeError> {
    let units = match ident {
        0x01 => {
            let size = usize::from(unit(code, pc, 1)?);
            4 + size * 2
        }
        0x02 => {
            let size = usize::from(unit(code, pc, 1)?);
            2 + size * 4
        }
        0x03 => {
            let width = usize::from(unit(code, pc, 1)?);
            let size = u32_at(code, pc, 2)? as usize;
            4 + (size * width).div_ceil(2)
        }
        _ => return Ok(None),
    };
    Ok(Some(units))
}

/// Decode the instruction at byte offset `pc`.
pub fn decode(code: &[u8], pc: usize) -> Result<Instruction, DecodeError> {
    let first = unit(code, pc, 0)?;
    let byte = first as u8;
    let hi = (first >> 8) as u8;
    let opcode = Opcode::from_byte(byte).ok_or(DecodeError::Unknown(byte))?;
    let format = opcode.format();
    if pc + format.units() * 2 > code.len() {
        return Err(DecodeError::Truncated { pc });
    }

    let nib_a = u32::from(hi & 0x0f);
    let nib_b = u32::from(hi >> 4);
    let aa = u32::from(hi);
    let u1 = || unit(code, pc, 1);

    let mut inst = Instruction {
        opcode,
        a: 0,
        b: 0,
        c: 0,
        literal: 0,
        args: Vec::new(),
        width: format.units() * 2,
    };

    match format {
        Format::F10x => {
            if opcode == Opcode::Nop {
                if let Some(units) = payload_units(code, pc, hi)? {
                    if pc + units * 2 > code.len() {
                        return Err(DecodeError::BadPayload { pc });
                    }
                    inst.width = units * 2;
                }
            }
        }
        Format::F12x => {
            inst.a = nib_a;
            inst.b = nib_b;
        }
        Format::F11n => {
            inst.a = nib_a;
            inst.literal = i64::from(((hi as i8) >> 4) as i32);
        }
        Format::F11x => inst.a = aa,
        Format::F10t => inst.literal = i64::from(hi as i8),
        Format::F20t => inst.literal = i64::from(u1()? as i16),
        Format::F22x => {
            inst.a = aa;
            inst.b = u32::from(u1()?);
        }
        Format::F21t | Format::F21s => {
            inst.a = aa;
            inst.literal = i64::from(u1()? as i16);
        }
        Format::F21h => {
            inst.a = aa;
            let high = i64::from(u1()? as i16);
            inst.literal = if opcode == Opcode::ConstWideHigh16 {
                high << 48
            } else {
                high << 16
            };
        }
        Format::F21c => {
            inst.a = aa;
            inst.b = u32::from(u1()?);
        }
        Format::F23x | Format::F22b => {
            let u = u1()?;
            inst.a = aa;
            inst.b = u32::from(u & 0xff);
            inst.c = u32::from(u >> 8);
            if format == Format::F22b {
                inst.literal = i64::from((u >> 8) as u8 as i8);
            }
        }
        Format::F22t | Format::F22s => {
            inst.a = nib_a;
            inst.b = nib_b;
            inst.literal = i64::from(u1()? as i16);
        }
        Format::F22c => {
            inst.a = nib_a;
            inst.b = nib_b;
            inst.c = u32::from(u1()?);
        }
        Format::F30t => inst.literal = i64::from(u32_at(code, pc, 1)? as i32),
        Format::F32x => {
            inst.a = u32::from(u1()?);
            inst.b = u32::from(unit(code, pc, 2)?);
        }
        Format::F31i | Format::F31t => {
            inst.a = aa;
            inst.literal = i64::from(u32_at(code, pc, 1)? as i32);
        }
        Format::F31c => {
            inst.a = aa;
            inst.b = u32_at(code, pc, 1)?;
        }
        Format::F35c => {
            let count = nib_b as usize;
            let regs = unit(code, pc, 2)?;
            inst.a = nib_b;
            inst.b = u32::from(u1()?);
            let candidates = [
                u32::from(regs & 0xf),
                u32::from((regs >> 4) & 0xf),
                u32::from((regs >> 8) & 0xf),
                u32::from(regs >> 12),
                nib_a,
            ];
            inst.args = candidates[..count.min(5)].to_vec();
        }
        Format::F3rc => {
            inst.a = aa;
            inst.b = u32::from(u1()?);
            inst.c = u32::from(unit(code, pc, 2)?);
            inst.args = (inst.c..inst.c + aa).collect();
        }
        Format::F51l => {
            inst.a = aa;
            let lo = u64::from(u32_at(code, pc, 1)?);
            let hi = u64::from(u32_at(code, pc, 3)?);
            inst.literal = (lo | (hi << 32)) as i64;
        }
    }
    Ok(inst)
}

/// Resolve a code-unit branch offset relative to `pc` into a byte offset inside `code`.
pub fn branch_target(code: &[u8], pc: usize, offset: i64) -> Option<usize> {
    let target = pc as i64 + offset * 2;
    (0..code.len() as i64)
        .contains(&target)
        .then_some(target as usize)
}

/// `packed-switch-payload`: consecutive keys from `first_key`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PackedSwitch {
    pub first_key: i32,
    pub targets: Vec<i32>,
}

/// `sparse-switch-payload`: sorted keys with one target each.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SparseSwitch {
    pub keys: Vec<i32>,
    pub targets: Vec<i32>,
}

/// `fill-array-data-payload`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArrayData {
    pub element_width: usize,
    pub elements: Vec<u64>,
}

fn check_ident(code: &[u8], at: usize, ident: u16) -> Result<(), DecodeError> {
    if unit(code, at, 0)? == ident {
        Ok(())
    } else {
        Err(DecodeError::BadPayload { pc: at })
    }
}

impl PackedSwitch {
    pub fn parse(code: &[u8], at: usize) -> Result<Self, DecodeError> {
        check_ident(code, at, 0x0100)?;
        let size = usize::from(unit(code, at, 1)?);
        let first_key = u32_at(code, at, 2)? as i32;
        let targets = (0..size)
            .map(|i| u32_at(code, at, 4 + i * 2).map(|t| t as i32))
            .collect::<Result<_, _>>()?;
        Ok(Self { first_key, targets })
    }

    pub fn lookup(&self, key: i32) -> Option<i32> {
        let index = i64::from(key) - i64::from(self.first_key);
        usize::try_from(index)
            .ok()
            .and_then(|i| self.targets.get(i))
            .copied()
    }
}

impl SparseSwitch {
    pub fn parse(code: &[u8], at: usize) -> Result<Self, DecodeError> {
        check_ident(code, at, 0x0200)?;
        let size = usize::from(unit(code, at, 1)?);
        let read = |base: usize| {
            (0..size)
                .map(|i| u32_at(code, at, base + i * 2).map(|v| v as i32))
                .collect::<Result<Vec<_>, _>>()
        };
        Ok(Self {
            keys: read(2)?,
            targets: read(2 + size * 2)?,
        })
    }

    pub fn lookup(&self, key: i32) -> Option<i32> {
        self.keys
            .binary_search(&key)
            .ok()
            .map(|i| self.targets[i])
    }
}

impl ArrayData {
    pub fn parse(code: &[u8], at: usize) -> Result<Self, DecodeError> {
        check_ident(code, at, 0x0300)?;
        let element_width = usize::from(unit(code, at, 1)?);
        let size = u32_at(code, at, 2)? as usize;
        if !matches!(element_width, 1 | 2 | 4 | 8) {
            return Err(DecodeError::BadPayload { pc: at });
        }
        let start = at + 8;
        let bytes = code
            .get(start..start + size * element_width)
            .ok_or(DecodeError::BadPayload { pc: at })?;
        let elements = bytes
            .chunks_exact(element_width)
            .map(|chunk| {
                let mut buf = [0u8; 8];
                buf[..element_width].copy_from_slice(chunk);
                u64::from_le_bytes(buf)
            })
            .collect();
        Ok(Self {
            element_width,
            elements,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn code(units: &[u16]) -> Vec<u8> {
        units.iter().flat_map(|u| u.to_le_bytes()).collect()
    }

    #[test]
    fn nibble_formats() {
        // const/4 v3, #-2
        let inst = decode(&code(&[0xe312]), 0).unwrap();
        assert_eq!((inst.a, inst.literal, inst.width), (3, -2, 2));
        // move v1, v7
        let inst = decode(&code(&[0x7101]), 0).unwrap();
        assert_eq!((inst.a, inst.b), (1, 7));
    }

    #[test]
    fn wide_literals() {
        // const-wide v0, #0x0123456789abcdef
        let inst = decode(&code(&[0x0018, 0xcdef, 0x89ab, 0x4567, 0x0123]), 0).unwrap();
        assert_eq!(inst.literal, 0x0123_4567_89ab_cdef);
        assert_eq!(inst.width, 10);
        // const/high16 v0, #0x8000 << 16
        let inst = decode(&code(&[0x0015, 0x8000]), 0).unwrap();
        assert_eq!(inst.literal, i64::from(i32::MIN));
    }

    #[test]
    fn invoke_argument_lists() {
        // invoke-static {v1, v2, v3}, meth@7
        let inst = decode(&code(&[0x3071, 0x0007, 0x0321]), 0).unwrap();
        assert_eq!(inst.b, 7);
        assert_eq!(inst.args, vec![1, 2, 3]);
        // invoke-static/range {v4 .. v6}, meth@2
        let inst = decode(&code(&[0x0377, 0x0002, 0x0004]), 0).unwrap();
        assert_eq!(inst.args, vec![4, 5, 6]);
    }

    #[test]
    fn truncated_and_unknown() {
        assert_eq!(
            decode(&code(&[0x0014, 0x0001]), 0),
            Err(DecodeError::Truncated { pc: 0 })
        );
        assert_eq!(decode(&code(&[0x003e]), 0), Err(DecodeError::Unknown(0x3e)));
        assert_eq!(decode(&[0x00], 0), Err(DecodeError::Truncated { pc: 0 }));
    }

    #[test]
    fn payloads_are_skipped_as_a_whole() {
        let payload = code(&[0x0100, 2, 10, 0, 3, 0, 5, 0]);
        let inst = decode(&payload, 0).unwrap();
        assert_eq!(inst.opcode, Opcode::Nop);
        assert_eq!(inst.width, 16);

        let table = PackedSwitch::parse(&payload, 0).unwrap();
        assert_eq!(table.lookup(10), Some(3));
        assert_eq!(table.lookup(11), Some(5));
        assert_eq!(table.lookup(12), None);
        assert_eq!(table.lookup(i32::MIN), None);
    }

    #[test]
    fn sparse_switch_and_array_data() {
        let sparse = code(&[0x0200, 2, 0xfffb, 0xffff, 100, 0, 7, 0, 9, 0]);
        let table = SparseSwitch::parse(&sparse, 0).unwrap();
        assert_eq!(table.lookup(-5), Some(7));
        assert_eq!(table.lookup(100), Some(9));
        assert_eq!(table.lookup(0), None);

        let data = code(&[0x0300, 2, 3, 0, 0x0001, 0xffff, 0x0203]);
        let data = ArrayData::parse(&data, 0).unwrap();
        assert_eq!(data.elements, vec![1, 0xffff, 0x0203]);
    }
}
