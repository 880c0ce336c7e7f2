//! Decoder for the modelled x86 subset.
//!
//! Prefix `0x40..=0x4F` is always treated as REX, as in 64-bit mode. Only REX.W is supported;
//! REX.R/X/B select registers r8–r15, which the register file does not have.

use std::fmt;

use bitflags::bitflags;
use nacho_core::{AccessKind, MemoryFault, MemorySurface};
use thiserror::Error;

use crate::regs::Gpr;

/// Maximum x86 instruction length (architectural limit).
pub const MAX_INST_LEN: usize = 15;

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct RexFlags: u8 {
        const B = 1 << 0;
        const X = 1 << 1;
        const R = 1 << 2;
        const W = 1 << 3;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Cond {
    Z,
    Nz,
    S,
    Ns,
}

impl Cond {
    fn from_low_nibble(n: u8) -> Option<Cond> {
        match n & 0xf {
            0x4 => Some(Cond::Z),
            0x5 => Some(Cond::Nz),
            0x8 => Some(Cond::S),
            0x9 => Some(Cond::Ns),
            _ => None,
        }
    }

    pub fn holds(self, zf: bool, sf: bool) -> bool {
        match self {
            Cond::Z => zf,
            Cond::Nz => !zf,
            Cond::S => sf,
            Cond::Ns => !sf,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Mnemonic {
    Nop,
    Hlt,
    Mov,
    Add,
    Or,
    And,
    Sub,
    Xor,
    Cmp,
    Test,
    Inc,
    Dec,
    Not,
    Neg,
    Imul,
    Shl,
    Shr,
    Sar,
    Push,
    Pop,
    Call,
    Ret,
    Jmp,
    Jcc(Cond),
    Int,
}

impl fmt::Display for Mnemonic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Mnemonic::Nop => "nop",
            Mnemonic::Hlt => "hlt",
            Mnemonic::Mov => "mov",
            Mnemonic::Add => "add",
            Mnemonic::Or => "or",
            Mnemonic::And => "and",
            Mnemonic::Sub => "sub",
            Mnemonic::Xor => "xor",
            Mnemonic::Cmp => "cmp",
            Mnemonic::Test => "test",
            Mnemonic::Inc => "inc",
            Mnemonic::Dec => "dec",
            Mnemonic::Not => "not",
            Mnemonic::Neg => "neg",
            Mnemonic::Imul => "imul",
            Mnemonic::Shl => "shl",
            Mnemonic::Shr => "shr",
            Mnemonic::Sar => "sar",
            Mnemonic::Push => "push",
            Mnemonic::Pop => "pop",
            Mnemonic::Call => "call",
            Mnemonic::Ret => "ret",
            Mnemonic::Jmp => "jmp",
            Mnemonic::Jcc(Cond::Z) => "jz",
            Mnemonic::Jcc(Cond::Nz) => "jnz",
            Mnemonic::Jcc(Cond::S) => "js",
            Mnemonic::Jcc(Cond::Ns) => "jns",
            Mnemonic::Int => "int",
        };
        f.write_str(s)
    }
}

/// Memory operand (`[base + index*scale + disp]`). Decoded for length only; never executed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemOperand {
    pub base: Option<Gpr>,
    pub index: Option<(Gpr, u8)>,
    pub disp: i32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operand {
    Register(Gpr),
    /// Sign-extended to the operand size.
    Immediate(i64),
    Memory(MemOperand),
    /// Branch displacement from the end of the instruction.
    Relative(i32),
}

impl Operand {
    pub fn is_memory(&self) -> bool {
        matches!(self, Operand::Memory(_))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecodedInstruction {
    pub pc: u32,
    pub mnemonic: Mnemonic,
    /// Encoded length in bytes, prefixes included.
    pub len: u8,
    /// Destination first.
    pub operands: Vec<Operand>,
    pub rex: Option<RexFlags>,
    /// Primary opcode; two-byte opcodes are `0x0Fxx`.
    pub opcode: u16,
}

impl DecodedInstruction {
    pub fn next_pc(&self) -> u32 {
        self.pc.wrapping_add(u32::from(self.len))
    }

    /// Absolute target of a relative branch.
    pub fn branch_target(&self) -> Option<u32> {
        self.operands.iter().find_map(|op| match op {
            Operand::Relative(disp) => Some(self.next_pc().wrapping_add(*disp as u32)),
            _ => None,
        })
    }

    pub fn wide(&self) -> bool {
        self.rex.is_some_and(|r| r.contains(RexFlags::W))
    }

    pub fn has_memory_operand(&self) -> bool {
        self.operands.iter().any(Operand::is_memory)
    }

    pub fn is_control_flow(&self) -> bool {
        matches!(
            self.mnemonic,
            Mnemonic::Jmp | Mnemonic::Jcc(_) | Mnemonic::Call | Mnemonic::Ret | Mnemonic::Int
        )
    }
}

impl fmt::Display for DecodedInstruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.mnemonic)?;
        for (i, op) in self.operands.iter().enumerate() {
            f.write_str(if i == 0 { " " } else { ", " })?;
            match op {
                Operand::Register(r) => write!(f, "{r}")?,
                Operand::Immediate(v) => write!(f, "0x{v:x}")?,
                Operand::Memory(_) => f.write_str("[mem]")?,
                Operand::Relative(_) => {
                    write!(f, "0x{:x}", self.branch_target().unwrap_or_default())?
                }
            }
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    /// The byte window ended before the instruction did.
    #[error("instruction truncated after {have} byte(s)")]
    Truncated { have: usize },
    /// Opcode (or opcode extension) outside the modelled subset. `len` bytes were consumed.
    #[error("unknown opcode 0x{opcode:02x}")]
    Unknown { opcode: u16, len: u8 },
    #[error("unsupported encoding for opcode 0x{opcode:02x}: {reason}")]
    Unsupported {
        opcode: u16,
        len: u8,
        reason: &'static str,
    },
}

impl DecodeError {
    /// Bytes consumed before the error was detected.
    pub fn consumed(&self) -> u8 {
        match *self {
            DecodeError::Truncated { have } => have as u8,
            DecodeError::Unknown { len, .. } | DecodeError::Unsupported { len, .. } => len,
        }
    }
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl Cursor<'_> {
    fn u8(&mut self) -> Result<u8, DecodeError> {
        let b = *self
            .bytes
            .get(self.pos)
            .ok_or(DecodeError::Truncated { have: self.pos })?;
        self.pos += 1;
        Ok(b)
    }

    fn i8(&mut self) -> Result<i8, DecodeError> {
        Ok(self.u8()? as i8)
    }

    fn i32(&mut self) -> Result<i32, DecodeError> {
        let mut b = [0u8; 4];
        for byte in &mut b {
            *byte = self.u8()?;
        }
        Ok(i32::from_le_bytes(b))
    }

    fn i64(&mut self) -> Result<i64, DecodeError> {
        let mut b = [0u8; 8];
        for byte in &mut b {
            *byte = self.u8()?;
        }
        Ok(i64::from_le_bytes(b))
    }
}

struct ModRm {
    reg: u8,
    rm: Operand,
}

/// 32-bit addressing: ModR/M, then SIB and displacement when `mod != 3`.
fn modrm(cur: &mut Cursor<'_>) -> Result<ModRm, DecodeError> {
    let byte = cur.u8()?;
    let mode = byte >> 6;
    let reg = (byte >> 3) & 7;
    let rm = byte & 7;

    if mode == 3 {
        return Ok(ModRm {
            reg,
            rm: Operand::Register(Gpr::from_bits(rm)),
        });
    }

    let mut mem = MemOperand {
        base: Some(Gpr::from_bits(rm)),
        index: None,
        disp: 0,
    };
    if rm == 4 {
        let sib = cur.u8()?;
        let scale = 1u8 << (sib >> 6);
        let index = (sib >> 3) & 7;
        let base = sib & 7;
        mem.index = (index != 4).then(|| (Gpr::from_bits(index), scale));
        mem.base = Some(Gpr::from_bits(base));
        if base == 5 && mode == 0 {
            mem.base = None;
            mem.disp = cur.i32()?;
        }
    } else if rm == 5 && mode == 0 {
        mem.base = None;
        mem.disp = cur.i32()?;
    }
    match mode {
        1 => mem.disp = i32::from(cur.i8()?),
        2 => mem.disp = cur.i32()?,
        _ => {}
    }
    Ok(ModRm {
        reg,
        rm: Operand::Memory(mem),
    })
}

/// Decode one instruction from the start of `bytes`, located at `pc`.
pub fn decode(bytes: &[u8], pc: u32) -> Result<DecodedInstruction, DecodeError> {
    let bytes = &bytes[..bytes.len().min(MAX_INST_LEN)];
    let mut cur = Cursor { bytes, pos: 0 };

    let mut rex = None;
    let mut op = cur.u8()?;
    if (0x40..=0x4f).contains(&op) {
        let flags = RexFlags::from_bits_retain(op & 0x0f);
        rex = Some(flags);
        op = cur.u8()?;
        if flags.intersects(RexFlags::R | RexFlags::X | RexFlags::B) {
            return Err(DecodeError::Unsupported {
                opcode: u16::from(op),
                len: cur.pos as u8,
                reason: "REX.R/X/B extended registers",
            });
        }
    }
    let wide = rex.is_some_and(|r| r.contains(RexFlags::W));
    let unknown = |opcode: u16, len: usize| DecodeError::Unknown {
        opcode,
        len: len as u8,
    };

    let mut opcode = u16::from(op);
    let (mnemonic, operands) = match op {
        0x90 => (Mnemonic::Nop, vec![]),
        0xf4 => (Mnemonic::Hlt, vec![]),
        0xc3 => (Mnemonic::Ret, vec![]),

        0xb8..=0xbf => {
            let imm = if wide { cur.i64()? } else { i64::from(cur.i32()?) };
            (
                Mnemonic::Mov,
                vec![Operand::Register(Gpr::from_bits(op)), Operand::Immediate(imm)],
            )
        }
        0x89 | 0x8b => {
            let m = modrm(&mut cur)?;
            let reg = Operand::Register(Gpr::from_bits(m.reg));
            let ops = if op == 0x89 { vec![m.rm, reg] } else { vec![reg, m.rm] };
            (Mnemonic::Mov, ops)
        }

        // ALU r/m,r (x1), r,r/m (x3), eAX,imm32 (x5) for ADD/OR/AND/SUB/XOR/CMP.
        0x01 | 0x03 | 0x05 | 0x09 | 0x0b | 0x0d | 0x21 | 0x23 | 0x25 | 0x29 | 0x2b | 0x2d
        | 0x31 | 0x33 | 0x35 | 0x39 | 0x3b | 0x3d => {
            let mnemonic = alu_mnemonic(op >> 3);
            match op & 7 {
                1 | 3 => {
                    let m = modrm(&mut cur)?;
                    let reg = Operand::Register(Gpr::from_bits(m.reg));
                    let ops = if op & 7 == 1 { vec![m.rm, reg] } else { vec![reg, m.rm] };
                    (mnemonic, ops)
                }
                _ => {
                    let imm = i64::from(cur.i32()?);
                    (
                        mnemonic,
                        vec![Operand::Register(Gpr::Eax), Operand::Immediate(imm)],
                    )
                }
            }
        }
        0x85 => {
            let m = modrm(&mut cur)?;
            (
                Mnemonic::Test,
                vec![m.rm, Operand::Register(Gpr::from_bits(m.reg))],
            )
        }
        0x81 | 0x83 => {
            let m = modrm(&mut cur)?;
            let imm = if op == 0x81 {
                i64::from(cur.i32()?)
            } else {
                i64::from(cur.i8()?)
            };
            let mnemonic = match m.reg {
                0 => Mnemonic::Add,
                1 => Mnemonic::Or,
                4 => Mnemonic::And,
                5 => Mnemonic::Sub,
                6 => Mnemonic::Xor,
                7 => Mnemonic::Cmp,
                _ => return Err(unknown(opcode, cur.pos)),
            };
            (mnemonic, vec![m.rm, Operand::Immediate(imm)])
        }
        0xff => {
            let m = modrm(&mut cur)?;
            let mnemonic = match m.reg {
                0 => Mnemonic::Inc,
                1 => Mnemonic::Dec,
                _ => return Err(unknown(opcode, cur.pos)),
            };
            (mnemonic, vec![m.rm])
        }
        0xf7 => {
            let m = modrm(&mut cur)?;
            let mnemonic = match m.reg {
                2 => Mnemonic::Not,
                3 => Mnemonic::Neg,
                _ => return Err(unknown(opcode, cur.pos)),
            };
            (mnemonic, vec![m.rm])
        }
        0xd1 | 0xc1 => {
            let m = modrm(&mut cur)?;
            let mnemonic = match m.reg {
                4 => Mnemonic::Shl,
                5 => Mnemonic::Shr,
                7 => Mnemonic::Sar,
                _ => return Err(unknown(opcode, cur.pos)),
            };
            let count = if op == 0xd1 { 1 } else { i64::from(cur.u8()?) };
            (mnemonic, vec![m.rm, Operand::Immediate(count)])
        }
        0x0f => {
            let op2 = cur.u8()?;
            opcode = 0x0f00 | u16::from(op2);
            match op2 {
                0xaf => {
                    let m = modrm(&mut cur)?;
                    (
                        Mnemonic::Imul,
                        vec![Operand::Register(Gpr::from_bits(m.reg)), m.rm],
                    )
                }
                0x84 | 0x85 | 0x88 | 0x89 => {
                    let cond = Cond::from_low_nibble(op2).ok_or(unknown(opcode, cur.pos))?;
                    (Mnemonic::Jcc(cond), vec![Operand::Relative(cur.i32()?)])
                }
                _ => return Err(unknown(opcode, cur.pos)),
            }
        }

        0x50..=0x57 => (Mnemonic::Push, vec![Operand::Register(Gpr::from_bits(op))]),
        0x58..=0x5f => (Mnemonic::Pop, vec![Operand::Register(Gpr::from_bits(op))]),
        0x68 => (Mnemonic::Push, vec![Operand::Immediate(i64::from(cur.i32()?))]),
        0x6a => (Mnemonic::Push, vec![Operand::Immediate(i64::from(cur.i8()?))]),

        0xe8 => (Mnemonic::Call, vec![Operand::Relative(cur.i32()?)]),
        0xe9 => (Mnemonic::Jmp, vec![Operand::Relative(cur.i32()?)]),
        0xeb => (Mnemonic::Jmp, vec![Operand::Relative(i32::from(cur.i8()?))]),
        0x74 | 0x75 | 0x78 | 0x79 => {
            let cond = Cond::from_low_nibble(op).ok_or(unknown(opcode, cur.pos))?;
            (
                Mnemonic::Jcc(cond),
                vec![Operand::Relative(i32::from(cur.i8()?))],
            )
        }
        0xcd => (Mnemonic::Int, vec![Operand::Immediate(i64::from(cur.u8()?))]),

        _ => return Err(unknown(opcode, cur.pos)),
    };

    Ok(DecodedInstruction {
        pc,
        mnemonic,
        len: cur.pos as u8,
        operands,
        rex,
        opcode,
    })
}

#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error(transparent)]
    Memory(#[from] MemoryFault),
    #[error(transparent)]
    Decode(DecodeError),
}

/// Read up to [`MAX_INST_LEN`] bytes at `pc` and decode them.
///
/// An instruction that runs past the end of memory is a read fault on its first missing byte.
pub fn fetch<M: MemorySurface + ?Sized>(
    memory: &M,
    pc: u32,
) -> Result<DecodedInstruction, FetchError> {
    let addr = u64::from(pc);
    let avail = memory.size().saturating_sub(addr).min(MAX_INST_LEN as u64) as usize;
    if avail == 0 {
        return Err(MemoryFault {
            addr,
            len: 1,
            kind: AccessKind::Read,
        }
        .into());
    }
    let mut buf = [0u8; MAX_INST_LEN];
    memory.read_bytes(addr, &mut buf[..avail])?;
    decode(&buf[..avail], pc).map_err(|err| match err {
        DecodeError::Truncated { have } if have == avail => FetchError::Memory(MemoryFault {
            addr: addr + have as u64,
            len: 1,
            kind: AccessKind::Read,
        }),
        other => FetchError::Decode(other),
    })
}

fn alu_mnemonic(group: u8) -> Mnemonic {
    match group {
        0 => Mnemonic::Add,
        1 => Mnemonic::Or,
        4 => Mnemonic::And,
        5 => Mnemonic::Sub,
        6 => Mnemonic::Xor,
        _ => Mnemonic::Cmp,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_direct_alu() {
        let inst = decode(&[0x01, 0xd8], 0x100).unwrap();
        assert_eq!(inst.mnemonic, Mnemonic::Add);
        assert_eq!(inst.len, 2);
        assert_eq!(
            inst.operands,
            vec![Operand::Register(Gpr::Eax), Operand::Register(Gpr::Ebx)]
        );
    }

    #[test]
    fn memory_forms_consume_sib_and_displacement() {
        // add [eax+ecx*4+0x12345678], edx
        let inst = decode(&[0x01, 0x94, 0x88, 0x78, 0x56, 0x34, 0x12], 0).unwrap();
        assert_eq!(inst.len, 7);
        assert_eq!(
            inst.operands[0],
            Operand::Memory(MemOperand {
                base: Some(Gpr::Eax),
                index: Some((Gpr::Ecx, 4)),
                disp: 0x1234_5678,
            })
        );
        // mov eax, [disp32]
        let inst = decode(&[0x8b, 0x05, 0, 0, 0, 0], 0).unwrap();
        assert_eq!(inst.len, 6);
        assert!(inst.has_memory_operand());
    }

    #[test]
    fn relative_targets_are_from_next_pc() {
        let inst = decode(&[0xeb, 0xfe], 0x1000).unwrap();
        assert_eq!(inst.branch_target(), Some(0x1000));
        let inst = decode(&[0x0f, 0x85, 0x10, 0, 0, 0], 0x1000).unwrap();
        assert_eq!(inst.mnemonic, Mnemonic::Jcc(Cond::Nz));
        assert_eq!(inst.branch_target(), Some(0x1016));
    }

    #[test]
    fn rex_w_widens_mov_immediate() {
        let inst = decode(&[0x48, 0xb8, 1, 2, 3, 4, 5, 6, 7, 8], 0).unwrap();
        assert!(inst.wide());
        assert_eq!(inst.len, 10);
        assert_eq!(inst.operands[1], Operand::Immediate(0x0807_0605_0403_0201));
    }

    #[test]
    fn extended_registers_are_rejected() {
        assert!(matches!(
            decode(&[0x41, 0x01, 0xc0], 0),
            Err(DecodeError::Unsupported { len: 2, .. })
        ));
    }

    #[test]
    fn unknown_and_truncated() {
        assert_eq!(
            decode(&[0x0f, 0x0b], 0),
            Err(DecodeError::Unknown {
                opcode: 0x0f0b,
                len: 2
            })
        );
        assert_eq!(
            decode(&[0xff, 0xd0], 0),
            Err(DecodeError::Unknown {
                opcode: 0xff,
                len: 2
            })
        );
        assert_eq!(
            decode(&[0xb8, 1, 2], 0),
            Err(DecodeError::Truncated { have: 3 })
        );
    }

    #[test]
    fn fetch_faults_past_end_of_memory() {
        let mut mem = nacho_core::FlatMemory::new(4);
        mem.load(2, &[0xb8, 0x01]).unwrap();
        assert_eq!(
            fetch(&mem, 2),
            Err(FetchError::Memory(MemoryFault {
                addr: 4,
                len: 1,
                kind: AccessKind::Read,
            }))
        );
        assert!(matches!(fetch(&mem, 4), Err(FetchError::Memory(_))));
    }
}
