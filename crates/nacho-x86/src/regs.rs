use std::fmt;

use bitflags::bitflags;

/// General-purpose registers in ModR/M encoding order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Gpr {
    Eax = 0,
    Ecx = 1,
    Edx = 2,
    Ebx = 3,
    Esp = 4,
    Ebp = 5,
    Esi = 6,
    Edi = 7,
}

impl Gpr {
    pub const ALL: [Gpr; 8] = [
        Gpr::Eax,
        Gpr::Ecx,
        Gpr::Edx,
        Gpr::Ebx,
        Gpr::Esp,
        Gpr::Ebp,
        Gpr::Esi,
        Gpr::Edi,
    ];

    /// Register selected by the low three bits of `bits`.
    pub fn from_bits(bits: u8) -> Gpr {
        Self::ALL[(bits & 7) as usize]
    }

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            Gpr::Eax => "eax",
            Gpr::Ecx => "ecx",
            Gpr::Edx => "edx",
            Gpr::Ebx => "ebx",
            Gpr::Esp => "esp",
            Gpr::Ebp => "ebp",
            Gpr::Esi => "esi",
            Gpr::Edi => "edi",
        }
    }
}

impl fmt::Display for Gpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

bitflags! {
    /// EFLAGS bits. Only ZF and SF are ever computed; CF and OF are declared for completeness.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct Eflags: u32 {
        const CF = 1 << 0;
        /// Always-one reserved bit.
        const RESERVED_1 = 1 << 1;
        const ZF = 1 << 6;
        const SF = 1 << 7;
        const OF = 1 << 11;
    }
}

impl Eflags {
    pub const RESET: Eflags = Eflags::RESERVED_1;

    /// Replace ZF/SF from a result of `width_bits` bits, leaving every other bit alone.
    pub fn set_zs(&mut self, result: u64, width_bits: u32) {
        let mask = if width_bits >= 64 {
            u64::MAX
        } else {
            (1u64 << width_bits) - 1
        };
        let value = result & mask;
        self.set(Eflags::ZF, value == 0);
        self.set(Eflags::SF, (value >> (width_bits - 1)) & 1 == 1);
    }
}

impl Default for Eflags {
    fn default() -> Self {
        Eflags::RESET
    }
}

/// Architectural register file.
///
/// GPRs are 64 bits wide; 32-bit writes zero the upper half, as in long mode.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct X86Registers {
    pub gpr: [u64; 8],
    pub eflags: Eflags,
    pub eip: u32,
}

impl X86Registers {
    pub fn get32(&self, reg: Gpr) -> u32 {
        self.gpr[reg.index()] as u32
    }

    pub fn set32(&mut self, reg: Gpr, value: u32) {
        self.gpr[reg.index()] = u64::from(value);
    }

    pub fn get64(&self, reg: Gpr) -> u64 {
        self.gpr[reg.index()]
    }

    pub fn set64(&mut self, reg: Gpr, value: u64) {
        self.gpr[reg.index()] = value;
    }

    pub fn zf(&self) -> bool {
        self.eflags.contains(Eflags::ZF)
    }

    pub fn sf(&self) -> bool {
        self.eflags.contains(Eflags::SF)
    }
}

impl fmt::Display for X86Registers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, reg) in Gpr::ALL.iter().enumerate() {
            if i > 0 {
                f.write_str(if i % 4 == 0 { "\n" } else { "  " })?;
            }
            write!(f, "{reg}={:08x}", self.gpr[reg.index()])?;
        }
        write!(
            f,
            "\neip={:08x}  eflags={:08x} [{}{}]",
            self.eip,
            self.eflags.bits(),
            if self.zf() { "Z" } else { "-" },
            if self.sf() { "S" } else { "-" },
        )
    }
}
