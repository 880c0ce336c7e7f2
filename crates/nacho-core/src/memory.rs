//! Byte-addressable guest memory.
//!
//! Every access is bounds-checked against [`MemorySurface::size`]. Multi-byte accesses are checked
//! as a whole before any byte is touched, so a faulting write never leaves a partial store behind.

use std::collections::HashMap;
use std::fmt;

use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessKind {
    Read,
    Write,
}

impl fmt::Display for AccessKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessKind::Read => f.write_str("read"),
            AccessKind::Write => f.write_str("write"),
        }
    }
}

/// Out-of-range access to a [`MemorySurface`].
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
#[error("memory fault: {kind} of {len} byte(s) at 0x{addr:x} is out of bounds")]
pub struct MemoryFault {
    pub addr: u64,
    pub len: usize,
    pub kind: AccessKind,
}

/// Width-typed, little-endian view over guest memory.
///
/// Implementors only provide the bulk accessors; the fixed-width helpers are derived from them.
pub trait MemorySurface {
    /// Size of the addressable range in bytes. Valid addresses are `0..size()`.
    fn size(&self) -> u64;

    fn read_bytes(&self, addr: u64, buf: &mut [u8]) -> Result<(), MemoryFault>;

    fn write_bytes(&mut self, addr: u64, data: &[u8]) -> Result<(), MemoryFault>;

    fn read_u8(&self, addr: u64) -> Result<u8, MemoryFault> {
        let mut buf = [0u8; 1];
        self.read_bytes(addr, &mut buf)?;
        Ok(buf[0])
    }

    fn read_u16(&self, addr: u64) -> Result<u16, MemoryFault> {
        let mut buf = [0u8; 2];
        self.read_bytes(addr, &mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    fn read_u32(&self, addr: u64) -> Result<u32, MemoryFault> {
        let mut buf = [0u8; 4];
        self.read_bytes(addr, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn read_u64(&self, addr: u64) -> Result<u64, MemoryFault> {
        let mut buf = [0u8; 8];
        self.read_bytes(addr, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    fn write_u8(&mut self, addr: u64, value: u8) -> Result<(), MemoryFault> {
        self.write_bytes(addr, &[value])
    }

    fn write_u16(&mut self, addr: u64, value: u16) -> Result<(), MemoryFault> {
        self.write_bytes(addr, &value.to_le_bytes())
    }

    fn write_u32(&mut self, addr: u64, value: u32) -> Result<(), MemoryFault> {
        self.write_bytes(addr, &value.to_le_bytes())
    }

    fn write_u64(&mut self, addr: u64, value: u64) -> Result<(), MemoryFault> {
        self.write_bytes(addr, &value.to_le_bytes())
    }

    /// Bulk-initialise a region, typically with a code or data image from a loader.
    fn load(&mut self, addr: u64, bytes: &[u8]) -> Result<(), MemoryFault> {
        self.write_bytes(addr, bytes)
    }
}

fn check_range(size: u64, addr: u64, len: usize, kind: AccessKind) -> Result<(), MemoryFault> {
    let fault = MemoryFault { addr, len, kind };
    let end = addr.checked_add(len as u64).ok_or(fault)?;
    if end > size {
        return Err(fault);
    }
    Ok(())
}

/// Fixed-size memory backed by a single contiguous buffer.
#[derive(Clone, Debug, Default)]
pub struct FlatMemory {
    mem: Vec<u8>,
}

impl FlatMemory {
    pub fn new(size: usize) -> Self {
        Self { mem: vec![0; size] }
    }

    pub fn from_bytes(mem: Vec<u8>) -> Self {
        Self { mem }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.mem
    }
}

impl MemorySurface for FlatMemory {
    fn size(&self) -> u64 {
        self.mem.len() as u64
    }

    fn read_bytes(&self, addr: u64, buf: &mut [u8]) -> Result<(), MemoryFault> {
        check_range(self.size(), addr, buf.len(), AccessKind::Read)?;
        let start = addr as usize;
        buf.copy_from_slice(&self.mem[start..start + buf.len()]);
        Ok(())
    }

    fn write_bytes(&mut self, addr: u64, data: &[u8]) -> Result<(), MemoryFault> {
        check_range(self.size(), addr, data.len(), AccessKind::Write)?;
        let start = addr as usize;
        self.mem[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }
}

/// Large guest address spaces without eagerly reserving host memory.
///
/// Pages are allocated on first write; reads from untouched pages return zero and do not allocate.
#[derive(Clone, Debug)]
pub struct SparseMemory {
    size: u64,
    pages: HashMap<u64, Box<[u8; SparseMemory::PAGE_SIZE]>>,
}

impl SparseMemory {
    pub const PAGE_SHIFT: u32 = 12;
    pub const PAGE_SIZE: usize = 1 << Self::PAGE_SHIFT;
    const PAGE_OFFSET_MASK: u64 = (Self::PAGE_SIZE as u64) - 1;

    pub fn new(size: u64) -> Self {
        Self {
            size,
            pages: HashMap::new(),
        }
    }

    pub fn allocated_pages(&self) -> usize {
        self.pages.len()
    }

    /// Splits `[addr, addr + len)` into `(page, offset_in_page, chunk_len, offset_in_access)`.
    fn chunks(addr: u64, len: usize) -> impl Iterator<Item = (u64, usize, usize, usize)> {
        let mut done = 0usize;
        std::iter::from_fn(move || {
            if done >= len {
                return None;
            }
            let cur = addr + done as u64;
            let page = cur >> Self::PAGE_SHIFT;
            let offset = (cur & Self::PAGE_OFFSET_MASK) as usize;
            let chunk = (Self::PAGE_SIZE - offset).min(len - done);
            let item = (page, offset, chunk, done);
            done += chunk;
            Some(item)
        })
    }
}

impl MemorySurface for SparseMemory {
    fn size(&self) -> u64 {
        self.size
    }

    fn read_bytes(&self, addr: u64, buf: &mut [u8]) -> Result<(), MemoryFault> {
        check_range(self.size, addr, buf.len(), AccessKind::Read)?;
        for (page, offset, chunk, at) in Self::chunks(addr, buf.len()) {
            let dst = &mut buf[at..at + chunk];
            match self.pages.get(&page) {
                Some(data) => dst.copy_from_slice(&data[offset..offset + chunk]),
                None => dst.fill(0),
            }
        }
        Ok(())
    }

    fn write_bytes(&mut self, addr: u64, data: &[u8]) -> Result<(), MemoryFault> {
        check_range(self.size, addr, data.len(), AccessKind::Write)?;
        for (page, offset, chunk, at) in Self::chunks(addr, data.len()) {
            let backing = self
                .pages
                .entry(page)
                .or_insert_with(|| Box::new([0u8; Self::PAGE_SIZE]));
            backing[offset..offset + chunk].copy_from_slice(&data[at..at + chunk]);
        }
        Ok(())
    }
}
