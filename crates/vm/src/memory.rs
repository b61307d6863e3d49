/// Memory Regions
///
/// Instruction memory, data memory and per-core stacks are each one
/// `MemoryRegion`. All access is bounds-checked against the logical length;
/// shared regions are read and written without locks through relaxed
/// per-byte atomics.

use crate::error::{AllocError, Fault};
use crate::hal::allocator::{PageAllocator, PageBlock};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// What a region holds, for diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegionKind {
    Instruction,
    Data,
    Stack,
}

impl fmt::Display for RegionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RegionKind::Instruction => "instruction",
            RegionKind::Data => "data",
            RegionKind::Stack => "stack",
        };
        f.write_str(name)
    }
}

/// Owned page-backed buffer with a fixed logical length
pub struct MemoryRegion {
    block: PageBlock,
    len: usize,
    kind: RegionKind,
    /// Rejected accesses
    violations: AtomicU64,
}

impl MemoryRegion {
    /// Acquire `len` zeroed bytes from the allocator
    pub fn new(
        allocator: &dyn PageAllocator,
        len: usize,
        kind: RegionKind,
    ) -> Result<Self, AllocError> {
        let block = allocator.acquire(len)?;
        log::debug!("{} region: {} bytes ({} mapped)", kind, len, block.len());
        Ok(Self {
            block,
            len,
            kind,
            violations: AtomicU64::new(0),
        })
    }

    /// Instruction memory holding `words`
    pub fn with_words(allocator: &dyn PageAllocator, words: &[u64]) -> Result<Self, AllocError> {
        let region = Self::new(allocator, words.len() * 8, RegionKind::Instruction)?;
        for (i, &word) in words.iter().enumerate() {
            region.store_le(i * 8, word, 8);
        }
        Ok(region)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn kind(&self) -> RegionKind {
        self.kind
    }

    /// Number of out-of-bounds accesses rejected so far
    pub fn violations(&self) -> u64 {
        self.violations.load(Ordering::Relaxed)
    }

    /// Translate `[address, address + width)` to an offset, or fail
    pub fn check(&self, address: u64, width: u64) -> Result<usize, Fault> {
        let end = address.checked_add(width);
        match end {
            Some(end) if end <= self.len as u64 => Ok(address as usize),
            _ => {
                self.violations.fetch_add(1, Ordering::Relaxed);
                Err(Fault::OutOfBounds {
                    region: self.kind,
                    address,
                    width,
                })
            }
        }
    }

    fn load_le(&self, offset: usize, width: usize) -> u64 {
        let cells = &self.block.cells()[offset..offset + width];
        cells
            .iter()
            .rev()
            .fold(0u64, |acc, c| (acc << 8) | c.load(Ordering::Relaxed) as u64)
    }

    fn store_le(&self, offset: usize, value: u64, width: usize) {
        let cells = &self.block.cells()[offset..offset + width];
        for (i, c) in cells.iter().enumerate() {
            c.store((value >> (i * 8)) as u8, Ordering::Relaxed);
        }
    }

    /// Little-endian read of `width` bytes (1, 2, 4 or 8), zero-extended
    pub fn read(&self, address: u64, width: u64) -> Result<u64, Fault> {
        let offset = self.check(address, width)?;
        Ok(self.load_le(offset, width as usize))
    }

    /// Little-endian write of the low `width` bytes of `value`
    pub fn write(&self, address: u64, value: u64, width: u64) -> Result<(), Fault> {
        let offset = self.check(address, width)?;
        self.store_le(offset, value, width as usize);
        Ok(())
    }

    pub fn read_u8(&self, address: u64) -> Result<u8, Fault> {
        Ok(self.read(address, 1)? as u8)
    }

    pub fn read_u16(&self, address: u64) -> Result<u16, Fault> {
        Ok(self.read(address, 2)? as u16)
    }

    pub fn read_u32(&self, address: u64) -> Result<u32, Fault> {
        Ok(self.read(address, 4)? as u32)
    }

    pub fn read_u64(&self, address: u64) -> Result<u64, Fault> {
        self.read(address, 8)
    }

    pub fn write_u8(&self, address: u64, value: u8) -> Result<(), Fault> {
        self.write(address, value as u64, 1)
    }

    pub fn write_u16(&self, address: u64, value: u16) -> Result<(), Fault> {
        self.write(address, value as u64, 2)
    }

    pub fn write_u32(&self, address: u64, value: u32) -> Result<(), Fault> {
        self.write(address, value as u64, 4)
    }

    pub fn write_u64(&self, address: u64, value: u64) -> Result<(), Fault> {
        self.write(address, value, 8)
    }

    pub fn read_bytes(&self, address: u64, len: usize) -> Result<Vec<u8>, Fault> {
        let offset = self.check(address, len as u64)?;
        Ok(self.block.cells()[offset..offset + len]
            .iter()
            .map(|c| c.load(Ordering::Relaxed))
            .collect())
    }

    pub fn write_bytes(&self, address: u64, bytes: &[u8]) -> Result<(), Fault> {
        let offset = self.check(address, bytes.len() as u64)?;
        for (c, &b) in self.block.cells()[offset..offset + bytes.len()].iter().zip(bytes) {
            c.store(b, Ordering::Relaxed);
        }
        Ok(())
    }

    /// NUL-terminated string starting at `address`
    pub fn read_cstr(&self, address: u64) -> Result<String, Fault> {
        let start = self.check(address, 1)?;
        let tail = &self.block.cells()[start..self.len];
        let mut bytes = Vec::new();
        for c in tail {
            match c.load(Ordering::Relaxed) {
                0 => return Ok(String::from_utf8_lossy(&bytes).into_owned()),
                b => bytes.push(b),
            }
        }
        Err(Fault::UnterminatedString { address })
    }
}

impl fmt::Debug for MemoryRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryRegion")
            .field("kind", &self.kind)
            .field("len", &self.len)
            .field("violations", &self.violations())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::allocator::HostPageAllocator;

    fn data(len: usize) -> MemoryRegion {
        MemoryRegion::new(&HostPageAllocator::new(), len, RegionKind::Data).unwrap()
    }

    #[test]
    fn translation_is_valid_inside_and_fails_at_len() {
        let region = data(64);
        assert_eq!(region.check(0, 1), Ok(0));
        assert_eq!(region.check(63, 1), Ok(63));
        assert_eq!(region.check(56, 8), Ok(56));

        assert!(region.check(64, 1).is_err());
        assert!(region.check(57, 8).is_err());
        assert!(region.check(u64::MAX, 8).is_err());
        assert_eq!(region.violations(), 3);
    }

    #[test]
    fn logical_length_hides_the_rest_of_the_page() {
        let region = data(10);
        assert_eq!(
            region.read_u8(10),
            Err(Fault::OutOfBounds {
                region: RegionKind::Data,
                address: 10,
                width: 1,
            })
        );
    }

    #[test]
    fn values_are_little_endian() {
        let region = data(16);
        region.write_u64(0, 0x1122_3344_5566_7788).unwrap();
        assert_eq!(region.read_u8(0).unwrap(), 0x88);
        assert_eq!(region.read_u16(0).unwrap(), 0x7788);
        assert_eq!(region.read_u32(4).unwrap(), 0x1122_3344);
        assert_eq!(region.read_bytes(0, 2).unwrap(), vec![0x88, 0x77]);

        region.write_u16(8, 0xBEEF).unwrap();
        assert_eq!(region.read_u64(8).unwrap(), 0xBEEF);
    }

    #[test]
    fn strings_must_terminate_in_bounds() {
        let region = data(8);
        region.write_bytes(0, b"abc\0").unwrap();
        assert_eq!(region.read_cstr(0).unwrap(), "abc");
        assert_eq!(region.read_cstr(3).unwrap(), "");

        region.write_bytes(4, b"wxyz").unwrap();
        assert_eq!(region.read_cstr(4), Err(Fault::UnterminatedString { address: 4 }));
        assert!(matches!(region.read_cstr(8), Err(Fault::OutOfBounds { .. })));
    }

    #[test]
    fn instruction_words_are_laid_out_in_order() {
        let region = MemoryRegion::with_words(&HostPageAllocator::new(), &[1, 2, u64::MAX]).unwrap();
        assert_eq!(region.kind(), RegionKind::Instruction);
        assert_eq!(region.len(), 24);
        assert_eq!(region.read_u64(8).unwrap(), 2);
        assert_eq!(region.read_u64(16).unwrap(), u64::MAX);
    }
}
