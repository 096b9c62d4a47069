//! Physical memory sources: LiME or raw guest memory dumps, plus an in-memory sparse store
use crate::error::{InspectError, InspectResult};
use log::debug;
use memmap2::Mmap;
use std::fs::File;
use std::path::Path;

pub mod sparse;

pub use sparse::SparseMemory;

/// Largest single read handed to a memory source. Bigger requests are split.
pub const MAX_READ_BLOCK: u64 = 1024 * 1024 * 256;

/// Read access to guest physical memory.
pub trait PhysicalMemory {
    /// Read `length` bytes at `address`. Callers keep `length` at or below
    /// [`MAX_READ_BLOCK`]; use [`PhysicalMemory::read`] for arbitrary sizes.
    fn read_block(&self, address: u64, length: usize) -> InspectResult<Vec<u8>>;

    /// Read `length` bytes at `address`, split into bounded blocks.
    fn read(&self, address: u64, length: u64) -> InspectResult<Vec<u8>> {
        if length <= MAX_READ_BLOCK {
            return self.read_block(address, length as usize);
        }

        let mut data = Vec::new();
        let mut offset = 0u64;
        while offset < length {
            let block = (length - offset).min(MAX_READ_BLOCK);
            let start = address.checked_add(offset).ok_or_else(|| {
                InspectError::inaccessible(address, length, "address overflows 64 bits")
            })?;
            let chunk = self.read_block(start, block as usize).map_err(|e| match e {
                InspectError::AddressInaccessible { reason, .. } => {
                    InspectError::inaccessible(address, length, reason)
                }
                other => other,
            })?;
            data.extend_from_slice(&chunk);
            offset += block;
        }
        Ok(data)
    }
}

impl<T: PhysicalMemory + ?Sized> PhysicalMemory for &T {
    fn read_block(&self, address: u64, length: usize) -> InspectResult<Vec<u8>> {
        (**self).read_block(address, length)
    }
}

/// Read a little-endian table entry of `width` bytes (4 or 8) at `index`.
pub fn read_entry(table: &[u8], index: usize, width: usize) -> Option<u64> {
    let start = index.checked_mul(width)?;
    let bytes = table.get(start..start + width)?;
    match width {
        4 => {
            let mut buf = [0u8; 4];
            buf.copy_from_slice(bytes);
            Some(u32::from_le_bytes(buf) as u64)
        }
        8 => {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(bytes);
            Some(u64::from_le_bytes(buf))
        }
        _ => None,
    }
}

/// A physical memory region parsed from the LiME header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryRegion {
    pub start: u64,
    /// Inclusive, as stored by LiME.
    pub end: u64,
    pub file_offset: u64,
}

impl MemoryRegion {
    /// Check if a physical address is within this memory region
    pub fn contains(&self, address: u64) -> bool {
        address >= self.start && address <= self.end
    }

    /// File offset for `[address, address + length)` if the whole span lies in this region.
    pub fn file_offset_of(&self, address: u64, length: u64) -> Option<u64> {
        if !self.contains(address) {
            return None;
        }
        if length > 0 && address.checked_add(length - 1)? > self.end {
            return None;
        }
        Some(self.file_offset + (address - self.start))
    }
}

/// Memory mapped guest physical memory dump
pub struct MemoryMap {
    _file: File,
    mapped: Mmap,
    regions: Vec<MemoryRegion>,
}

impl MemoryMap {
    /// Map a dump file. LiME files are split into their segments, anything
    /// else is treated as raw memory where physical address equals file offset.
    pub fn open(path: impl AsRef<Path>) -> InspectResult<Self> {
        let file = File::open(path.as_ref())?;
        let mapped = unsafe { Mmap::map(&file)? };

        let regions = match parse_lime_header(&mapped) {
            Some(regions) => {
                debug!("LiME dump with {} regions", regions.len());
                regions
            }
            None => {
                debug!("raw dump of {:#x} bytes", mapped.len());
                if mapped.is_empty() {
                    Vec::new()
                } else {
                    vec![MemoryRegion {
                        start: 0,
                        end: mapped.len() as u64 - 1,
                        file_offset: 0,
                    }]
                }
            }
        };

        Ok(MemoryMap {
            _file: file,
            mapped,
            regions,
        })
    }

    /// Get all memory regions
    pub fn regions(&self) -> &[MemoryRegion] {
        &self.regions
    }

    /// Check if the beginning of the file is the LiME signature.
    pub fn is_lime(&self) -> bool {
        is_lime(&self.mapped)
    }
}

impl PhysicalMemory for MemoryMap {
    fn read_block(&self, address: u64, length: usize) -> InspectResult<Vec<u8>> {
        let region = self
            .regions
            .iter()
            .find(|r| r.contains(address))
            .ok_or_else(|| {
                InspectError::inaccessible(address, length as u64, "no dump region covers address")
            })?;
        let offset = region.file_offset_of(address, length as u64).ok_or_else(|| {
            InspectError::inaccessible(address, length as u64, "read crosses end of dump region")
        })? as usize;
        self.mapped
            .get(offset..offset + length)
            .map(|s| s.to_vec())
            .ok_or_else(|| {
                InspectError::inaccessible(address, length as u64, "dump file is truncated")
            })
    }
}

const LIME_MAGIC: u32 = 0x4C694D45; // bytes [0x45, 0x4D, 0x69, 0x4C] = "EMiL" ASCII
const LIME_HEADER_SIZE: usize = 32;

fn read_u32(data: &[u8], offset: usize) -> Option<u32> {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(data.get(offset..offset + 4)?);
    Some(u32::from_le_bytes(buf))
}

fn read_u64(data: &[u8], offset: usize) -> Option<u64> {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(data.get(offset..offset + 8)?);
    Some(u64::from_le_bytes(buf))
}

/// Check if the beginning of the data is the LiME signature.
pub fn is_lime(data: &[u8]) -> bool {
    read_u32(data, 0) == Some(LIME_MAGIC)
}

/// Parse LiME segment headers and return the memory regions.
///
/// Each segment is a 32 byte header followed by the segment data:
/// - Magic: 4 bytes
/// - Version: 4 bytes
/// - Start: 8 bytes, physical address start
/// - End: 8 bytes, physical address end (inclusive)
/// - Reserved: 8 bytes
pub fn parse_lime_header(data: &[u8]) -> Option<Vec<MemoryRegion>> {
    let mut regions = Vec::new();
    let mut offset = 0usize;

    while offset + LIME_HEADER_SIZE <= data.len() {
        if read_u32(data, offset)? != LIME_MAGIC {
            break;
        }
        let start = read_u64(data, offset + 8)?;
        let end = read_u64(data, offset + 16)?;
        // A segment too large to address is a corrupt header, not a region.
        let region_size = match end
            .checked_sub(start)
            .and_then(|n| n.checked_add(1))
            .and_then(|n| usize::try_from(n).ok())
        {
            Some(size) => size,
            None => break,
        };
        let file_offset = (offset + LIME_HEADER_SIZE) as u64;
        regions.push(MemoryRegion {
            start,
            end,
            file_offset,
        });

        offset = match LIME_HEADER_SIZE
            .checked_add(region_size)
            .and_then(|n| offset.checked_add(n))
        {
            Some(next) => next,
            None => break,
        };
    }

    if regions.is_empty() {
        None
    } else {
        Some(regions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn lime_segment(start: u64, data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&LIME_MAGIC.to_le_bytes());
        out.extend_from_slice(&1u32.to_le_bytes());
        out.extend_from_slice(&start.to_le_bytes());
        out.extend_from_slice(&(start + data.len() as u64 - 1).to_le_bytes());
        out.extend_from_slice(&0u64.to_le_bytes());
        out.extend_from_slice(data);
        out
    }

    #[test]
    fn test_parse_lime_segments() {
        let mut dump = lime_segment(0x1000, &[0xaa; 0x10]);
        dump.extend(lime_segment(0x8000, &[0xbb; 0x20]));

        let regions = parse_lime_header(&dump).unwrap();
        assert_eq!(regions.len(), 2);
        assert_eq!(regions[0].start, 0x1000);
        assert_eq!(regions[0].end, 0x100f);
        assert_eq!(regions[0].file_offset, 32);
        assert_eq!(regions[1].start, 0x8000);
        assert_eq!(regions[1].file_offset, 32 + 0x10 + 32);
    }

    fn lime_header(start: u64, end: u64) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&LIME_MAGIC.to_le_bytes());
        out.extend_from_slice(&1u32.to_le_bytes());
        out.extend_from_slice(&start.to_le_bytes());
        out.extend_from_slice(&end.to_le_bytes());
        out.extend_from_slice(&0u64.to_le_bytes());
        out
    }

    #[test]
    fn test_corrupt_segment_size_is_rejected() {
        // The whole 64-bit space would overflow the segment size.
        assert!(parse_lime_header(&lime_header(0, u64::MAX)).is_none());
        assert!(parse_lime_header(&lime_header(0x2000, 0x1000)).is_none());

        // A valid segment followed by a corrupt one keeps the valid one.
        let mut dump = lime_segment(0x1000, &[0xaa; 0x10]);
        dump.extend(lime_header(0, u64::MAX));
        let regions = parse_lime_header(&dump).unwrap();
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].start, 0x1000);
    }

    #[test]
    fn test_raw_dump_is_not_lime() {
        assert!(!is_lime(&[0u8; 64]));
        assert!(parse_lime_header(&[0u8; 64]).is_none());
    }

    #[test]
    fn test_memory_map_reads_lime_region() -> Result<(), Box<dyn std::error::Error>> {
        let mut dump = lime_segment(0x1000, &[0x11; 0x10]);
        dump.extend(lime_segment(0x8000, &[0x22; 0x20]));
        let mut temp_file = NamedTempFile::new()?;
        temp_file.write_all(&dump)?;
        temp_file.flush()?;

        let map = MemoryMap::open(temp_file.path())?;
        assert!(map.is_lime());
        assert_eq!(map.read(0x8004, 4)?, vec![0x22; 4]);
        assert_eq!(map.read(0x1000, 0x10)?, vec![0x11; 0x10]);
        assert!(map.read(0x100c, 8).is_err());
        assert!(map.read(0x4000, 1).is_err());
        Ok(())
    }

    #[test]
    fn test_memory_map_raw_layout() -> Result<(), Box<dyn std::error::Error>> {
        let mut temp_file = NamedTempFile::new()?;
        let data: Vec<u8> = (0..=255u8).collect();
        temp_file.write_all(&data)?;
        temp_file.flush()?;

        let map = MemoryMap::open(temp_file.path())?;
        assert!(!map.is_lime());
        assert_eq!(map.read(0x10, 3)?, vec![0x10, 0x11, 0x12]);
        Ok(())
    }

    struct BlockCounter {
        calls: Cell<usize>,
    }

    impl PhysicalMemory for BlockCounter {
        fn read_block(&self, _address: u64, length: usize) -> InspectResult<Vec<u8>> {
            assert!(length as u64 <= MAX_READ_BLOCK);
            self.calls.set(self.calls.get() + 1);
            Ok(vec![0u8; 1])
        }
    }

    #[test]
    fn test_large_reads_are_split() {
        let counter = BlockCounter { calls: Cell::new(0) };
        let _ = counter.read(0, MAX_READ_BLOCK * 2 + 1);
        assert_eq!(counter.calls.get(), 3);
    }

    #[test]
    fn test_read_entry_widths() {
        let table = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08];
        assert_eq!(read_entry(&table, 1, 4), Some(0x08070605));
        assert_eq!(read_entry(&table, 0, 8), Some(0x0807060504030201));
        assert_eq!(read_entry(&table, 1, 8), None);
    }
}
