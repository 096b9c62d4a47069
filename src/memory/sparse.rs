//! Page-granular in-memory physical memory, handy for building table fixtures
use crate::error::{InspectError, InspectResult};
use crate::memory::PhysicalMemory;
use std::collections::BTreeMap;

const FRAME_SIZE: u64 = 0x1000;

/// Physical memory backed by individually allocated 4 KiB frames.
///
/// Bytes in frames that were never written are inaccessible, which mirrors
/// holes in a real guest physical address space.
#[derive(Debug, Default, Clone)]
pub struct SparseMemory {
    frames: BTreeMap<u64, Vec<u8>>,
}

impl SparseMemory {
    pub fn new() -> Self {
        SparseMemory {
            frames: BTreeMap::new(),
        }
    }

    /// Make the frame containing `address` accessible (zero filled).
    pub fn map_frame(&mut self, address: u64) -> &mut Vec<u8> {
        self.frames
            .entry(address & !(FRAME_SIZE - 1))
            .or_insert_with(|| vec![0u8; FRAME_SIZE as usize])
    }

    pub fn write_bytes(&mut self, address: u64, bytes: &[u8]) {
        for (i, byte) in bytes.iter().enumerate() {
            let addr = address + i as u64;
            let frame = self.map_frame(addr);
            frame[(addr % FRAME_SIZE) as usize] = *byte;
        }
    }

    pub fn write_u64(&mut self, address: u64, value: u64) {
        self.write_bytes(address, &value.to_le_bytes());
    }

    pub fn write_u32(&mut self, address: u64, value: u32) {
        self.write_bytes(address, &value.to_le_bytes());
    }

    /// Number of accessible frames.
    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }
}

impl PhysicalMemory for SparseMemory {
    fn read_block(&self, address: u64, length: usize) -> InspectResult<Vec<u8>> {
        let mut out = Vec::with_capacity(length);
        let mut addr = address;
        let end = address
            .checked_add(length as u64)
            .ok_or_else(|| InspectError::inaccessible(address, length as u64, "address overflow"))?;

        while addr < end {
            let base = addr & !(FRAME_SIZE - 1);
            let frame = self.frames.get(&base).ok_or_else(|| {
                InspectError::inaccessible(
                    address,
                    length as u64,
                    format!("frame {:#x} is not backed", base),
                )
            })?;
            let from = (addr - base) as usize;
            let to = ((end - base).min(FRAME_SIZE)) as usize;
            out.extend_from_slice(&frame[from..to]);
            addr = base + to as u64;
        }

        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_across_frames() {
        let mut mem = SparseMemory::new();
        mem.write_bytes(0x1ffe, &[1, 2, 3, 4]);
        assert_eq!(mem.frame_count(), 2);
        assert_eq!(mem.read(0x1ffe, 4).unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_unbacked_frame_is_inaccessible() {
        let mut mem = SparseMemory::new();
        mem.write_u64(0x1000, 7);
        let err = mem.read(0x1ff8, 0x10).unwrap_err();
        assert!(err.to_string().contains("0x2000"));
    }
}
