//! Page ranges: one leaf of a page table walk
use crate::arch::Permissions;
use serde::Serialize;
use std::fmt;

/// A contiguous virtual-to-physical mapping with uniform permissions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct PageRange {
    pub virtual_address: u64,
    pub page_size: u64,
    pub physical_address: u64,
    pub permissions: Permissions,
    /// Physical addresses of every table entry from the root down to the leaf.
    pub entry_path: Vec<u64>,
}

impl PageRange {
    /// Exclusive end, saturating at the top of the address space.
    pub fn end(&self) -> u64 {
        self.virtual_address.saturating_add(self.page_size)
    }

    pub fn physical_end(&self) -> u64 {
        self.physical_address.saturating_add(self.page_size)
    }

    pub fn contains(&self, address: u64) -> bool {
        address >= self.virtual_address && address - self.virtual_address < self.page_size
    }

    /// Physical address backing `address`, if it falls in this range.
    pub fn translate(&self, address: u64) -> Option<u64> {
        if self.contains(address) {
            Some(self.physical_address + (address - self.virtual_address))
        } else {
            None
        }
    }

    /// Drop everything below `address`. Only shrinks; a no-op when
    /// `address` is not strictly inside the range.
    pub fn cut_after(&mut self, address: u64) {
        if address > self.virtual_address && self.contains(address) {
            let delta = address - self.virtual_address;
            self.virtual_address = address;
            self.physical_address += delta;
            self.page_size -= delta;
        }
    }

    /// Drop everything at or above `address`. Only shrinks; a no-op when
    /// `address` is not strictly inside the range.
    pub fn cut_before(&mut self, address: u64) {
        if address > self.virtual_address && self.contains(address) {
            self.page_size = address - self.virtual_address;
        }
    }
}

impl fmt::Display for PageRange {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{:#018x} - {:#018x} {:>#12x} -> {:#014x}  {}",
            self.virtual_address,
            self.end(),
            self.page_size,
            self.physical_address,
            self.permissions
        )
    }
}

/// Neighbouring ranges merged for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CoalescedRange {
    pub virtual_address: u64,
    pub size: u64,
    pub physical_address: u64,
    pub permissions: Permissions,
    pub pages: usize,
}

impl fmt::Display for CoalescedRange {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{:#018x} - {:#018x} {:>#12x} -> {:#014x}  {} ({} pages)",
            self.virtual_address,
            self.virtual_address.saturating_add(self.size),
            self.size,
            self.physical_address,
            self.permissions,
            self.pages
        )
    }
}

/// Merge ranges that continue each other both virtually and physically and
/// share permissions. Input must be sorted by virtual address.
pub fn coalesce(ranges: &[PageRange]) -> Vec<CoalescedRange> {
    let mut merged: Vec<CoalescedRange> = Vec::new();

    for range in ranges {
        if let Some(last) = merged.last_mut() {
            let virt_end = last.virtual_address.checked_add(last.size);
            let phys_end = last.physical_address.checked_add(last.size);
            if virt_end == Some(range.virtual_address)
                && phys_end == Some(range.physical_address)
                && last.permissions == range.permissions
            {
                last.size += range.page_size;
                last.pages += 1;
                continue;
            }
        }
        merged.push(CoalescedRange {
            virtual_address: range.virtual_address,
            size: range.page_size,
            physical_address: range.physical_address,
            permissions: range.permissions,
            pages: 1,
        });
    }

    merged
}
