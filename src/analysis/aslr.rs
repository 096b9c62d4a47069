//! Kernel ASLR: image slide, direct map base and leaked pointers to them
use crate::arch::{AslrLayout, PrivilegeContext};
use crate::error::InspectResult;
use crate::memory::PhysicalMemory;
use crate::range::PageRange;
use crate::search::{search, SearchOptions, SearchPattern};
use log::{info, warn};
use serde::Serialize;
use std::fmt;

/// Matches reported per searched value unless the caller asks otherwise.
pub const DEFAULT_LEAKS_PER_VALUE: u64 = 10;

const PRIVILEGED: PrivilegeContext = PrivilegeContext {
    supervisor: true,
    user: false,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AslrInfo {
    pub image_anchor: Option<PageRange>,
    /// Virtual address the kernel image text was placed at.
    pub image_base: Option<u64>,
    pub image_slide: Option<i64>,
    pub physmap_anchor: Option<PageRange>,
    /// Virtual address physical address zero is mapped at.
    pub physmap_base: Option<u64>,
    pub physmap_slide: Option<i64>,
}

fn within(window: (u64, u64), address: u64) -> bool {
    address >= window.0 && (address < window.1 || window.1 == u64::MAX)
}

fn aligned(value: u64, alignment: u64) -> bool {
    alignment == 0 || value % alignment == 0
}

/// Locate the kernel image and direct map anchors in `ranges` (sorted by
/// virtual address). `None` when the architecture has no known layout or
/// neither anchor is present.
pub fn aslr_info(ranges: &[PageRange], layout: Option<AslrLayout>, verbose: bool) -> Option<AslrInfo> {
    let layout = layout?;

    let image_anchor = ranges.iter().find(|r| {
        within(layout.image_window, r.virtual_address)
            && r.permissions.executable_in(PRIVILEGED)
            && aligned(r.physical_address, layout.image_phys_alignment)
    });

    let physmap_anchor = ranges.iter().find(|r| {
        within(layout.physmap_window, r.virtual_address)
            && r.permissions.writeable_in(PRIVILEGED)
            && !r.permissions.executable_in(PRIVILEGED)
            && r.virtual_address >= r.physical_address
            && aligned(r.virtual_address - r.physical_address, layout.physmap_alignment)
    });

    if image_anchor.is_none() && physmap_anchor.is_none() {
        return None;
    }

    let image_base = image_anchor.map(|r| r.virtual_address);
    let physmap_base = physmap_anchor.map(|r| r.virtual_address - r.physical_address);
    let info = AslrInfo {
        image_anchor: image_anchor.cloned(),
        image_base,
        image_slide: image_base.map(|b| b.wrapping_sub(layout.image_base) as i64),
        physmap_anchor: physmap_anchor.cloned(),
        physmap_base,
        physmap_slide: physmap_base.map(|b| b.wrapping_sub(layout.physmap_base) as i64),
    };

    if verbose {
        if let Some(anchor) = &info.image_anchor {
            info!("kernel image anchor: {}", anchor);
        }
        if let Some(anchor) = &info.physmap_anchor {
            info!("physmap anchor: {}", anchor);
        }
    }
    Some(info)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LeakKind {
    ImageBase,
    PhysmapBase,
}

impl LeakKind {
    /// Low bytes dropped from the value before searching.
    fn dropped_bytes(&self) -> usize {
        match self {
            LeakKind::ImageBase => 3,
            LeakKind::PhysmapBase => 5,
        }
    }
}

impl fmt::Display for LeakKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            LeakKind::ImageBase => write!(f, "image base"),
            LeakKind::PhysmapBase => write!(f, "physmap base"),
        }
    }
}

/// A copy of a slid pointer found in memory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LeakReport {
    pub kind: LeakKind,
    pub value: u64,
    /// Start of the full 8-byte value holding the match.
    pub address: u64,
    pub range: PageRange,
}

/// Search `ranges` for the high bytes of the image base and physmap base.
///
/// Ranges whose backing cannot be read are skipped.
pub fn find_leaks(
    reader: &dyn PhysicalMemory,
    ranges: &[PageRange],
    info: &AslrInfo,
    per_value: u64,
) -> InspectResult<Vec<LeakReport>> {
    let mut reports = Vec::new();
    let values = [
        (LeakKind::ImageBase, info.image_base),
        (LeakKind::PhysmapBase, info.physmap_base),
    ];

    for (kind, value) in values {
        let value = match value {
            Some(value) => value,
            None => continue,
        };
        let dropped = kind.dropped_bytes();
        let pattern = SearchPattern::Bytes(value.to_le_bytes()[dropped..].to_vec());
        let mut found = 0u64;

        for range in ranges {
            if found >= per_value {
                break;
            }
            let options = SearchOptions {
                max_results: per_value - found,
                ..Default::default()
            };
            for hit in search(reader, std::slice::from_ref(range), &pattern, options)? {
                match hit {
                    Ok(hit) => {
                        found += 1;
                        reports.push(LeakReport {
                            kind,
                            value,
                            address: hit.address.wrapping_sub(dropped as u64),
                            range: hit.range,
                        });
                    }
                    Err(e) => {
                        warn!("skipping range {:#x}: {}", range.virtual_address, e);
                    }
                }
            }
        }
        info!("{} {:#x}: {} leaks", kind, value, found);
    }

    Ok(reports)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::{Access, CachePolicy, Permissions};
    use crate::memory::SparseMemory;

    const LAYOUT: AslrLayout = AslrLayout {
        image_window: (0xffff_ffff_8000_0000, 0xffff_ffff_c000_0000),
        image_base: 0xffff_ffff_8100_0000,
        image_phys_alignment: 0x20_0000,
        physmap_window: (0xffff_8880_0000_0000, 0xffff_c880_0000_0000),
        physmap_base: 0xffff_8880_0000_0000,
        physmap_alignment: 0x4000_0000,
    };

    fn range(va: u64, size: u64, phys: u64, privileged: Access) -> PageRange {
        PageRange {
            virtual_address: va,
            page_size: size,
            physical_address: phys,
            permissions: Permissions {
                privileged,
                unprivileged: Access::empty(),
                cache: CachePolicy::WriteBack,
            },
            entry_path: Vec::new(),
        }
    }

    fn kernel_ranges() -> Vec<PageRange> {
        let rw = Access::READ | Access::WRITE;
        let rx = Access::READ | Access::EXECUTE;
        vec![
            range(0xffff_9a00_0000_0000, 0x20_0000, 0x0, rw),
            range(0xffff_9a00_0100_0000, 0x1000, 0x100_0000, rw),
            range(0xffff_ffff_9c00_0000, 0x20_0000, 0x1c00_0000, Access::READ),
            range(0xffff_ffff_9c20_0000, 0x20_0000, 0x1c20_0000, rx),
        ]
    }

    #[test]
    fn test_slides() {
        let info = aslr_info(&kernel_ranges(), Some(LAYOUT), true).unwrap();
        assert_eq!(info.image_base, Some(0xffff_ffff_9c20_0000));
        assert_eq!(info.image_slide, Some(0x1b20_0000));
        assert_eq!(info.physmap_base, Some(0xffff_9a00_0000_0000));
        assert_eq!(info.physmap_slide, Some(0x1180_0000_0000));
    }

    #[test]
    fn test_no_layout_or_anchor() {
        assert!(aslr_info(&kernel_ranges(), None, false).is_none());
        let user_only = vec![range(0x40_0000, 0x1000, 0x1000, Access::READ | Access::EXECUTE)];
        assert!(aslr_info(&user_only, Some(LAYOUT), false).is_none());
    }

    #[test]
    fn test_find_leaks_reports_value_start() {
        let mut mem = SparseMemory::new();
        // A pointer into the slid image with arbitrary low bytes.
        mem.write_u64(0x1c00_0010, 0xffff_ffff_9c43_2110);
        mem.write_u64(0x1c00_0100, 0xffff_9a00_0012_3456);

        let info = aslr_info(&kernel_ranges(), Some(LAYOUT), false).unwrap();
        let scanned = vec![
            range(0xffff_ffff_9c00_0000, 0x1000, 0x1c00_0000, Access::READ),
            // Not backed by the dump; skipped.
            range(0xffff_ffff_9c00_1000, 0x1000, 0x7000_0000, Access::READ),
        ];
        let leaks = find_leaks(&mem, &scanned, &info, DEFAULT_LEAKS_PER_VALUE).unwrap();

        assert_eq!(leaks.len(), 2);
        assert_eq!(leaks[0].kind, LeakKind::ImageBase);
        assert_eq!(leaks[0].address, 0xffff_ffff_9c00_0010);
        assert_eq!(leaks[1].kind, LeakKind::PhysmapBase);
        assert_eq!(leaks[1].address, 0xffff_ffff_9c00_0100);
    }
}
