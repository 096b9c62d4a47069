//! Alias detection: distinct virtual mappings of the same physical memory
use crate::range::PageRange;
use log::info;
use serde::Serialize;
use std::collections::HashSet;

/// Ranges whose physical backing overlaps, transitively.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AliasGroup {
    pub physical_start: u64,
    /// Exclusive.
    pub physical_end: u64,
    /// Sorted by virtual address.
    pub members: Vec<PageRange>,
}

/// Group ranges by overlapping physical intervals. Only groups reached
/// through at least two distinct virtual addresses are reported.
pub fn find_aliases(ranges: &[PageRange]) -> Vec<AliasGroup> {
    let mut by_phys: Vec<&PageRange> = ranges.iter().collect();
    by_phys.sort_by_key(|r| (r.physical_address, r.virtual_address));

    let mut groups = Vec::new();
    let mut cluster: Vec<&PageRange> = Vec::new();
    let mut cluster_start = 0u64;
    let mut cluster_end = 0u64;

    for range in by_phys {
        if !cluster.is_empty() && range.physical_address < cluster_end {
            cluster_end = cluster_end.max(range.physical_end());
            cluster.push(range);
            continue;
        }
        flush(&mut groups, &mut cluster, cluster_start, cluster_end);
        cluster_start = range.physical_address;
        cluster_end = range.physical_end();
        cluster.push(range);
    }
    flush(&mut groups, &mut cluster, cluster_start, cluster_end);

    info!("found {} alias groups among {} ranges", groups.len(), ranges.len());
    groups
}

fn flush(groups: &mut Vec<AliasGroup>, cluster: &mut Vec<&PageRange>, start: u64, end: u64) {
    let distinct: HashSet<u64> = cluster.iter().map(|r| r.virtual_address).collect();
    if distinct.len() >= 2 {
        let mut members: Vec<PageRange> = cluster.iter().map(|r| (*r).clone()).collect();
        members.sort_by_key(|r| r.virtual_address);
        groups.push(AliasGroup {
            physical_start: start,
            physical_end: end,
            members,
        });
    }
    cluster.clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::{Access, CachePolicy, Permissions};

    fn range(va: u64, size: u64, phys: u64) -> PageRange {
        PageRange {
            virtual_address: va,
            page_size: size,
            physical_address: phys,
            permissions: Permissions {
                privileged: Access::READ,
                unprivileged: Access::empty(),
                cache: CachePolicy::WriteBack,
            },
            entry_path: Vec::new(),
        }
    }

    #[test]
    fn test_exact_alias_pair() {
        let ranges = vec![
            range(0x1000, 0x1000, 0x5000),
            range(0xffff_8880_0000_5000, 0x1000, 0x5000),
            range(0x3000, 0x1000, 0x9000),
        ];
        let groups = find_aliases(&ranges);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].physical_start, 0x5000);
        assert_eq!(groups[0].physical_end, 0x6000);
        let vas: Vec<u64> = groups[0].members.iter().map(|r| r.virtual_address).collect();
        assert_eq!(vas, vec![0x1000, 0xffff_8880_0000_5000]);
    }

    #[test]
    fn test_large_page_overlaps_small_pages() {
        let ranges = vec![
            range(0xffff_8880_0020_0000, 0x20_0000, 0x20_0000),
            range(0x7000, 0x1000, 0x20_3000),
            range(0x8000, 0x1000, 0x3f_f000),
            range(0x9000, 0x1000, 0x40_0000),
        ];
        let groups = find_aliases(&ranges);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].members.len(), 3);
        assert_eq!(groups[0].physical_end, 0x40_0000);
    }

    #[test]
    fn test_duplicates_of_one_address_are_not_aliases() {
        let ranges = vec![range(0x1000, 0x1000, 0x5000), range(0x1000, 0x1000, 0x5000)];
        assert!(find_aliases(&ranges).is_empty());
    }
}
