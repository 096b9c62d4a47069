//! Page table walking: turns root tables into ordered page ranges
use crate::arch::{
    EntryKind, LevelGeometry, PagingBackend, RegisterSource, Root, TableConstraints,
};
use crate::error::InspectResult;
use crate::memory::{read_entry, PhysicalMemory};
use crate::range::PageRange;
use log::{debug, info, warn};
use std::collections::HashSet;

pub mod cache;

pub use cache::{RootKey, TraversalCache};

/// How a walk should run.
#[derive(Debug, Clone, Default)]
pub struct WalkOptions {
    /// Root tables to walk instead of the ones named by the registers.
    pub roots: Option<Vec<Root>>,
    /// Store the unfiltered result of every freshly walked root in the cache.
    pub retain: bool,
    /// Descend into every table, even ones already reached through another entry.
    pub force_traverse_all: bool,
    /// Drop exact duplicates (same address, size and backing). Only matters
    /// together with `force_traverse_all`.
    pub collapse_duplicates: bool,
}

/// Walk every root and return all reachable page ranges sorted by virtual address.
///
/// Roots already present in `cache` are served from it without touching
/// `reader`. A root table that cannot be read aborts the walk; unreadable
/// lower-level tables are skipped.
pub fn walk(
    reader: &dyn PhysicalMemory,
    backend: &dyn PagingBackend,
    registers: &dyn RegisterSource,
    cache: &mut TraversalCache,
    options: &WalkOptions,
) -> InspectResult<Vec<PageRange>> {
    let roots = match &options.roots {
        Some(roots) => roots.clone(),
        None => backend.default_roots(&registers.registers()?)?,
    };

    let mut ranges = Vec::new();
    for root in roots {
        let key = RootKey::from(root);
        if let Some(cached) = cache.get(&key) {
            debug!("using cached walk of root {:#x} ({:?})", root.address, root.half);
            ranges.extend_from_slice(cached);
            continue;
        }

        let walked = TableWalker::new(reader, backend, root, options.force_traverse_all).run()?;
        if options.retain {
            cache.insert(key, walked.clone());
        }
        ranges.extend(walked);
    }

    ranges.sort_by_key(|r| (r.virtual_address, r.page_size, r.physical_address));
    if options.collapse_duplicates {
        ranges.dedup_by(|a, b| {
            a.virtual_address == b.virtual_address
                && a.page_size == b.page_size
                && a.physical_address == b.physical_address
        });
    }
    Ok(ranges)
}

/// Roots currently held by the cache.
pub fn cache_list(cache: &TraversalCache) -> Vec<RootKey> {
    cache.list()
}

pub fn cache_clear(cache: &mut TraversalCache) {
    cache.clear();
}

/// The range covering `address` and the physical address it maps to.
pub fn translate(ranges: &[PageRange], address: u64) -> Option<(&PageRange, u64)> {
    ranges
        .iter()
        .find_map(|range| range.translate(address).map(|phys| (range, phys)))
}

/// Recursive descent over one root.
struct TableWalker<'a> {
    reader: &'a dyn PhysicalMemory,
    backend: &'a dyn PagingBackend,
    root: Root,
    levels: &'a [LevelGeometry],
    force_traverse_all: bool,
    visited: HashSet<u64>,
    ranges: Vec<PageRange>,
    tables_read: usize,
}

impl<'a> TableWalker<'a> {
    fn new(
        reader: &'a dyn PhysicalMemory,
        backend: &'a dyn PagingBackend,
        root: Root,
        force_traverse_all: bool,
    ) -> Self {
        TableWalker {
            reader,
            backend,
            root,
            levels: backend.geometry(root.half),
            force_traverse_all,
            visited: HashSet::new(),
            ranges: Vec::new(),
            tables_read: 0,
        }
    }

    fn run(mut self) -> InspectResult<Vec<PageRange>> {
        let top = match self.levels.first() {
            Some(level) => *level,
            None => return Ok(Vec::new()),
        };
        let table = self.read_table(self.root.address, &top)?;
        self.visited.insert(self.root.address);

        let mut path = Vec::with_capacity(self.levels.len());
        self.walk_table(
            &table,
            self.root.address,
            0,
            0,
            TableConstraints::default(),
            &mut path,
        );

        info!(
            "{} root {:#x} ({:?}): {} tables, {} ranges",
            self.backend.architecture(),
            self.root.address,
            self.root.half,
            self.tables_read,
            self.ranges.len()
        );
        Ok(self.ranges)
    }

    fn read_table(&mut self, address: u64, level: &LevelGeometry) -> InspectResult<Vec<u8>> {
        let length = (level.entries * self.backend.entry_size()) as u64;
        self.tables_read += 1;
        self.reader.read(address, length)
    }

    fn walk_table(
        &mut self,
        table: &[u8],
        table_address: u64,
        depth: usize,
        va_prefix: u64,
        inherited: TableConstraints,
        path: &mut Vec<u64>,
    ) {
        let level = self.levels[depth];
        let width = self.backend.entry_size();

        for index in 0..level.entries {
            let raw = match read_entry(table, index, width) {
                Some(raw) => raw,
                None => break,
            };
            let entry = self.backend.decode_entry(&level, raw);
            let va = va_prefix | ((index as u64) << level.shift);
            let entry_address = table_address + (index * width) as u64;

            match entry.kind {
                EntryKind::Absent => {}
                EntryKind::Leaf { address } => {
                    path.push(entry_address);
                    let permissions = self.backend.leaf_permissions(&level, inherited, &entry);
                    self.ranges.push(PageRange {
                        virtual_address: self.backend.canonical_address(self.root.half, va),
                        page_size: level.page_size(),
                        physical_address: address,
                        permissions,
                        entry_path: path.clone(),
                    });
                    path.pop();
                }
                EntryKind::Table { address } => {
                    if level.last {
                        continue;
                    }
                    if !self.force_traverse_all && !self.visited.insert(address) {
                        debug!("table {:#x} already traversed, skipping", address);
                        continue;
                    }

                    let child_level = self.levels[depth + 1];
                    let child = match self.read_table(address, &child_level) {
                        Ok(child) => child,
                        Err(e) => {
                            warn!("skipping unreadable table at {:#x}: {}", address, e);
                            continue;
                        }
                    };

                    path.push(entry_address);
                    self.walk_table(
                        &child,
                        address,
                        depth + 1,
                        va,
                        inherited.merge(entry.constraints),
                        path,
                    );
                    path.pop();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::{AddressHalf, ControlRegisters, X86Backend, X86Mode};
    use crate::arch::x86::DEFAULT_PAT;
    use crate::memory::SparseMemory;

    const P: u64 = 1;
    const RW: u64 = 1 << 1;
    const US: u64 = 1 << 2;
    const PS: u64 = 1 << 7;

    fn backend() -> X86Backend {
        X86Backend::new(X86Mode::FourLevel, true, DEFAULT_PAT)
    }

    fn options(root: u64) -> WalkOptions {
        WalkOptions {
            roots: Some(vec![Root::full(root)]),
            ..Default::default()
        }
    }

    /// PML4 0x1000 -> PDPT 0x2000 -> PD 0x3000 with two 2M pages, plus a
    /// kernel-half PML4 entry reusing the same PDPT.
    fn shared_fixture() -> SparseMemory {
        let mut mem = SparseMemory::new();
        mem.map_frame(0x1000);
        mem.write_u64(0x1000, 0x2000 | P | RW | US);
        mem.write_u64(0x1000 + 256 * 8, 0x2000 | P | RW);
        mem.write_u64(0x2000, 0x3000 | P | RW | US);
        mem.write_u64(0x3000, 0x20_0000 | P | RW | US | PS);
        mem.write_u64(0x3008, 0x40_0000 | P | US | PS);
        mem
    }

    #[test]
    fn test_walk_dedups_shared_tables() {
        let mem = shared_fixture();
        let mut cache = TraversalCache::new();
        let ranges = walk(&mem, &backend(), &ControlRegisters::default(), &mut cache, &options(0x1000)).unwrap();

        assert_eq!(ranges.len(), 2);
        assert_eq!(ranges[0].virtual_address, 0);
        assert_eq!(ranges[0].page_size, 0x20_0000);
        assert_eq!(ranges[1].virtual_address, 0x20_0000);
        assert!(!ranges[1].permissions.is_writeable());
        assert_eq!(ranges[0].entry_path, vec![0x1000, 0x2000, 0x3000]);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_force_traverse_all_reaches_kernel_half() {
        let mem = shared_fixture();
        let mut cache = TraversalCache::new();
        let mut opts = options(0x1000);
        opts.force_traverse_all = true;
        let ranges = walk(&mem, &backend(), &ControlRegisters::default(), &mut cache, &opts).unwrap();

        assert_eq!(ranges.len(), 4);
        assert_eq!(ranges[2].virtual_address, 0xffff_8000_0000_0000);
        // The kernel-half PML4 entry has U/S clear.
        assert!(ranges[2].permissions.is_supervisor());
        assert!(ranges[0].permissions.is_user());
    }

    #[test]
    fn test_unreadable_root_is_an_error() {
        let mem = SparseMemory::new();
        let mut cache = TraversalCache::new();
        let err = walk(&mem, &backend(), &ControlRegisters::default(), &mut cache, &options(0x7000)).unwrap_err();
        assert!(err.to_string().contains("0x7000"));
    }

    #[test]
    fn test_unreadable_child_is_skipped() {
        let mut mem = SparseMemory::new();
        mem.write_u64(0x1000, 0x9000 | P | RW);
        mem.write_u64(0x1008, 0x2000 | P | RW);
        mem.write_u64(0x2000, PS | P | RW | 0x4000_0000);
        let mut cache = TraversalCache::new();
        let ranges = walk(&mem, &backend(), &ControlRegisters::default(), &mut cache, &options(0x1000)).unwrap();
        assert_eq!(ranges.len(), 1);
        assert_eq!(ranges[0].virtual_address, 1 << 39);
        assert_eq!(ranges[0].page_size, 0x4000_0000);
    }

    #[test]
    fn test_roots_from_registers() {
        let mem = shared_fixture();
        let regs = ControlRegisters {
            cr3: Some(0x1000),
            ..Default::default()
        };
        let mut cache = TraversalCache::new();
        let ranges = walk(&mem, &backend(), &regs, &mut cache, &WalkOptions::default()).unwrap();
        assert_eq!(ranges.len(), 2);
    }

    #[test]
    fn test_translate_lookup() {
        let mem = shared_fixture();
        let mut cache = TraversalCache::new();
        let ranges = walk(&mem, &backend(), &ControlRegisters::default(), &mut cache, &options(0x1000)).unwrap();
        let (range, phys) = translate(&ranges, 0x20_1234).unwrap();
        assert_eq!(range.virtual_address, 0x20_0000);
        assert_eq!(phys, 0x40_1234);
        assert!(translate(&ranges, 0x80_0000).is_none());
    }

    #[test]
    fn test_geometry_matches_half() {
        let b = backend();
        assert_eq!(b.geometry(AddressHalf::Full).len(), 4);
    }
}
