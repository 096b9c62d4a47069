//! End-to-end walks over hand-built page tables
use ptinspect::analysis::aliases::find_aliases;
use ptinspect::arch::{
    Aarch64Backend, Access, AddressHalf, ControlRegisters, PagingBackend, Riscv64Backend, Root,
    X86Backend, X86Mode,
};
use ptinspect::arch::riscv64::SvMode;
use ptinspect::arch::x86::DEFAULT_PAT;
use ptinspect::error::InspectResult;
use ptinspect::filter::{analyze, build_filter, WindowArgs};
use ptinspect::memory::{PhysicalMemory, SparseMemory};
use ptinspect::range::PageRange;
use ptinspect::search::{search, SearchOptions, SearchPattern};
use ptinspect::translation::{translate, walk, TraversalCache, WalkOptions};
use std::cell::Cell;

const P: u64 = 1 << 0;
const RW: u64 = 1 << 1;
const US: u64 = 1 << 2;
const NX: u64 = 1 << 63;

/// Counts block reads so tests can tell cached walks from fresh ones.
struct CountingReader<'a> {
    inner: &'a SparseMemory,
    reads: Cell<usize>,
}

impl PhysicalMemory for CountingReader<'_> {
    fn read_block(&self, address: u64, length: usize) -> InspectResult<Vec<u8>> {
        self.reads.set(self.reads.get() + 1);
        self.inner.read_block(address, length)
    }
}

fn x86_backend() -> X86Backend {
    X86Backend::new(X86Mode::FourLevel, true, DEFAULT_PAT)
}

fn cr3(address: u64) -> ControlRegisters {
    ControlRegisters {
        cr3: Some(address),
        ..Default::default()
    }
}

/// PML4 0x10000 -> PDPT 0x11000 -> PD 0x12000 -> PT 0x13000.
fn x86_tables(pd_flags: u64) -> SparseMemory {
    let mut mem = SparseMemory::new();
    mem.write_u64(0x10000, 0x11000 | P | RW | US);
    mem.write_u64(0x11000, 0x12000 | P | RW | US);
    mem.write_u64(0x12000, 0x13000 | pd_flags);
    // Make the lowest table readable even when it is empty.
    mem.map_frame(0x13000);
    mem
}

fn filtered(
    ranges: &[PageRange],
    tokens: &[&str],
    backend: &dyn PagingBackend,
) -> Vec<PageRange> {
    let (filter, window) = build_filter(tokens, &WindowArgs::default(), backend).unwrap();
    analyze(ranges, &filter, &window)
}

#[test]
fn test_writeable_filter_on_four_level_tables() {
    let mut mem = x86_tables(P | RW | US);
    mem.write_u64(0x13000 + 8, 0x2000 | P | RW | US | NX);
    mem.write_u64(0x13000 + 16, 0x3000 | P | US);

    let backend = x86_backend();
    let mut cache = TraversalCache::new();
    let ranges = walk(&mem, &backend, &cr3(0x10000), &mut cache, &WalkOptions::default()).unwrap();
    assert_eq!(ranges.len(), 2);

    let writeable = filtered(&ranges, &["w"], &backend);
    assert_eq!(writeable.len(), 1);
    assert_eq!(writeable[0].virtual_address, 0x1000);
    assert_eq!(writeable[0].page_size, 0x1000);
    assert_eq!(writeable[0].physical_address, 0x2000);
    assert!(!writeable[0].permissions.is_executable());
    assert_eq!(writeable[0].entry_path, vec![0x10000, 0x11000, 0x12000, 0x13008]);

    // No tokens and no window keep everything.
    assert_eq!(filtered(&ranges, &[], &backend), ranges);
}

#[test]
fn test_read_only_directory_entry_restricts_leaf() {
    let mut mem = x86_tables(P | US);
    mem.write_u64(0x13000 + 8, 0x2000 | P | RW | US | NX);

    let backend = x86_backend();
    let mut cache = TraversalCache::new();
    let ranges = walk(&mem, &backend, &cr3(0x10000), &mut cache, &WalkOptions::default()).unwrap();

    assert_eq!(ranges.len(), 1);
    assert!(!ranges[0].permissions.is_writeable());
    assert!(ranges[0].permissions.is_user());
    assert!(filtered(&ranges, &["w"], &backend).is_empty());
    assert_eq!(filtered(&ranges, &["ro"], &backend).len(), 1);
}

#[test]
fn test_retained_walk_is_served_without_reads() {
    let mut mem = x86_tables(P | RW | US);
    mem.write_u64(0x13000 + 8, 0x2000 | P | RW | US);

    let reader = CountingReader {
        inner: &mem,
        reads: Cell::new(0),
    };
    let backend = x86_backend();
    let mut cache = TraversalCache::new();
    let options = WalkOptions {
        retain: true,
        ..Default::default()
    };

    let first = walk(&reader, &backend, &cr3(0x10000), &mut cache, &options).unwrap();
    let reads = reader.reads.get();
    assert!(reads >= 4);
    assert_eq!(cache.len(), 1);

    let second = walk(&reader, &backend, &cr3(0x10000), &mut cache, &options).unwrap();
    assert_eq!(reader.reads.get(), reads);
    assert_eq!(first, second);

    cache.clear();
    walk(&reader, &backend, &cr3(0x10000), &mut cache, &WalkOptions::default()).unwrap();
    assert!(reader.reads.get() > reads);
}

#[test]
fn test_ranges_are_sorted_and_disjoint() {
    let mut mem = SparseMemory::new();
    mem.write_u64(0x10000, 0x11000 | P | RW);
    mem.write_u64(0x10000 + 511 * 8, 0x14000 | P | RW);
    // 1G page at 0x4000_0000, 2M pages under PDPT[0].
    mem.write_u64(0x11000 + 8, 0x4000_0000 | P | RW | (1 << 7));
    mem.write_u64(0x11000, 0x12000 | P | RW);
    mem.write_u64(0x12000 + 3 * 8, 0x60_0000 | P | (1 << 7));
    mem.write_u64(0x12000, 0x13000 | P | RW);
    mem.write_u64(0x13000 + 5 * 8, 0x5000 | P | RW);
    mem.write_u64(0x14000 + 510 * 8, 0x15000 | P | RW);
    mem.write_u64(0x15000, 0x20_0000 | P | RW | (1 << 7));

    let backend = x86_backend();
    let mut cache = TraversalCache::new();
    let ranges = walk(&mem, &backend, &cr3(0x10000), &mut cache, &WalkOptions::default()).unwrap();

    let vas: Vec<u64> = ranges.iter().map(|r| r.virtual_address).collect();
    assert_eq!(vas, vec![0x5000, 0x60_0000, 0x4000_0000, 0xffff_ffff_8000_0000]);
    for pair in ranges.windows(2) {
        assert!(pair[0].end() <= pair[1].virtual_address);
    }
    assert_eq!(ranges[2].page_size, 0x4000_0000);

    let (range, phys) = translate(&ranges, 0x4000_1234).unwrap();
    assert_eq!(range.physical_address, 0x4000_0000);
    assert_eq!(phys, 0x4000_1234);
    assert!(translate(&ranges, 0x7000).is_none());
}

#[test]
fn test_unreadable_child_table_is_skipped() {
    let mut mem = x86_tables(P | RW);
    mem.write_u64(0x13000, 0x2000 | P | RW);
    // PML4[1] points at memory the dump does not hold.
    mem.write_u64(0x10000 + 8, 0x7fff_0000 | P | RW);

    let backend = x86_backend();
    let mut cache = TraversalCache::new();
    let ranges = walk(&mem, &backend, &cr3(0x10000), &mut cache, &WalkOptions::default()).unwrap();
    assert_eq!(ranges.len(), 1);

    assert!(walk(&mem, &backend, &cr3(0x7000_0000), &mut cache, &WalkOptions::default()).is_err());
}

#[test]
fn test_aligned_search_through_walk() {
    let mut mem = x86_tables(P | RW);
    mem.write_u64(0x13000 + 8, 0x2000 | P | RW);
    mem.write_u64(0x13000 + 16, 0x3000 | P | RW);
    mem.write_u32(0x2ffc, 0xfeedface);
    mem.write_u32(0x3008, 0xfeedface);
    mem.write_u32(0x3013, 0xfeedface);

    let backend = x86_backend();
    let mut cache = TraversalCache::new();
    let ranges = walk(&mem, &backend, &cr3(0x10000), &mut cache, &WalkOptions::default()).unwrap();

    let pattern = SearchPattern::U32(0xfeedface);
    let all: Vec<u64> = search(&mem, &ranges, &pattern, SearchOptions::default())
        .unwrap()
        .map(|hit| hit.unwrap().address)
        .collect();
    assert_eq!(all, vec![0x1ffc, 0x2008, 0x2013]);

    let options = SearchOptions {
        alignment: 8,
        ..Default::default()
    };
    let aligned: Vec<u64> = search(&mem, &ranges, &pattern, options)
        .unwrap()
        .map(|hit| hit.unwrap().address)
        .collect();
    assert_eq!(aligned, vec![0x2008]);
}

#[test]
fn test_aliases_through_walk() {
    let mut mem = x86_tables(P | RW);
    mem.write_u64(0x13000 + 8, 0x2000 | P | RW);
    mem.write_u64(0x13000 + 9 * 8, 0x2000 | P);
    mem.write_u64(0x13000 + 10 * 8, 0x9000 | P);

    let backend = x86_backend();
    let mut cache = TraversalCache::new();
    let ranges = walk(&mem, &backend, &cr3(0x10000), &mut cache, &WalkOptions::default()).unwrap();

    let groups = find_aliases(&ranges);
    assert_eq!(groups.len(), 1);
    let vas: Vec<u64> = groups[0].members.iter().map(|r| r.virtual_address).collect();
    assert_eq!(vas, vec![0x1000, 0x9000]);
}

#[test]
fn test_force_traverse_all_revisits_shared_tables() {
    let mut mem = x86_tables(P | RW);
    mem.write_u64(0x13000, 0x2000 | P | RW);
    // Two PD entries share one page table.
    mem.write_u64(0x12000 + 8, 0x13000 | P | RW);

    let backend = x86_backend();
    let mut cache = TraversalCache::new();
    let once = walk(&mem, &backend, &cr3(0x10000), &mut cache, &WalkOptions::default()).unwrap();
    assert_eq!(once.len(), 1);

    let options = WalkOptions {
        force_traverse_all: true,
        ..Default::default()
    };
    let forced = walk(&mem, &backend, &cr3(0x10000), &mut cache, &options).unwrap();
    let vas: Vec<u64> = forced.iter().map(|r| r.virtual_address).collect();
    assert_eq!(vas, vec![0x0, 0x20_0000]);
}

fn arm_table(address: u64) -> u64 {
    address | 0b11
}

const ARM_AF: u64 = 1 << 10;
const ARM_UXN: u64 = 1 << 54;
const ARM_AP_EL0_RW: u64 = 0b01 << 6;
const ARM_APTABLE_READ_ONLY: u64 = 1 << 62;

#[test]
fn test_aarch64_both_halves() {
    let mut mem = SparseMemory::new();
    // TTBR1: L1 0x40000 -> L2 0x41000 (APTable read-only) -> L3 0x42000.
    mem.write_u64(0x40000, arm_table(0x41000));
    mem.write_u64(0x41000 + 8, arm_table(0x42000) | ARM_APTABLE_READ_ONLY);
    mem.write_u64(0x42000, 0x80000 | 0b11 | ARM_AF | ARM_UXN);
    // TTBR0: a 1G block at L1[1] writeable from EL0.
    mem.write_u64(0x50000 + 8, 0x4000_0000 | 0b01 | ARM_AF | ARM_AP_EL0_RW);

    let backend = Aarch64Backend::new(39, 39).unwrap();
    let registers = ControlRegisters {
        ttbr0_el1: Some(0x50000),
        ttbr1_el1: Some(0x40000),
        ..Default::default()
    };
    let roots = backend.default_roots(&registers).unwrap();
    assert_eq!(
        roots,
        vec![
            Root {
                address: 0x50000,
                half: AddressHalf::Lower
            },
            Root {
                address: 0x40000,
                half: AddressHalf::Upper
            },
        ]
    );

    let mut cache = TraversalCache::new();
    let ranges = walk(&mem, &backend, &registers, &mut cache, &WalkOptions::default()).unwrap();
    assert_eq!(ranges.len(), 2);

    let block = &ranges[0];
    assert_eq!(block.virtual_address, 0x4000_0000);
    assert_eq!(block.page_size, 0x4000_0000);
    assert_eq!(
        block.permissions.unprivileged,
        Access::READ | Access::WRITE | Access::EXECUTE
    );
    assert_eq!(block.permissions.privileged, Access::READ | Access::WRITE);

    let kernel = &ranges[1];
    assert_eq!(kernel.virtual_address, 0xffff_ff80_0020_0000);
    assert_eq!(kernel.physical_address, 0x80000);
    assert_eq!(kernel.permissions.privileged, Access::READ | Access::EXECUTE);
    assert!(kernel.permissions.is_supervisor());

    let user = filtered(&ranges, &["u"], &backend);
    assert_eq!(user.len(), 1);
    assert_eq!(user[0].virtual_address, 0x4000_0000);
}

fn sv_pte(address: u64, flags: u64) -> u64 {
    ((address >> 12) << 10) | flags
}

const SV_V: u64 = 1 << 0;
const SV_R: u64 = 1 << 1;
const SV_W: u64 = 1 << 2;
const SV_X: u64 = 1 << 3;
const SV_U: u64 = 1 << 4;

#[test]
fn test_riscv_sv39_gigapage_and_sign_extension() {
    let mut mem = SparseMemory::new();
    mem.write_u64(0x10000 + 2 * 8, sv_pte(0x8000_0000, SV_V | SV_R | SV_X));
    // W without R is reserved and never becomes a mapping.
    mem.write_u64(0x10000 + 3 * 8, sv_pte(0xc000_0000, SV_V | SV_W));
    mem.write_u64(0x10000 + 511 * 8, sv_pte(0x11000, SV_V));
    mem.write_u64(0x11000, sv_pte(0x12000, SV_V));
    mem.write_u64(0x12000 + 5 * 8, sv_pte(0x9000_5000, SV_V | SV_R | SV_W | SV_U));

    let backend = Riscv64Backend::new(SvMode::Sv39);
    let registers = ControlRegisters {
        satp: Some((8u64 << 60) | (0x10000 >> 12)),
        ..Default::default()
    };
    let mut cache = TraversalCache::new();
    let ranges = walk(&mem, &backend, &registers, &mut cache, &WalkOptions::default()).unwrap();

    assert_eq!(ranges.len(), 2);
    assert_eq!(ranges[0].virtual_address, 0x8000_0000);
    assert_eq!(ranges[0].page_size, 0x4000_0000);
    assert_eq!(ranges[0].permissions.privileged, Access::READ | Access::EXECUTE);

    assert_eq!(ranges[1].virtual_address, 0xffff_ffff_c000_5000);
    assert_eq!(ranges[1].physical_address, 0x9000_5000);
    assert!(ranges[1].permissions.is_user());
    assert!(!ranges[1].permissions.privileged.contains(Access::EXECUTE));
}

const PS: u64 = 1 << 7;

#[test]
fn test_legacy_two_level_walk() {
    let mut mem = SparseMemory::new();
    // Page directory at 0x10000 with 4-byte entries.
    mem.write_u32(0x10000 + 4, (0x11000 | P | RW | US) as u32);
    mem.write_u32(0x10000 + 0x300 * 4, (0x80_0000 | P | RW | PS) as u32);
    mem.write_u32(0x11000 + 3 * 4, (0x2000 | P | RW | US) as u32);

    let backend = X86Backend::new(X86Mode::Legacy, true, DEFAULT_PAT);
    let mut cache = TraversalCache::new();
    let ranges = walk(&mem, &backend, &cr3(0x10000), &mut cache, &WalkOptions::default()).unwrap();

    assert_eq!(ranges.len(), 2);
    assert_eq!(ranges[0].virtual_address, 0x40_3000);
    assert_eq!(ranges[0].physical_address, 0x2000);
    assert_eq!(ranges[0].page_size, 0x1000);
    assert!(ranges[0].permissions.is_user());

    assert_eq!(ranges[1].virtual_address, 0xc000_0000);
    assert_eq!(ranges[1].physical_address, 0x80_0000);
    assert_eq!(ranges[1].page_size, 0x40_0000);
    // Legacy paging has no execute-disable bit.
    assert!(ranges[1].permissions.is_executable());
    assert!(ranges[1].permissions.is_supervisor());
}

#[test]
fn test_pae_walk_with_unaligned_pdpt() {
    let mut mem = SparseMemory::new();
    // The PDPT only needs 32-byte alignment.
    mem.write_u64(0x10020 + 3 * 8, 0x11000 | P);
    mem.write_u64(0x11000, 0x12000 | P | RW);
    mem.write_u64(0x11000 + 8, 0x40_0000 | P | RW | PS | NX);
    mem.write_u64(0x12000 + 5 * 8, 0x7000 | P);

    let backend = X86Backend::new(X86Mode::Pae, true, DEFAULT_PAT);
    let mut cache = TraversalCache::new();
    let ranges = walk(&mem, &backend, &cr3(0x10020), &mut cache, &WalkOptions::default()).unwrap();

    assert_eq!(ranges.len(), 2);
    assert_eq!(ranges[0].virtual_address, 0xc000_5000);
    assert_eq!(ranges[0].physical_address, 0x7000);
    assert!(ranges[0].permissions.is_executable());
    assert!(!ranges[0].permissions.is_writeable());

    assert_eq!(ranges[1].virtual_address, 0xc020_0000);
    assert_eq!(ranges[1].page_size, 0x20_0000);
    assert!(ranges[1].permissions.is_writeable());
    assert!(!ranges[1].permissions.is_executable());
}

#[test]
fn test_five_level_sign_extension() {
    let mut mem = SparseMemory::new();
    mem.write_u64(0x10000 + 511 * 8, 0x11000 | P | RW);
    mem.write_u64(0x11000, 0x12000 | P | RW);
    mem.write_u64(0x12000, 0x4000_0000 | P | RW | PS);

    let backend = X86Backend::new(X86Mode::FiveLevel, true, DEFAULT_PAT);
    let mut cache = TraversalCache::new();
    let ranges = walk(&mem, &backend, &cr3(0x10000), &mut cache, &WalkOptions::default()).unwrap();

    assert_eq!(ranges.len(), 1);
    assert_eq!(ranges[0].virtual_address, 0xffff_0000_0000_0000);
    assert_eq!(ranges[0].page_size, 0x4000_0000);
}

#[test]
fn test_collapse_duplicates() {
    let mut mem = x86_tables(P | RW);
    mem.write_u64(0x13000 + 8, 0x2000 | P | RW);
    mem.write_u64(0x13000 + 16, 0x3000 | P | RW);

    let backend = x86_backend();
    let mut cache = TraversalCache::new();
    // The same root twice yields every range twice.
    let roots = Some(vec![Root::full(0x10000), Root::full(0x10000)]);

    let options = WalkOptions {
        roots: roots.clone(),
        force_traverse_all: true,
        ..Default::default()
    };
    let doubled = walk(&mem, &backend, &ControlRegisters::default(), &mut cache, &options).unwrap();
    let vas: Vec<u64> = doubled.iter().map(|r| r.virtual_address).collect();
    assert_eq!(vas, vec![0x1000, 0x1000, 0x2000, 0x2000]);

    let options = WalkOptions {
        roots,
        force_traverse_all: true,
        collapse_duplicates: true,
        ..Default::default()
    };
    let collapsed = walk(&mem, &backend, &ControlRegisters::default(), &mut cache, &options).unwrap();
    let vas: Vec<u64> = collapsed.iter().map(|r| r.virtual_address).collect();
    assert_eq!(vas, vec![0x1000, 0x2000]);
}
