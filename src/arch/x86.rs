//! x86 family paging: legacy 32-bit, PAE, 4-level and 5-level long mode
use super::{
    bit, field, mask, sign_extend, uniform_levels, Access, AddressHalf, Architecture,
    AslrLayout, CachePolicy, ControlRegisters, DecodedEntry, LevelGeometry, PagingBackend,
    Permissions, Root, TableConstraints,
};
use crate::error::{InspectError, InspectResult};

const PAGE_PRESENT: u64 = 1 << 0;
const PAGE_RW: u64 = 1 << 1;
const PAGE_USER: u64 = 1 << 2;
const PAGE_PSE: u64 = 1 << 7; // Page Size Extension (large page)
const PAGE_NX: u64 = 1 << 63;

/// Bit positions feeding the PAT index.
const PWT_BIT: u32 = 3;
const PCD_BIT: u32 = 4;
const PAT_BIT_SMALL: u32 = 7;
const PAT_BIT_LARGE: u32 = 12;

/// IA32_PAT power-on value: WB, WT, UC-, UC, WB, WT, UC-, UC.
pub const DEFAULT_PAT: u64 = 0x0007_0406_0007_0406;

/// Maximum physical address bits (Intel SDM).
const MAXPHYADDR: u32 = 52;

const CR0_WP: u32 = 16;
const CR4_PSE: u32 = 4;
const CR4_PAE: u32 = 5;
const CR4_LA57: u32 = 12;
const EFER_NXE: u32 = 11;

// Linux x86-64 kernel address space constants
const START_KERNEL_MAP: u64 = 0xffffffff80000000; // __START_KERNEL_map
const KERNEL_TEXT_BASE: u64 = 0xffffffff81000000; // _text without KASLR
const MODULES_VADDR: u64 = 0xffffffffc0000000;
const PAGE_OFFSET_4LEVEL: u64 = 0xffff888000000000;
const PAGE_OFFSET_5LEVEL: u64 = 0xff11000000000000;
const CPU_ENTRY_AREA: u64 = 0xfffffe0000000000;

// Linux i386 with the default 3G/1G split
const PAGE_OFFSET_32: u64 = 0xc0000000;
const KERNEL_TEXT_BASE_32: u64 = 0xc1000000;
const VMALLOC_END_32: u64 = 0xff800000;

const SIZE_2MIB: u64 = 0x20_0000;
const SIZE_1GIB: u64 = 0x4000_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum X86Mode {
    /// 2-level, 4 byte entries, 4K and 4M pages.
    Legacy,
    /// 3-level, 8 byte entries, 4K and 2M pages.
    Pae,
    /// 4-level long mode, 48-bit virtual addresses.
    FourLevel,
    /// 5-level long mode (LA57), 57-bit virtual addresses.
    FiveLevel,
}

/// Page table backend for the x86 family.
#[derive(Debug, Clone)]
pub struct X86Backend {
    mode: X86Mode,
    /// EFER.NXE. Without it bit 63 is not an execute-disable bit.
    nx_enabled: bool,
    /// CR0.WP. When clear, supervisor writes ignore R/W.
    write_protect: bool,
    pat: u64,
    levels: Vec<LevelGeometry>,
}

impl X86Backend {
    pub fn new(mode: X86Mode, nx_enabled: bool, pat: u64) -> Self {
        let levels = match mode {
            X86Mode::Legacy => uniform_levels(12, 10, 2),
            X86Mode::Pae => {
                let mut levels = uniform_levels(12, 9, 3);
                // The PDPT only has 4 entries and never maps memory directly.
                levels[0].entries = 4;
                levels[0].leaf_allowed = false;
                levels
            }
            X86Mode::FourLevel => {
                let mut levels = uniform_levels(12, 9, 4);
                levels[0].leaf_allowed = false;
                levels
            }
            X86Mode::FiveLevel => {
                let mut levels = uniform_levels(12, 9, 5);
                levels[0].leaf_allowed = false;
                levels[1].leaf_allowed = false;
                levels
            }
        };

        X86Backend {
            mode,
            nx_enabled: nx_enabled && mode != X86Mode::Legacy,
            write_protect: true,
            pat,
            levels,
        }
    }

    pub fn with_write_protect(mut self, write_protect: bool) -> Self {
        self.write_protect = write_protect;
        self
    }

    /// Pick the paging mode from CR0/CR4/EFER. Missing registers fall back to
    /// what Linux guests run with: WP and NX on, PAT at its reset value, no LA57.
    pub fn from_registers(architecture: Architecture, registers: &ControlRegisters) -> Self {
        let cr4 = registers.cr4.unwrap_or(0);
        let nx_enabled = registers.efer.map(|efer| bit(efer, EFER_NXE)).unwrap_or(true);
        let pat = registers.pat.unwrap_or(DEFAULT_PAT);

        let mode = match architecture {
            Architecture::X86_32 if bit(cr4, CR4_PAE) => X86Mode::Pae,
            Architecture::X86_32 => X86Mode::Legacy,
            _ if bit(cr4, CR4_LA57) => X86Mode::FiveLevel,
            _ => X86Mode::FourLevel,
        };
        if mode == X86Mode::Legacy && registers.cr4.is_some() && !bit(cr4, CR4_PSE) {
            log::debug!("CR4.PSE is clear; 4M pages will still be decoded");
        }

        let write_protect = registers.cr0.map(|cr0| bit(cr0, CR0_WP)).unwrap_or(true);
        X86Backend::new(mode, nx_enabled, pat).with_write_protect(write_protect)
    }

    pub fn mode(&self) -> X86Mode {
        self.mode
    }

    fn max_phys_bit(&self) -> u32 {
        match self.mode {
            X86Mode::Legacy => 31,
            _ => MAXPHYADDR - 1,
        }
    }

    fn is_long_mode(&self) -> bool {
        matches!(self.mode, X86Mode::FourLevel | X86Mode::FiveLevel)
    }

    /// Translate PAT/PCD/PWT through the IA32_PAT MSR.
    fn cache_policy(&self, level: &LevelGeometry, raw: u64) -> CachePolicy {
        let pat_bit = if level.last { PAT_BIT_SMALL } else { PAT_BIT_LARGE };
        let index = ((bit(raw, pat_bit) as u64) << 2)
            | ((bit(raw, PCD_BIT) as u64) << 1)
            | (bit(raw, PWT_BIT) as u64);
        match (self.pat >> (index * 8)) & 0x7 {
            0 => CachePolicy::Uncacheable,
            1 => CachePolicy::WriteCombining,
            4 => CachePolicy::WriteThrough,
            5 => CachePolicy::WriteProtected,
            6 => CachePolicy::WriteBack,
            7 => CachePolicy::UncachedMinus,
            _ => CachePolicy::Unspecified,
        }
    }

    fn large_page_address(&self, level: &LevelGeometry, raw: u64) -> u64 {
        match self.mode {
            // PSE-36: bits 20:13 of a 4M PDE hold physical bits 39:32.
            X86Mode::Legacy => mask(raw, 31, 22) | (field(raw, 20, 13) << 32),
            _ => mask(raw, self.max_phys_bit(), level.shift),
        }
    }

    fn is_execute_disabled(&self, raw: u64) -> bool {
        self.nx_enabled && raw & PAGE_NX != 0
    }
}

impl PagingBackend for X86Backend {
    fn architecture(&self) -> Architecture {
        match self.mode {
            X86Mode::Legacy | X86Mode::Pae => Architecture::X86_32,
            X86Mode::FourLevel | X86Mode::FiveLevel => Architecture::X86_64,
        }
    }

    fn entry_size(&self) -> usize {
        match self.mode {
            X86Mode::Legacy => 4,
            _ => 8,
        }
    }

    fn geometry(&self, _half: AddressHalf) -> &[LevelGeometry] {
        &self.levels
    }

    fn decode_entry(&self, level: &LevelGeometry, raw: u64) -> DecodedEntry {
        if raw & PAGE_PRESENT == 0 {
            return DecodedEntry::absent(raw);
        }

        // PAE PDPTEs carry no access rights, only the next table.
        if self.mode == X86Mode::Pae && level.depth == 0 {
            return DecodedEntry::table(mask(raw, self.max_phys_bit(), 12), raw, TableConstraints::default());
        }

        if level.last {
            return DecodedEntry::leaf(mask(raw, self.max_phys_bit(), 12), raw);
        }

        if raw & PAGE_PSE != 0 {
            if !level.leaf_allowed {
                // PS is reserved in PML4/PML5 entries.
                return DecodedEntry::absent(raw);
            }
            return DecodedEntry::leaf(self.large_page_address(level, raw), raw);
        }

        let no_execute = self.is_execute_disabled(raw);
        let constraints = TableConstraints {
            read_only: raw & PAGE_RW == 0,
            no_user: raw & PAGE_USER == 0,
            no_execute_user: no_execute,
            no_execute_privileged: no_execute,
        };
        DecodedEntry::table(mask(raw, self.max_phys_bit(), 12), raw, constraints)
    }

    fn leaf_permissions(
        &self,
        level: &LevelGeometry,
        inherited: TableConstraints,
        entry: &DecodedEntry,
    ) -> Permissions {
        let raw = entry.raw;
        let mut access = Access::READ;
        if raw & PAGE_RW != 0 {
            access |= Access::WRITE;
        }
        if !self.is_execute_disabled(raw) {
            access |= Access::EXECUTE;
        }

        let perms = Permissions {
            privileged: access,
            unprivileged: if raw & PAGE_USER != 0 { access } else { Access::empty() },
            cache: self.cache_policy(level, raw),
        };
        let mut perms = inherited.apply(perms);
        if !self.write_protect {
            perms.privileged |= Access::WRITE;
        }
        perms
    }

    fn canonical_address(&self, _half: AddressHalf, va: u64) -> u64 {
        match self.mode {
            X86Mode::Legacy | X86Mode::Pae => va & 0xffff_ffff,
            X86Mode::FourLevel => sign_extend(va, 48),
            X86Mode::FiveLevel => sign_extend(va, 57),
        }
    }

    fn default_roots(&self, registers: &ControlRegisters) -> InspectResult<Vec<Root>> {
        let cr3 = registers.cr3.ok_or_else(|| InspectError::MissingRegister {
            architecture: self.architecture().to_string(),
            register: "cr3",
        })?;
        let address = match self.mode {
            X86Mode::Legacy => mask(cr3, 31, 12),
            X86Mode::Pae => mask(cr3, 31, 5),
            _ => mask(cr3, MAXPHYADDR - 1, 12),
        };
        Ok(vec![Root::full(address)])
    }

    fn aslr_layout(&self) -> Option<AslrLayout> {
        let layout = match self.mode {
            X86Mode::FourLevel => AslrLayout {
                image_window: (START_KERNEL_MAP, MODULES_VADDR),
                image_base: KERNEL_TEXT_BASE,
                image_phys_alignment: SIZE_2MIB,
                physmap_window: (PAGE_OFFSET_4LEVEL, CPU_ENTRY_AREA),
                physmap_base: PAGE_OFFSET_4LEVEL,
                physmap_alignment: SIZE_1GIB,
            },
            X86Mode::FiveLevel => AslrLayout {
                image_window: (START_KERNEL_MAP, MODULES_VADDR),
                image_base: KERNEL_TEXT_BASE,
                image_phys_alignment: SIZE_2MIB,
                physmap_window: (PAGE_OFFSET_5LEVEL, CPU_ENTRY_AREA),
                physmap_base: PAGE_OFFSET_5LEVEL,
                physmap_alignment: SIZE_1GIB,
            },
            X86Mode::Legacy | X86Mode::Pae => AslrLayout {
                image_window: (PAGE_OFFSET_32, VMALLOC_END_32),
                image_base: KERNEL_TEXT_BASE_32,
                image_phys_alignment: SIZE_2MIB,
                physmap_window: (PAGE_OFFSET_32, VMALLOC_END_32),
                physmap_base: PAGE_OFFSET_32,
                physmap_alignment: SIZE_1GIB,
            },
        };
        Some(layout)
    }

    fn supports_cache_filters(&self) -> bool {
        true
    }

    fn describe(&self) -> Vec<(String, String)> {
        let mode = match self.mode {
            X86Mode::Legacy => "legacy 32-bit (2 levels)",
            X86Mode::Pae => "PAE (3 levels)",
            X86Mode::FourLevel => "long mode (4 levels)",
            X86Mode::FiveLevel => "long mode, LA57 (5 levels)",
        };
        vec![
            ("architecture".to_string(), self.architecture().to_string()),
            ("paging mode".to_string(), mode.to_string()),
            ("long mode".to_string(), self.is_long_mode().to_string()),
            ("nx enforced".to_string(), self.nx_enabled.to_string()),
            ("write protect".to_string(), self.write_protect.to_string()),
            ("IA32_PAT".to_string(), format!("{:#018x}", self.pat)),
        ]
    }
}
