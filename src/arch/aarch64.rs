//! AArch64 stage 1 translation with the 4KB granule.
//!
//! ```text
//! Virtual Address (48-bit):
//! +----------+----------+----------+----------+------------+
//! | L0 (9b)  | L1 (9b)  | L2 (9b)  | L3 (9b)  | Offset(12b)|
//! | [47:39]  | [38:30]  | [29:21]  | [20:12]  | [11:0]     |
//! +----------+----------+----------+----------+------------+
//! ```
//!
//! Smaller VA sizes (from TCR_EL1.TxSZ) start the walk at a later level and
//! may use a concatenated-down first table with fewer entries.
use super::{
    bit, field, mask, Access, AddressHalf, Architecture, AslrLayout, CachePolicy,
    ControlRegisters, DecodedEntry, LevelGeometry, PagingBackend, Permissions, Root,
    TableConstraints,
};
use crate::error::{InspectError, InspectResult};

/// Descriptor type bits [1:0].
const DESC_TYPE_MASK: u64 = 0b11;
const DESC_BLOCK: u64 = 0b01; // Block descriptor (L1/L2 only)
const DESC_TABLE: u64 = 0b11; // Table descriptor (or page at L3)
const DESC_VALID: u64 = 1 << 0;

/// Output address bits [47:12].
const OA_HIGH_BIT: u32 = 47;

// Block/page attributes
const AP_HIGH: u32 = 7;
const AP_LOW: u32 = 6;
const PXN_BIT: u32 = 53;
const UXN_BIT: u32 = 54;

// Table descriptor hierarchical controls
const PXN_TABLE_BIT: u32 = 59;
const UXN_TABLE_BIT: u32 = 60;
const AP_TABLE_NO_EL0_BIT: u32 = 61;
const AP_TABLE_READ_ONLY_BIT: u32 = 62;

const PAGE_SHIFT: u32 = 12;
const INDEX_BITS: u32 = 9;
const DEFAULT_VA_BITS: u32 = 48;

// TCR_EL1 fields
const TCR_EPD0_BIT: u32 = 7;
const TCR_EPD1_BIT: u32 = 23;
const TG0_4K: u64 = 0b00;
const TG1_4K: u64 = 0b10;

const MODULES_VSIZE: u64 = 0x0800_0000;
const SIZE_2MIB: u64 = 0x20_0000;
const SIZE_1GIB: u64 = 0x4000_0000;

/// Page table backend for AArch64 (EL1&0 regime, 4KB granule).
#[derive(Debug, Clone)]
pub struct Aarch64Backend {
    lower_va_bits: u32,
    upper_va_bits: u32,
    lower_levels: Vec<LevelGeometry>,
    upper_levels: Vec<LevelGeometry>,
    lower_walks_disabled: bool,
    upper_walks_disabled: bool,
}

impl Aarch64Backend {
    pub fn new(lower_va_bits: u32, upper_va_bits: u32) -> InspectResult<Self> {
        Ok(Aarch64Backend {
            lower_va_bits,
            upper_va_bits,
            lower_levels: levels_for(lower_va_bits)?,
            upper_levels: levels_for(upper_va_bits)?,
            lower_walks_disabled: false,
            upper_walks_disabled: false,
        })
    }

    /// Configure from TCR_EL1 (T0SZ, T1SZ, TG0, TG1, EPD0, EPD1). Without
    /// TCR_EL1 both halves are assumed to be 48-bit.
    pub fn from_registers(registers: &ControlRegisters) -> InspectResult<Self> {
        let tcr = match registers.tcr_el1 {
            Some(tcr) => tcr,
            None => return Aarch64Backend::new(DEFAULT_VA_BITS, DEFAULT_VA_BITS),
        };

        let tg0 = field(tcr, 15, 14);
        let tg1 = field(tcr, 31, 30);
        if tg0 != TG0_4K || tg1 != TG1_4K {
            return Err(InspectError::UnsupportedArchitecture(format!(
                "aarch64 with TG0={:#b} TG1={:#b}; only the 4KB granule is supported",
                tg0, tg1
            )));
        }

        let t0sz = field(tcr, 5, 0) as u32;
        let t1sz = field(tcr, 21, 16) as u32;
        let mut backend = Aarch64Backend::new(64 - t0sz, 64 - t1sz)?;
        backend.lower_walks_disabled = bit(tcr, TCR_EPD0_BIT);
        backend.upper_walks_disabled = bit(tcr, TCR_EPD1_BIT);
        Ok(backend)
    }

    fn va_bits(&self, half: AddressHalf) -> u32 {
        match half {
            AddressHalf::Upper => self.upper_va_bits,
            _ => self.lower_va_bits,
        }
    }
}

/// Levels for a `va_bits` wide region, following the starting-level rules
/// of the 4KB granule.
fn levels_for(va_bits: u32) -> InspectResult<Vec<LevelGeometry>> {
    if !(25..=48).contains(&va_bits) {
        return Err(InspectError::UnsupportedArchitecture(format!(
            "aarch64 with {}-bit virtual addresses",
            va_bits
        )));
    }

    let translated = va_bits - PAGE_SHIFT;
    let count = ((translated + INDEX_BITS - 1) / INDEX_BITS) as usize;
    let first_level = 4 - count;

    Ok((0..count)
        .map(|depth| {
            let arm_level = first_level + depth;
            let shift = PAGE_SHIFT + INDEX_BITS * (3 - arm_level) as u32;
            let index_bits = (va_bits - shift).min(INDEX_BITS);
            LevelGeometry {
                depth,
                shift,
                entries: 1usize << index_bits,
                leaf_allowed: arm_level != 0,
                last: arm_level == 3,
            }
        })
        .collect())
}

impl PagingBackend for Aarch64Backend {
    fn architecture(&self) -> Architecture {
        Architecture::Aarch64
    }

    fn entry_size(&self) -> usize {
        8
    }

    fn geometry(&self, half: AddressHalf) -> &[LevelGeometry] {
        match half {
            AddressHalf::Upper => &self.upper_levels,
            _ => &self.lower_levels,
        }
    }

    fn decode_entry(&self, level: &LevelGeometry, raw: u64) -> DecodedEntry {
        if raw & DESC_VALID == 0 {
            return DecodedEntry::absent(raw);
        }

        match (raw & DESC_TYPE_MASK, level.last) {
            (DESC_TABLE, true) => DecodedEntry::leaf(mask(raw, OA_HIGH_BIT, PAGE_SHIFT), raw),
            (DESC_TABLE, false) => {
                let constraints = TableConstraints {
                    read_only: bit(raw, AP_TABLE_READ_ONLY_BIT),
                    no_user: bit(raw, AP_TABLE_NO_EL0_BIT),
                    no_execute_user: bit(raw, UXN_TABLE_BIT),
                    no_execute_privileged: bit(raw, PXN_TABLE_BIT),
                };
                DecodedEntry::table(mask(raw, OA_HIGH_BIT, PAGE_SHIFT), raw, constraints)
            }
            (DESC_BLOCK, false) if level.leaf_allowed => {
                DecodedEntry::leaf(mask(raw, OA_HIGH_BIT, level.shift), raw)
            }
            // Blocks at level 0 and 0b01 at level 3 are reserved.
            _ => DecodedEntry::absent(raw),
        }
    }

    fn leaf_permissions(
        &self,
        _level: &LevelGeometry,
        inherited: TableConstraints,
        entry: &DecodedEntry,
    ) -> Permissions {
        let raw = entry.raw;
        let (mut privileged, mut unprivileged) = match field(raw, AP_HIGH, AP_LOW) {
            0b00 => (Access::READ | Access::WRITE, Access::empty()),
            0b01 => (Access::READ | Access::WRITE, Access::READ | Access::WRITE),
            0b10 => (Access::READ, Access::empty()),
            _ => (Access::READ, Access::READ),
        };
        if !bit(raw, PXN_BIT) {
            privileged |= Access::EXECUTE;
        }
        if !bit(raw, UXN_BIT) {
            unprivileged |= Access::EXECUTE;
        }

        let mut perms = inherited.apply(Permissions {
            privileged,
            unprivileged,
            cache: CachePolicy::Unspecified,
        });
        // Memory writeable at EL0 is never executable at EL1.
        if perms.unprivileged.contains(Access::WRITE) {
            perms.privileged.remove(Access::EXECUTE);
        }
        perms
    }

    fn canonical_address(&self, half: AddressHalf, va: u64) -> u64 {
        match half {
            AddressHalf::Upper => va | !((1u64 << self.upper_va_bits) - 1),
            _ => va,
        }
    }

    fn default_roots(&self, registers: &ControlRegisters) -> InspectResult<Vec<Root>> {
        if registers.ttbr0_el1.is_none() && registers.ttbr1_el1.is_none() {
            return Err(InspectError::MissingRegister {
                architecture: self.architecture().to_string(),
                register: "ttbr0_el1/ttbr1_el1",
            });
        }

        let mut roots = Vec::new();
        if let Some(ttbr0) = registers.ttbr0_el1 {
            if !self.lower_walks_disabled {
                roots.push(Root {
                    address: mask(ttbr0, OA_HIGH_BIT, 1),
                    half: AddressHalf::Lower,
                });
            }
        }
        if let Some(ttbr1) = registers.ttbr1_el1 {
            if !self.upper_walks_disabled {
                roots.push(Root {
                    address: mask(ttbr1, OA_HIGH_BIT, 1),
                    half: AddressHalf::Upper,
                });
            }
        }
        Ok(roots)
    }

    fn aslr_layout(&self) -> Option<AslrLayout> {
        let va_bits = self.upper_va_bits;
        let page_offset = !((1u64 << va_bits) - 1);
        let page_end = !((1u64 << (va_bits - 1)) - 1);
        Some(AslrLayout {
            image_window: (page_end, u64::MAX),
            image_base: page_end + MODULES_VSIZE,
            image_phys_alignment: SIZE_2MIB,
            physmap_window: (page_offset, page_end),
            physmap_base: page_offset,
            physmap_alignment: SIZE_1GIB,
        })
    }

    fn describe(&self) -> Vec<(String, String)> {
        vec![
            ("architecture".to_string(), self.architecture().to_string()),
            ("granule".to_string(), "4KB".to_string()),
            (
                "TTBR0_EL1 region".to_string(),
                format!(
                    "{}-bit, {} levels{}",
                    self.va_bits(AddressHalf::Lower),
                    self.lower_levels.len(),
                    if self.lower_walks_disabled { ", walks disabled" } else { "" }
                ),
            ),
            (
                "TTBR1_EL1 region".to_string(),
                format!(
                    "{}-bit, {} levels{}",
                    self.va_bits(AddressHalf::Upper),
                    self.upper_levels.len(),
                    if self.upper_walks_disabled { ", walks disabled" } else { "" }
                ),
            ),
        ]
    }
}
