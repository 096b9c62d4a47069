//! RISC-V Sv39/Sv48/Sv57 translation
use super::{
    bit, field, sign_extend, uniform_levels, Access, AddressHalf, Architecture, AslrLayout,
    CachePolicy, ControlRegisters, DecodedEntry, LevelGeometry, PagingBackend, Permissions,
    Root, TableConstraints,
};
use crate::error::{InspectError, InspectResult};

const PTE_V: u32 = 0;
const PTE_R: u32 = 1;
const PTE_W: u32 = 2;
const PTE_X: u32 = 3;
const PTE_U: u32 = 4;

const SATP_MODE_BARE: u64 = 0;
const SATP_MODE_SV39: u64 = 8;
const SATP_MODE_SV48: u64 = 9;
const SATP_MODE_SV57: u64 = 10;

const KERNEL_LINK_ADDR: u64 = 0xffffffff80000000;
const MODULES_VADDR: u64 = 0xffffffff00000000;
const PAGE_OFFSET_SV39: u64 = 0xffffffd800000000;
const PAGE_OFFSET_SV48: u64 = 0xffffaf8000000000;
const PAGE_OFFSET_SV57: u64 = 0xff60000000000000;

const SIZE_2MIB: u64 = 0x20_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SvMode {
    Sv39,
    Sv48,
    Sv57,
}

impl SvMode {
    fn levels(&self) -> usize {
        match self {
            SvMode::Sv39 => 3,
            SvMode::Sv48 => 4,
            SvMode::Sv57 => 5,
        }
    }

    fn va_bits(&self) -> u32 {
        12 + 9 * self.levels() as u32
    }
}

/// Page table backend for riscv64 supervisor translation.
#[derive(Debug, Clone)]
pub struct Riscv64Backend {
    mode: SvMode,
    levels: Vec<LevelGeometry>,
}

impl Riscv64Backend {
    pub fn new(mode: SvMode) -> Self {
        Riscv64Backend {
            mode,
            levels: uniform_levels(12, 9, mode.levels()),
        }
    }

    /// The mode comes from satp.MODE; Sv39 when satp is unknown.
    pub fn from_registers(registers: &ControlRegisters) -> InspectResult<Self> {
        let mode = match registers.satp.map(|satp| field(satp, 63, 60)) {
            None | Some(SATP_MODE_SV39) => SvMode::Sv39,
            Some(SATP_MODE_SV48) => SvMode::Sv48,
            Some(SATP_MODE_SV57) => SvMode::Sv57,
            Some(SATP_MODE_BARE) => {
                return Err(InspectError::UnsupportedArchitecture(
                    "riscv64 with satp.MODE=Bare (translation disabled)".to_string(),
                ))
            }
            Some(other) => {
                return Err(InspectError::UnsupportedArchitecture(format!(
                    "riscv64 with satp.MODE={}",
                    other
                )))
            }
        };
        Ok(Riscv64Backend::new(mode))
    }

    pub fn mode(&self) -> SvMode {
        self.mode
    }

    fn page_offset(&self) -> u64 {
        match self.mode {
            SvMode::Sv39 => PAGE_OFFSET_SV39,
            SvMode::Sv48 => PAGE_OFFSET_SV48,
            SvMode::Sv57 => PAGE_OFFSET_SV57,
        }
    }
}

impl PagingBackend for Riscv64Backend {
    fn architecture(&self) -> Architecture {
        Architecture::Riscv64
    }

    fn entry_size(&self) -> usize {
        8
    }

    fn geometry(&self, _half: AddressHalf) -> &[LevelGeometry] {
        &self.levels
    }

    fn decode_entry(&self, level: &LevelGeometry, raw: u64) -> DecodedEntry {
        if !bit(raw, PTE_V) {
            return DecodedEntry::absent(raw);
        }

        let (r, w, x) = (bit(raw, PTE_R), bit(raw, PTE_W), bit(raw, PTE_X));
        let address = field(raw, 53, 10) << 12;

        if !r && !w && !x {
            if level.last {
                return DecodedEntry::absent(raw);
            }
            return DecodedEntry::table(address, raw, TableConstraints::default());
        }

        // W without R is reserved.
        if w && !r {
            return DecodedEntry::absent(raw);
        }
        // Superpages must be aligned to their size.
        if address & (level.page_size() - 1) != 0 {
            return DecodedEntry::absent(raw);
        }
        DecodedEntry::leaf(address, raw)
    }

    fn leaf_permissions(
        &self,
        _level: &LevelGeometry,
        inherited: TableConstraints,
        entry: &DecodedEntry,
    ) -> Permissions {
        let raw = entry.raw;
        let mut access = Access::empty();
        if bit(raw, PTE_R) {
            access |= Access::READ;
        }
        if bit(raw, PTE_W) {
            access |= Access::WRITE;
        }
        if bit(raw, PTE_X) {
            access |= Access::EXECUTE;
        }

        let perms = if bit(raw, PTE_U) {
            // S-mode never executes U pages and reads/writes them only with SUM.
            Permissions {
                privileged: access - Access::EXECUTE,
                unprivileged: access,
                cache: CachePolicy::Unspecified,
            }
        } else {
            Permissions {
                privileged: access,
                unprivileged: Access::empty(),
                cache: CachePolicy::Unspecified,
            }
        };
        inherited.apply(perms)
    }

    fn canonical_address(&self, _half: AddressHalf, va: u64) -> u64 {
        sign_extend(va, self.mode.va_bits())
    }

    fn default_roots(&self, registers: &ControlRegisters) -> InspectResult<Vec<Root>> {
        let satp = registers.satp.ok_or_else(|| InspectError::MissingRegister {
            architecture: self.architecture().to_string(),
            register: "satp",
        })?;
        Ok(vec![Root::full(field(satp, 43, 0) << 12)])
    }

    fn aslr_layout(&self) -> Option<AslrLayout> {
        Some(AslrLayout {
            image_window: (KERNEL_LINK_ADDR, u64::MAX),
            image_base: KERNEL_LINK_ADDR,
            image_phys_alignment: SIZE_2MIB,
            physmap_window: (self.page_offset(), MODULES_VADDR),
            physmap_base: self.page_offset(),
            physmap_alignment: SIZE_2MIB,
        })
    }

    fn describe(&self) -> Vec<(String, String)> {
        vec![
            ("architecture".to_string(), self.architecture().to_string()),
            ("paging mode".to_string(), format!("{:?}", self.mode)),
            ("virtual address bits".to_string(), self.mode.va_bits().to_string()),
        ]
    }
}
