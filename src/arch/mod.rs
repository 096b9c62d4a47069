//! Architecture entry codecs and the paging backend interface
//!
//! Every supported architecture family implements [`PagingBackend`]. The
//! walker only sees normalized [`DecodedEntry`] values and [`Permissions`],
//! so it is shared by all of them.
use crate::error::{InspectError, InspectResult};
use bitflags::bitflags;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

pub mod aarch64;
pub mod riscv64;
pub mod x86;

pub use aarch64::Aarch64Backend;
pub use riscv64::Riscv64Backend;
pub use x86::{X86Backend, X86Mode};

/// The closed set of supported architecture families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Architecture {
    X86_64,
    X86_32,
    Aarch64,
    Riscv64,
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Architecture::X86_64 => "x86_64",
            Architecture::X86_32 => "x86_32",
            Architecture::Aarch64 => "aarch64",
            Architecture::Riscv64 => "riscv64",
        };
        write!(f, "{}", name)
    }
}

impl FromStr for Architecture {
    type Err = InspectError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "x86-64" | "x86_64" | "x64" | "amd64" | "i386:x86-64" => Ok(Architecture::X86_64),
            "x86-32" | "x86_32" | "x86" | "i386" | "i686" => Ok(Architecture::X86_32),
            "aarch64" | "arm64" => Ok(Architecture::Aarch64),
            "riscv64" | "riscv:rv64" | "rv64" => Ok(Architecture::Riscv64),
            other => Err(InspectError::UnsupportedArchitecture(other.to_string())),
        }
    }
}

/// Which part of the virtual address space a root table translates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum AddressHalf {
    /// The root covers the whole space (x86, riscv64).
    Full,
    /// aarch64 TTBR0_EL1.
    Lower,
    /// aarch64 TTBR1_EL1.
    Upper,
}

/// A root table to start a walk from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Root {
    pub address: u64,
    pub half: AddressHalf,
}

impl Root {
    pub fn full(address: u64) -> Self {
        Root {
            address,
            half: AddressHalf::Full,
        }
    }
}

/// Shape of one table level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LevelGeometry {
    /// 0 for the root table.
    pub depth: usize,
    /// log2 of the region covered by one entry.
    pub shift: u32,
    pub entries: usize,
    /// Whether an entry at this level may map memory directly.
    pub leaf_allowed: bool,
    /// Whether this is the final level (entries can only be leaves).
    pub last: bool,
}

impl LevelGeometry {
    pub fn page_size(&self) -> u64 {
        1u64 << self.shift
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Absent,
    Table { address: u64 },
    Leaf { address: u64 },
}

/// Restrictions a table entry imposes on everything below it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TableConstraints {
    pub read_only: bool,
    pub no_user: bool,
    pub no_execute_user: bool,
    pub no_execute_privileged: bool,
}

impl TableConstraints {
    /// Restrictions accumulate down the hierarchy.
    pub fn merge(self, other: TableConstraints) -> TableConstraints {
        TableConstraints {
            read_only: self.read_only || other.read_only,
            no_user: self.no_user || other.no_user,
            no_execute_user: self.no_execute_user || other.no_execute_user,
            no_execute_privileged: self.no_execute_privileged || other.no_execute_privileged,
        }
    }

    pub fn apply(self, mut perms: Permissions) -> Permissions {
        if self.read_only {
            perms.privileged.remove(Access::WRITE);
            perms.unprivileged.remove(Access::WRITE);
        }
        if self.no_user {
            perms.unprivileged = Access::empty();
        }
        if self.no_execute_user {
            perms.unprivileged.remove(Access::EXECUTE);
        }
        if self.no_execute_privileged {
            perms.privileged.remove(Access::EXECUTE);
        }
        perms
    }
}

/// One table entry after decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedEntry {
    pub kind: EntryKind,
    pub raw: u64,
    /// Only meaningful for table entries.
    pub constraints: TableConstraints,
}

impl DecodedEntry {
    pub fn absent(raw: u64) -> Self {
        DecodedEntry {
            kind: EntryKind::Absent,
            raw,
            constraints: TableConstraints::default(),
        }
    }

    pub fn table(address: u64, raw: u64, constraints: TableConstraints) -> Self {
        DecodedEntry {
            kind: EntryKind::Table { address },
            raw,
            constraints,
        }
    }

    pub fn leaf(address: u64, raw: u64) -> Self {
        DecodedEntry {
            kind: EntryKind::Leaf { address },
            raw,
            constraints: TableConstraints::default(),
        }
    }

    pub fn is_present(&self) -> bool {
        self.kind != EntryKind::Absent
    }
}

bitflags! {
    /// Access rights of one privilege class.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Access: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
    }
}

impl Access {
    /// `rwx` style rendering.
    pub fn describe(&self) -> String {
        let mut s = String::with_capacity(3);
        s.push(if self.contains(Access::READ) { 'r' } else { '-' });
        s.push(if self.contains(Access::WRITE) { 'w' } else { '-' });
        s.push(if self.contains(Access::EXECUTE) { 'x' } else { '-' });
        s
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum CachePolicy {
    WriteBack,
    WriteThrough,
    WriteCombining,
    WriteProtected,
    UncachedMinus,
    Uncacheable,
    /// The architecture keeps memory attributes outside the entry.
    Unspecified,
}

impl CachePolicy {
    pub fn short_name(&self) -> &'static str {
        match self {
            CachePolicy::WriteBack => "WB",
            CachePolicy::WriteThrough => "WT",
            CachePolicy::WriteCombining => "WC",
            CachePolicy::WriteProtected => "WP",
            CachePolicy::UncachedMinus => "UC-",
            CachePolicy::Uncacheable => "UC",
            CachePolicy::Unspecified => "-",
        }
    }

    /// Both UC and UC- count as uncacheable for filtering.
    pub fn is_uncacheable(&self) -> bool {
        matches!(self, CachePolicy::Uncacheable | CachePolicy::UncachedMinus)
    }
}

/// Which privilege classes permission queries consider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrivilegeContext {
    pub supervisor: bool,
    pub user: bool,
}

impl PrivilegeContext {
    pub const ALL: PrivilegeContext = PrivilegeContext {
        supervisor: true,
        user: true,
    };
}

/// Effective permissions of a mapping after combining every level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Permissions {
    /// Kernel / EL1 / S-mode access.
    pub privileged: Access,
    /// User / EL0 / U-mode access.
    pub unprivileged: Access,
    pub cache: CachePolicy,
}

impl Permissions {
    fn any(&self, ctx: PrivilegeContext, flag: Access) -> bool {
        (ctx.supervisor && self.privileged.contains(flag))
            || (ctx.user && self.unprivileged.contains(flag))
    }

    pub fn writeable_in(&self, ctx: PrivilegeContext) -> bool {
        self.any(ctx, Access::WRITE)
    }

    pub fn executable_in(&self, ctx: PrivilegeContext) -> bool {
        self.any(ctx, Access::EXECUTE)
    }

    pub fn is_writeable(&self) -> bool {
        self.writeable_in(PrivilegeContext::ALL)
    }

    pub fn is_executable(&self) -> bool {
        self.executable_in(PrivilegeContext::ALL)
    }

    /// Accessible from user mode in any way.
    pub fn is_user(&self) -> bool {
        !self.unprivileged.is_empty()
    }

    pub fn is_supervisor(&self) -> bool {
        self.unprivileged.is_empty()
    }
}

impl fmt::Display for Permissions {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "K:{} U:{} {}",
            self.privileged.describe(),
            self.unprivileged.describe(),
            self.cache.short_name()
        )
    }
}

impl Serialize for Permissions {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;
        let mut state = serializer.serialize_struct("Permissions", 3)?;
        state.serialize_field("privileged", &self.privileged.describe())?;
        state.serialize_field("unprivileged", &self.unprivileged.describe())?;
        state.serialize_field("cache", self.cache.short_name())?;
        state.end()
    }
}

/// Canonical kernel layout used to derive ASLR slides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AslrLayout {
    /// Half-open window where the kernel image text can live.
    pub image_window: (u64, u64),
    /// Link-time address of the image text.
    pub image_base: u64,
    /// Required alignment of the image's physical load address.
    pub image_phys_alignment: u64,
    pub physmap_window: (u64, u64),
    /// Unrandomized direct map base.
    pub physmap_base: u64,
    /// Granularity of the direct map randomization.
    pub physmap_alignment: u64,
}

/// Snapshot of the registers that control translation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlRegisters {
    #[serde(default, deserialize_with = "hex_or_number")]
    pub cr0: Option<u64>,
    #[serde(default, deserialize_with = "hex_or_number")]
    pub cr3: Option<u64>,
    #[serde(default, deserialize_with = "hex_or_number")]
    pub cr4: Option<u64>,
    #[serde(default, deserialize_with = "hex_or_number")]
    pub efer: Option<u64>,
    /// IA32_PAT MSR.
    #[serde(default, deserialize_with = "hex_or_number")]
    pub pat: Option<u64>,
    #[serde(default, deserialize_with = "hex_or_number")]
    pub ttbr0_el1: Option<u64>,
    #[serde(default, deserialize_with = "hex_or_number")]
    pub ttbr1_el1: Option<u64>,
    #[serde(default, deserialize_with = "hex_or_number")]
    pub tcr_el1: Option<u64>,
    #[serde(default, deserialize_with = "hex_or_number")]
    pub satp: Option<u64>,
}

impl ControlRegisters {
    /// Overlay every register that `other` provides.
    pub fn merged_with(&self, other: &ControlRegisters) -> ControlRegisters {
        ControlRegisters {
            cr0: other.cr0.or(self.cr0),
            cr3: other.cr3.or(self.cr3),
            cr4: other.cr4.or(self.cr4),
            efer: other.efer.or(self.efer),
            pat: other.pat.or(self.pat),
            ttbr0_el1: other.ttbr0_el1.or(self.ttbr0_el1),
            ttbr1_el1: other.ttbr1_el1.or(self.ttbr1_el1),
            tcr_el1: other.tcr_el1.or(self.tcr_el1),
            satp: other.satp.or(self.satp),
        }
    }
}

fn hex_or_number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u64>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u64),
        Text(String),
    }

    match Option::<Raw>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Raw::Number(n)) => Ok(Some(n)),
        Some(Raw::Text(s)) => parse_number(&s).map(Some).map_err(serde::de::Error::custom),
    }
}

/// Parse `0x`-prefixed hex or decimal.
pub fn parse_number(s: &str) -> Result<u64, String> {
    let s = s.trim().replace('_', "");
    let parsed = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16)
    } else {
        s.parse::<u64>()
    };
    parsed.map_err(|e| format!("invalid number '{}': {}", s, e))
}

/// Where root-table registers come from when the caller gives no override.
pub trait RegisterSource {
    fn registers(&self) -> InspectResult<ControlRegisters>;
}

impl RegisterSource for ControlRegisters {
    fn registers(&self) -> InspectResult<ControlRegisters> {
        Ok(self.clone())
    }
}

/// The per-architecture capability interface used by the walker and analyzers.
pub trait PagingBackend {
    fn architecture(&self) -> Architecture;

    /// Width of one table entry in bytes.
    fn entry_size(&self) -> usize;

    /// Table levels for a root translating `half`, root first.
    fn geometry(&self, half: AddressHalf) -> &[LevelGeometry];

    /// Decode one raw entry. Pure: no I/O, never fails. Malformed or
    /// reserved encodings come back as [`EntryKind::Absent`].
    fn decode_entry(&self, level: &LevelGeometry, raw: u64) -> DecodedEntry;

    /// Effective permissions of a leaf given the constraints of its ancestors.
    fn leaf_permissions(
        &self,
        level: &LevelGeometry,
        inherited: TableConstraints,
        entry: &DecodedEntry,
    ) -> Permissions;

    /// Turn the concatenated table indices into a full virtual address.
    fn canonical_address(&self, half: AddressHalf, va: u64) -> u64;

    /// Root tables named by the control registers.
    fn default_roots(&self, registers: &ControlRegisters) -> InspectResult<Vec<Root>>;

    fn aslr_layout(&self) -> Option<AslrLayout>;

    /// Whether the `wb`/`uc` filter tokens mean anything here.
    fn supports_cache_filters(&self) -> bool {
        false
    }

    /// Human readable summary of the paging mode.
    fn describe(&self) -> Vec<(String, String)>;
}

/// Select the backend for `architecture`, configured from the registers.
pub fn backend_for(
    architecture: Architecture,
    registers: &ControlRegisters,
) -> InspectResult<Box<dyn PagingBackend>> {
    let backend: Box<dyn PagingBackend> = match architecture {
        Architecture::X86_64 | Architecture::X86_32 => {
            Box::new(X86Backend::from_registers(architecture, registers))
        }
        Architecture::Aarch64 => Box::new(Aarch64Backend::from_registers(registers)?),
        Architecture::Riscv64 => Box::new(Riscv64Backend::from_registers(registers)?),
    };
    Ok(backend)
}

/// Bits `high..=low` of `value`, left in place.
#[inline]
pub fn mask(value: u64, high: u32, low: u32) -> u64 {
    let high_mask = if high >= 63 {
        u64::MAX
    } else {
        (1u64 << (high + 1)).wrapping_sub(1)
    };
    let low_mask = (1u64 << low).wrapping_sub(1);
    value & (high_mask ^ low_mask)
}

/// Bits `high..=low` of `value`, shifted down.
#[inline]
pub fn field(value: u64, high: u32, low: u32) -> u64 {
    mask(value, high, low) >> low
}

#[inline]
pub fn bit(value: u64, n: u32) -> bool {
    (value >> n) & 1 != 0
}

/// Replicate bit `bits - 1` into every higher bit.
#[inline]
pub fn sign_extend(value: u64, bits: u32) -> u64 {
    if bits >= 64 {
        return value;
    }
    let shift = 64 - bits;
    (((value << shift) as i64) >> shift) as u64
}

/// Level geometry for uniform radix tables (same entry count per level).
pub(crate) fn uniform_levels(page_shift: u32, index_bits: u32, levels: usize) -> Vec<LevelGeometry> {
    (0..levels)
        .map(|depth| {
            let from_bottom = (levels - 1 - depth) as u32;
            LevelGeometry {
                depth,
                shift: page_shift + index_bits * from_bottom,
                entries: 1usize << index_bits,
                leaf_allowed: true,
                last: depth == levels - 1,
            }
        })
        .collect()
}
