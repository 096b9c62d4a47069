//! Command-line argument parsing for the page table inspector
use crate::arch::{parse_number, Architecture, ControlRegisters};
use crate::error::InspectResult;
use crate::filter::WindowArgs;
use crate::search::{SearchOptions, SearchPattern};
use crate::translation::WalkOptions;
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "ptinspect")]
#[command(about = "Guest page table inspector", long_about = None)]
pub struct Cli {
    /// Path to a LiME or raw physical memory dump
    #[arg(value_name = "MEMORY_DUMP")]
    pub memory_dump: PathBuf,

    /// Command to run (default: dump)
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Guest architecture (x86_64, x86_32, aarch64, riscv64)
    #[arg(short, long, default_value = "x86_64", value_parser = parse_architecture)]
    pub arch: Architecture,

    #[command(flatten)]
    pub registers: RegisterArgs,

    /// Output format
    #[arg(short, long, value_enum, default_value = "text")]
    pub format: OutputFormatArg,

    /// Output file (default: stdout)
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Enable debug output
    #[arg(short, long)]
    pub debug: bool,

    /// Enable verbose output (walk summaries, anchors)
    #[arg(short, long)]
    pub verbose: bool,
}

/// Control register values. Flags override values from `--registers`.
#[derive(Args, Debug, Clone, Default)]
pub struct RegisterArgs {
    /// JSON file with a register snapshot
    #[arg(long, value_name = "FILE")]
    pub registers: Option<PathBuf>,

    /// CR0 (only WP is used)
    #[arg(long, value_parser = parse_number)]
    pub cr0: Option<u64>,

    /// Physical address of the root table (x86)
    #[arg(long, value_parser = parse_number)]
    pub cr3: Option<u64>,

    #[arg(long, value_parser = parse_number)]
    pub cr4: Option<u64>,

    #[arg(long, value_parser = parse_number)]
    pub efer: Option<u64>,

    /// IA32_PAT MSR
    #[arg(long, value_parser = parse_number)]
    pub pat: Option<u64>,

    #[arg(long, alias = "ttbr0-el1", value_parser = parse_number)]
    pub ttbr0: Option<u64>,

    #[arg(long, alias = "ttbr1-el1", value_parser = parse_number)]
    pub ttbr1: Option<u64>,

    #[arg(long, alias = "tcr-el1", value_parser = parse_number)]
    pub tcr: Option<u64>,

    #[arg(long, value_parser = parse_number)]
    pub satp: Option<u64>,
}

impl RegisterArgs {
    fn flag_values(&self) -> ControlRegisters {
        ControlRegisters {
            cr0: self.cr0,
            cr3: self.cr3,
            cr4: self.cr4,
            efer: self.efer,
            pat: self.pat,
            ttbr0_el1: self.ttbr0,
            ttbr1_el1: self.ttbr1,
            tcr_el1: self.tcr,
            satp: self.satp,
        }
    }

    /// Snapshot file (if any) overlaid with the individual flags.
    pub fn load(&self) -> InspectResult<ControlRegisters> {
        let base = match &self.registers {
            Some(path) => {
                let text = std::fs::read_to_string(path)?;
                serde_json::from_str::<ControlRegisters>(&text)?
            }
            None => ControlRegisters::default(),
        };
        Ok(base.merged_with(&self.flag_values()))
    }
}

/// Selection shared by every command that works on walked ranges.
#[derive(Args, Debug, Clone, Default)]
pub struct QueryArgs {
    /// Filter tokens: w _w x _x w|x ro u _u s _s wb _wb uc _uc
    #[arg(long, num_args = 1.., value_name = "TOKEN")]
    pub filter: Vec<String>,

    /// Keep ranges starting inside [START, END]
    #[arg(long, num_args = 2, value_names = ["START", "END"], value_parser = parse_number)]
    pub range: Option<Vec<u64>>,

    /// Keep the range covering ADDR
    #[arg(long, value_name = "ADDR", value_parser = parse_number)]
    pub has: Option<u64>,

    /// Keep ranges below ADDR
    #[arg(long, value_name = "ADDR", value_parser = parse_number)]
    pub before: Option<u64>,

    /// Keep ranges reaching above ADDR
    #[arg(long, value_name = "ADDR", value_parser = parse_number)]
    pub after: Option<u64>,

    /// Cache the walked tables for later commands
    #[arg(long)]
    pub save: bool,

    /// Walk every table entry, even already traversed tables
    #[arg(long)]
    pub force_traverse_all: bool,

    /// Drop exact duplicates produced by --force-traverse-all
    #[arg(long)]
    pub collapse_duplicates: bool,

    /// Merge contiguous ranges with equal permissions in the output
    #[arg(long)]
    pub merge: bool,
}

impl QueryArgs {
    pub fn window(&self) -> WindowArgs {
        WindowArgs {
            range: self.range.as_ref().and_then(|r| match r.as_slice() {
                [start, end] => Some((*start, *end)),
                _ => None,
            }),
            contains: self.has,
            before: self.before,
            after: self.after,
        }
    }

    pub fn walk_options(&self) -> WalkOptions {
        WalkOptions {
            roots: None,
            retain: self.save,
            force_traverse_all: self.force_traverse_all,
            collapse_duplicates: self.collapse_duplicates,
        }
    }
}

#[derive(Args, Debug, Clone)]
#[group(required = true, multiple = false)]
pub struct PatternArgs {
    /// Search for a string
    #[arg(long = "string", value_name = "TEXT")]
    pub text: Option<String>,

    /// Search for a hex byte string, e.g. da87374107
    #[arg(long, value_name = "HEX")]
    pub bytes: Option<String>,

    /// Search for an 8-byte little-endian value
    #[arg(long = "u64", value_name = "VALUE", value_parser = parse_number)]
    pub value64: Option<u64>,

    /// Search for a 4-byte little-endian value
    #[arg(long = "u32", value_name = "VALUE", value_parser = parse_u32)]
    pub value32: Option<u32>,
}

impl PatternArgs {
    pub fn pattern(&self) -> InspectResult<SearchPattern> {
        if let Some(text) = &self.text {
            return Ok(SearchPattern::Text(text.clone()));
        }
        if let Some(hex) = &self.bytes {
            return SearchPattern::parse_hex(hex);
        }
        if let Some(value) = self.value64 {
            return Ok(SearchPattern::U64(value));
        }
        match self.value32 {
            Some(value) => Ok(SearchPattern::U32(value)),
            None => Err(crate::error::InspectError::invalid_argument(
                "no search pattern given",
            )),
        }
    }
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Print the page table
    Dump {
        #[command(flatten)]
        query: QueryArgs,
    },

    /// Search the memory behind the selected ranges
    Search {
        #[command(flatten)]
        pattern: PatternArgs,

        /// Stop after this many matches
        #[arg(long, value_parser = parse_number)]
        max: Option<u64>,

        /// Only report matches at ALIGN (optionally shifted by OFFSET)
        #[arg(long, num_args = 1..=2, value_names = ["ALIGN", "OFFSET"], value_parser = parse_number)]
        align: Option<Vec<u64>>,

        #[command(flatten)]
        query: QueryArgs,
    },

    /// Translate a virtual address to its physical address
    Translate {
        #[arg(value_parser = parse_number)]
        address: u64,

        #[command(flatten)]
        query: QueryArgs,
    },

    /// Find virtual ranges backed by the same physical memory (slow)
    Aliases {
        #[command(flatten)]
        query: QueryArgs,
    },

    /// Print the kernel image slide and physmap base
    Kaslr {
        #[command(flatten)]
        query: QueryArgs,
    },

    /// Search for values that disclose the KASLR offsets
    KaslrLeaks {
        /// Matches per searched value
        #[arg(long, default_value = "10", value_parser = parse_number)]
        per_value: u64,

        #[command(flatten)]
        query: QueryArgs,
    },

    /// Print paging mode and register information
    Info,

    /// List cached page tables
    List,

    /// Clear all cached page tables
    Clear,

    /// Read commands from stdin, keeping cached tables between them
    Shell,
}

impl Command {
    pub fn default_dump() -> Self {
        Command::Dump {
            query: QueryArgs::default(),
        }
    }

    /// Search settings for a `search` command.
    pub fn search_options(max: Option<u64>, align: Option<&[u64]>) -> SearchOptions {
        let mut options = SearchOptions::default();
        if let Some(max) = max {
            options.max_results = max;
        }
        if let Some(align) = align {
            if let Some(alignment) = align.first() {
                options.alignment = *alignment;
            }
            if let Some(offset) = align.get(1) {
                options.alignment_offset = *offset;
            }
        }
        options
    }
}

/// One line typed into `shell`.
#[derive(Parser, Debug)]
#[command(name = "ptinspect", no_binary_name = true)]
pub struct ShellLine {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
pub enum OutputFormatArg {
    Text,
    Csv,
    Json,
    Jsonl,
}

fn parse_architecture(s: &str) -> Result<Architecture, String> {
    s.parse::<Architecture>().map_err(|e| e.to_string())
}

fn parse_u32(s: &str) -> Result<u32, String> {
    let value = parse_number(s)?;
    u32::try_from(value).map_err(|_| format!("value {:#x} does not fit in 32 bits", value))
}
