//! Library crate for the guest page table inspector

#![allow(clippy::new_without_default)]
#![allow(clippy::manual_range_contains)]

pub mod arch;
pub mod error;
pub mod filter;
pub mod memory;
pub mod range;
pub mod search;
pub mod translation;

// Analysis modules
pub mod analysis {
    pub mod aliases;
    pub mod aslr;
}

// CLI modules
pub mod cli {
    pub mod args;
}

// Plugin modules
pub mod plugins;

// Format modules
pub mod formats {
    pub mod csv;
    pub mod json;
    pub mod jsonl;
    pub mod text;
    pub mod traits;
}
