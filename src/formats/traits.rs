//! Output format traits for the page table inspector
use crate::analysis::aliases::AliasGroup;
use crate::analysis::aslr::{AslrInfo, LeakReport};
use crate::error::InspectResult;
use crate::plugins::PluginOutput;
use crate::range::{CoalescedRange, PageRange};
use crate::search::SearchMatch;
use crate::translation::RootKey;

/// Trait for output formatters
pub trait OutputFormatter {
    fn format_ranges(&self, ranges: &[PageRange]) -> InspectResult<String>;
    fn format_coalesced(&self, ranges: &[CoalescedRange]) -> InspectResult<String>;
    fn format_matches(&self, matches: &[SearchMatch]) -> InspectResult<String>;
    fn format_aliases(&self, groups: &[AliasGroup]) -> InspectResult<String>;
    fn format_aslr(&self, info: &AslrInfo) -> InspectResult<String>;
    fn format_leaks(&self, leaks: &[LeakReport]) -> InspectResult<String>;
    fn format_info(&self, rows: &[(String, String)]) -> InspectResult<String>;
    fn format_roots(&self, roots: &[RootKey]) -> InspectResult<String>;
}

/// Enum for output format types
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OutputFormat {
    Text,
    Csv,
    Json,
    Jsonl,
}

/// Enum for output destination
#[derive(Debug, Clone)]
pub enum OutputDestination {
    Stdout,
    File(std::path::PathBuf),
}

/// Output writer that combines format and destination
pub struct OutputWriter {
    formatter: Box<dyn OutputFormatter>,
    destination: OutputDestination,
}

impl OutputWriter {
    /// Create a new output writer
    pub fn new(format: OutputFormat, destination: OutputDestination) -> Self {
        let formatter: Box<dyn OutputFormatter> = match format {
            OutputFormat::Text => Box::new(crate::formats::text::TextFormatter),
            OutputFormat::Csv => Box::new(crate::formats::csv::CsvFormatter),
            OutputFormat::Json => Box::new(crate::formats::json::JsonFormatter),
            OutputFormat::Jsonl => Box::new(crate::formats::jsonl::JsonlFormatter),
        };

        Self {
            formatter,
            destination,
        }
    }

    /// Render a plugin result and write it to the configured destination
    pub fn write(&self, output: &PluginOutput) -> InspectResult<()> {
        let content = self.render(output)?;
        self.emit(&content)
    }

    /// Render a plugin result with the configured formatter
    pub fn render(&self, output: &PluginOutput) -> InspectResult<String> {
        let f = &self.formatter;
        match output {
            PluginOutput::Ranges(ranges) if ranges.is_empty() => Ok(EMPTY_RANGES.to_string()),
            PluginOutput::Ranges(ranges) => f.format_ranges(ranges),
            PluginOutput::Coalesced(ranges) if ranges.is_empty() => Ok(EMPTY_RANGES.to_string()),
            PluginOutput::Coalesced(ranges) => f.format_coalesced(ranges),
            PluginOutput::Matches(matches) if matches.is_empty() => {
                Ok("No matches found.".to_string())
            }
            PluginOutput::Matches(matches) => f.format_matches(matches),
            PluginOutput::Aliases(groups) if groups.is_empty() => {
                Ok("No aliased ranges found.".to_string())
            }
            PluginOutput::Aliases(groups) => f.format_aliases(groups),
            PluginOutput::Aslr(info) => f.format_aslr(info),
            PluginOutput::Leaks(leaks) if leaks.is_empty() => Ok("No leaks found.".to_string()),
            PluginOutput::Leaks(leaks) => f.format_leaks(leaks),
            PluginOutput::Info(rows) => f.format_info(rows),
            PluginOutput::Roots(roots) if roots.is_empty() => {
                Ok("No cached page tables.".to_string())
            }
            PluginOutput::Roots(roots) => f.format_roots(roots),
            PluginOutput::Message(message) => Ok(message.clone()),
        }
    }

    fn emit(&self, content: &str) -> InspectResult<()> {
        match &self.destination {
            OutputDestination::Stdout => {
                println!("{}", content);
            }
            OutputDestination::File(path) => {
                std::fs::write(path, content)?;
            }
        }

        Ok(())
    }
}

const EMPTY_RANGES: &str = "No ranges matched the query.";

/// `0x`-prefixed lowercase hex.
pub(crate) fn hex(value: u64) -> String {
    format!("{:#x}", value)
}

/// `0x`-prefixed signed hex, for slides.
pub(crate) fn signed_hex(value: i64) -> String {
    if value < 0 {
        format!("-{:#x}", value.unsigned_abs())
    } else {
        format!("{:#x}", value)
    }
}

/// Key/value rows describing an [`AslrInfo`], shared by the tabular formats.
pub(crate) fn aslr_rows(info: &AslrInfo) -> Vec<(String, String)> {
    let mut rows = Vec::new();
    if let Some(anchor) = &info.image_anchor {
        rows.push(("image anchor".to_string(), anchor.to_string()));
    }
    if let Some(base) = info.image_base {
        rows.push(("image base".to_string(), hex(base)));
    }
    if let Some(slide) = info.image_slide {
        rows.push(("image slide".to_string(), signed_hex(slide)));
    }
    if let Some(anchor) = &info.physmap_anchor {
        rows.push(("physmap anchor".to_string(), anchor.to_string()));
    }
    if let Some(base) = info.physmap_base {
        rows.push(("physmap base".to_string(), hex(base)));
    }
    if let Some(slide) = info.physmap_slide {
        rows.push(("physmap slide".to_string(), signed_hex(slide)));
    }
    rows
}
