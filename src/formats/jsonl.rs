//! JSONL (JSON Lines) output formatter for the page table inspector
use crate::analysis::aliases::AliasGroup;
use crate::analysis::aslr::{AslrInfo, LeakReport};
use crate::error::InspectResult;
use crate::formats::json::info_rows;
use crate::formats::traits::OutputFormatter;
use crate::range::{CoalescedRange, PageRange};
use crate::search::SearchMatch;
use crate::translation::RootKey;
use serde::Serialize;

/// JSONL formatter that outputs data as JSON objects, one per line
pub struct JsonlFormatter;

fn lines<T: Serialize>(items: &[T]) -> InspectResult<String> {
    let mut output = String::new();

    for item in items {
        let line = serde_json::to_string(item)?;
        output.push_str(&line);
        output.push('\n');
    }

    Ok(output)
}

impl OutputFormatter for JsonlFormatter {
    fn format_ranges(&self, ranges: &[PageRange]) -> InspectResult<String> {
        lines(ranges)
    }

    fn format_coalesced(&self, ranges: &[CoalescedRange]) -> InspectResult<String> {
        lines(ranges)
    }

    fn format_matches(&self, matches: &[SearchMatch]) -> InspectResult<String> {
        lines(matches)
    }

    fn format_aliases(&self, groups: &[AliasGroup]) -> InspectResult<String> {
        lines(groups)
    }

    fn format_aslr(&self, info: &AslrInfo) -> InspectResult<String> {
        lines(std::slice::from_ref(info))
    }

    fn format_leaks(&self, leaks: &[LeakReport]) -> InspectResult<String> {
        lines(leaks)
    }

    fn format_info(&self, rows: &[(String, String)]) -> InspectResult<String> {
        lines(info_rows(rows).as_slice())
    }

    fn format_roots(&self, roots: &[RootKey]) -> InspectResult<String> {
        lines(roots)
    }
}
