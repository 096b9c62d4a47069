//! JSON output formatter for the page table inspector
use crate::analysis::aliases::AliasGroup;
use crate::analysis::aslr::{AslrInfo, LeakReport};
use crate::error::InspectResult;
use crate::formats::traits::OutputFormatter;
use crate::range::{CoalescedRange, PageRange};
use crate::search::SearchMatch;
use crate::translation::RootKey;
use serde::Serialize;

#[derive(Serialize)]
struct OutputWrapper<'a, T: Serialize> {
    command: &'a str,
    timestamp: String,
    count: usize,
    results: &'a [T],
}

#[derive(Serialize)]
pub(crate) struct InfoRow<'a> {
    pub name: &'a str,
    pub value: &'a str,
}

pub(crate) fn info_rows(rows: &[(String, String)]) -> Vec<InfoRow<'_>> {
    rows.iter()
        .map(|(name, value)| InfoRow { name, value })
        .collect()
}

fn wrap<T: Serialize>(command: &str, results: &[T]) -> InspectResult<String> {
    let wrapper = OutputWrapper {
        command,
        timestamp: chrono::Utc::now().to_rfc3339(),
        count: results.len(),
        results,
    };

    let json = serde_json::to_string_pretty(&wrapper)?;
    Ok(json)
}

/// JSON formatter that outputs data in JSON format with metadata
pub struct JsonFormatter;

impl OutputFormatter for JsonFormatter {
    fn format_ranges(&self, ranges: &[PageRange]) -> InspectResult<String> {
        wrap("dump", ranges)
    }

    fn format_coalesced(&self, ranges: &[CoalescedRange]) -> InspectResult<String> {
        wrap("dump", ranges)
    }

    fn format_matches(&self, matches: &[SearchMatch]) -> InspectResult<String> {
        wrap("search", matches)
    }

    fn format_aliases(&self, groups: &[AliasGroup]) -> InspectResult<String> {
        wrap("aliases", groups)
    }

    fn format_aslr(&self, info: &AslrInfo) -> InspectResult<String> {
        wrap("kaslr", std::slice::from_ref(info))
    }

    fn format_leaks(&self, leaks: &[LeakReport]) -> InspectResult<String> {
        wrap("kaslr-leaks", leaks)
    }

    fn format_info(&self, rows: &[(String, String)]) -> InspectResult<String> {
        wrap("info", info_rows(rows).as_slice())
    }

    fn format_roots(&self, roots: &[RootKey]) -> InspectResult<String> {
        wrap("list", roots)
    }
}
