//! Text (table) output formatter for the page table inspector
use crate::analysis::aliases::AliasGroup;
use crate::analysis::aslr::{AslrInfo, LeakReport};
use crate::error::InspectResult;
use crate::formats::traits::{aslr_rows, hex, OutputFormatter};
use crate::range::{CoalescedRange, PageRange};
use crate::search::SearchMatch;
use crate::translation::RootKey;
use prettytable::{Cell, Row, Table};

/// Text formatter that outputs data in a human-readable table format
pub struct TextFormatter;

fn table_with_header(columns: &[&str]) -> Table {
    let mut table = Table::new();
    table.set_format(*prettytable::format::consts::FORMAT_NO_LINESEP_WITH_TITLE);
    table.set_titles(Row::new(
        columns
            .iter()
            .map(|c| Cell::new(c).style_spec("c"))
            .collect(),
    ));
    table
}

fn key_value_table(rows: &[(String, String)]) -> String {
    let mut table = Table::new();
    table.set_format(*prettytable::format::consts::FORMAT_CLEAN);
    for (key, value) in rows {
        table.add_row(Row::new(vec![Cell::new(key), Cell::new(value)]));
    }
    table.to_string()
}

impl OutputFormatter for TextFormatter {
    fn format_ranges(&self, ranges: &[PageRange]) -> InspectResult<String> {
        let mut table = table_with_header(&["ADDRESS", "END", "SIZE", "PHYSICAL", "KERNEL", "USER", "CACHE"]);

        for range in ranges {
            let perms = &range.permissions;
            table.add_row(Row::new(vec![
                Cell::new(&hex(range.virtual_address)),
                Cell::new(&hex(range.end())),
                Cell::new(&hex(range.page_size)),
                Cell::new(&hex(range.physical_address)),
                Cell::new(&perms.privileged.describe()),
                Cell::new(&perms.unprivileged.describe()),
                Cell::new(perms.cache.short_name()),
            ]));
        }

        Ok(table.to_string())
    }

    fn format_coalesced(&self, ranges: &[CoalescedRange]) -> InspectResult<String> {
        let mut table = table_with_header(&["ADDRESS", "SIZE", "PHYSICAL", "KERNEL", "USER", "CACHE", "PAGES"]);

        for range in ranges {
            let perms = &range.permissions;
            table.add_row(Row::new(vec![
                Cell::new(&hex(range.virtual_address)),
                Cell::new(&hex(range.size)),
                Cell::new(&hex(range.physical_address)),
                Cell::new(&perms.privileged.describe()),
                Cell::new(&perms.unprivileged.describe()),
                Cell::new(perms.cache.short_name()),
                Cell::new(&range.pages.to_string()),
            ]));
        }

        Ok(table.to_string())
    }

    fn format_matches(&self, matches: &[SearchMatch]) -> InspectResult<String> {
        let mut table = table_with_header(&["ADDRESS", "PHYSICAL", "RANGE"]);

        for hit in matches {
            table.add_row(Row::new(vec![
                Cell::new(&hex(hit.address)),
                Cell::new(&hex(hit.physical_address)),
                Cell::new(&hit.range.to_string()),
            ]));
        }

        Ok(table.to_string())
    }

    fn format_aliases(&self, groups: &[AliasGroup]) -> InspectResult<String> {
        let mut table = table_with_header(&["GROUP", "PHYSICAL", "ADDRESS", "SIZE", "PERMISSIONS"]);

        for (i, group) in groups.iter().enumerate() {
            for member in &group.members {
                table.add_row(Row::new(vec![
                    Cell::new(&i.to_string()),
                    Cell::new(&format!("{}-{}", hex(group.physical_start), hex(group.physical_end))),
                    Cell::new(&hex(member.virtual_address)),
                    Cell::new(&hex(member.page_size)),
                    Cell::new(&member.permissions.to_string()),
                ]));
            }
        }

        Ok(table.to_string())
    }

    fn format_aslr(&self, info: &AslrInfo) -> InspectResult<String> {
        Ok(key_value_table(&aslr_rows(info)))
    }

    fn format_leaks(&self, leaks: &[LeakReport]) -> InspectResult<String> {
        let mut table = table_with_header(&["VALUE", "KIND", "FOUND AT", "RANGE"]);

        for leak in leaks {
            table.add_row(Row::new(vec![
                Cell::new(&hex(leak.value)),
                Cell::new(&leak.kind.to_string()),
                Cell::new(&hex(leak.address)),
                Cell::new(&leak.range.to_string()),
            ]));
        }

        Ok(table.to_string())
    }

    fn format_info(&self, rows: &[(String, String)]) -> InspectResult<String> {
        Ok(key_value_table(rows))
    }

    fn format_roots(&self, roots: &[RootKey]) -> InspectResult<String> {
        let mut table = table_with_header(&["ROOT", "HALF"]);

        for root in roots {
            table.add_row(Row::new(vec![
                Cell::new(&hex(root.address)),
                Cell::new(&format!("{:?}", root.half)),
            ]));
        }

        Ok(table.to_string())
    }
}
