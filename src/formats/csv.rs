//! CSV output formatter for the page table inspector
use crate::analysis::aliases::AliasGroup;
use crate::analysis::aslr::{AslrInfo, LeakReport};
use crate::error::InspectResult;
use crate::formats::traits::{aslr_rows, hex, OutputFormatter};
use crate::range::{CoalescedRange, PageRange};
use crate::search::SearchMatch;
use crate::translation::RootKey;
use csv::Writer;

/// CSV formatter that outputs data in comma-separated values format
pub struct CsvFormatter;

fn finish(wtr: Writer<Vec<u8>>) -> InspectResult<String> {
    let data = wtr.into_inner()?;
    Ok(String::from_utf8(data)?)
}

fn key_value_csv(rows: &[(String, String)]) -> InspectResult<String> {
    let mut wtr = Writer::from_writer(vec![]);
    wtr.write_record(["name", "value"])?;
    for (name, value) in rows {
        wtr.write_record([name, value])?;
    }
    wtr.flush()?;
    finish(wtr)
}

impl OutputFormatter for CsvFormatter {
    fn format_ranges(&self, ranges: &[PageRange]) -> InspectResult<String> {
        let mut wtr = Writer::from_writer(vec![]);

        wtr.write_record([
            "virtual_address",
            "end",
            "page_size",
            "physical_address",
            "privileged",
            "unprivileged",
            "cache",
        ])?;

        for range in ranges {
            let perms = &range.permissions;
            wtr.write_record(&[
                hex(range.virtual_address),
                hex(range.end()),
                hex(range.page_size),
                hex(range.physical_address),
                perms.privileged.describe(),
                perms.unprivileged.describe(),
                perms.cache.short_name().to_string(),
            ])?;
        }

        wtr.flush()?;
        finish(wtr)
    }

    fn format_coalesced(&self, ranges: &[CoalescedRange]) -> InspectResult<String> {
        let mut wtr = Writer::from_writer(vec![]);

        wtr.write_record([
            "virtual_address",
            "size",
            "physical_address",
            "privileged",
            "unprivileged",
            "cache",
            "pages",
        ])?;

        for range in ranges {
            let perms = &range.permissions;
            wtr.write_record(&[
                hex(range.virtual_address),
                hex(range.size),
                hex(range.physical_address),
                perms.privileged.describe(),
                perms.unprivileged.describe(),
                perms.cache.short_name().to_string(),
                range.pages.to_string(),
            ])?;
        }

        wtr.flush()?;
        finish(wtr)
    }

    fn format_matches(&self, matches: &[SearchMatch]) -> InspectResult<String> {
        let mut wtr = Writer::from_writer(vec![]);

        wtr.write_record(["address", "physical_address", "range_start", "range_size"])?;
        for hit in matches {
            wtr.write_record(&[
                hex(hit.address),
                hex(hit.physical_address),
                hex(hit.range.virtual_address),
                hex(hit.range.page_size),
            ])?;
        }

        wtr.flush()?;
        finish(wtr)
    }

    fn format_aliases(&self, groups: &[AliasGroup]) -> InspectResult<String> {
        let mut wtr = Writer::from_writer(vec![]);

        wtr.write_record([
            "group",
            "physical_start",
            "physical_end",
            "virtual_address",
            "page_size",
            "permissions",
        ])?;
        for (i, group) in groups.iter().enumerate() {
            for member in &group.members {
                wtr.write_record(&[
                    i.to_string(),
                    hex(group.physical_start),
                    hex(group.physical_end),
                    hex(member.virtual_address),
                    hex(member.page_size),
                    member.permissions.to_string(),
                ])?;
            }
        }

        wtr.flush()?;
        finish(wtr)
    }

    fn format_aslr(&self, info: &AslrInfo) -> InspectResult<String> {
        key_value_csv(&aslr_rows(info))
    }

    fn format_leaks(&self, leaks: &[LeakReport]) -> InspectResult<String> {
        let mut wtr = Writer::from_writer(vec![]);

        wtr.write_record(["kind", "value", "address", "range_start"])?;
        for leak in leaks {
            wtr.write_record(&[
                leak.kind.to_string(),
                hex(leak.value),
                hex(leak.address),
                hex(leak.range.virtual_address),
            ])?;
        }

        wtr.flush()?;
        finish(wtr)
    }

    fn format_info(&self, rows: &[(String, String)]) -> InspectResult<String> {
        key_value_csv(rows)
    }

    fn format_roots(&self, roots: &[RootKey]) -> InspectResult<String> {
        let mut wtr = Writer::from_writer(vec![]);

        wtr.write_record(["root", "half"])?;
        for root in roots {
            wtr.write_record(&[hex(root.address), format!("{:?}", root.half)])?;
        }

        wtr.flush()?;
        finish(wtr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::AddressHalf;

    #[test]
    fn test_roots_csv() {
        let roots = vec![RootKey {
            address: 0x1000,
            half: AddressHalf::Full,
        }];
        let out = CsvFormatter.format_roots(&roots).unwrap();
        assert_eq!(out, "root,half\n0x1000,Full\n");
    }
}
