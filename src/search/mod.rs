//! Pattern search over the physical backing of page ranges
use crate::error::{InspectError, InspectResult};
use crate::memory::PhysicalMemory;
use crate::range::PageRange;
use log::{debug, info};
use memchr::memmem::Finder;
use serde::Serialize;
use std::collections::VecDeque;

/// Default cap on reported matches.
pub const DEFAULT_MAX_RESULTS: u64 = 0x1_0000_0000;
/// Bytes read per scan window, before the pattern-length overlap.
pub const DEFAULT_CHUNK_SIZE: u64 = 16 * 1024 * 1024;

/// What to look for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchPattern {
    Text(String),
    Bytes(Vec<u8>),
    U64(u64),
    U32(u32),
}

impl SearchPattern {
    /// Raw bytes to scan for. Integers are little-endian.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            SearchPattern::Text(s) => s.as_bytes().to_vec(),
            SearchPattern::Bytes(b) => b.clone(),
            SearchPattern::U64(v) => v.to_le_bytes().to_vec(),
            SearchPattern::U32(v) => v.to_le_bytes().to_vec(),
        }
    }

    /// Parse a hex byte string such as `da87374107` (an optional `0x` prefix
    /// and whitespace are ignored).
    pub fn parse_hex(s: &str) -> InspectResult<Self> {
        let cleaned: String = s.chars().filter(|c| !c.is_whitespace()).collect();
        let digits = cleaned
            .strip_prefix("0x")
            .or_else(|| cleaned.strip_prefix("0X"))
            .unwrap_or(&cleaned);

        if digits.is_empty() || !digits.is_ascii() || digits.len() % 2 != 0 {
            return Err(InspectError::invalid_argument(format!(
                "byte string '{}' must be an even, non-zero number of hex digits",
                s
            )));
        }

        let bytes = (0..digits.len())
            .step_by(2)
            .map(|i| {
                u8::from_str_radix(&digits[i..i + 2], 16).map_err(|_| {
                    InspectError::invalid_argument(format!("invalid hex byte string '{}'", s))
                })
            })
            .collect::<InspectResult<Vec<u8>>>()?;
        Ok(SearchPattern::Bytes(bytes))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchOptions {
    pub max_results: u64,
    /// Stride a match address must fall on.
    pub alignment: u64,
    pub alignment_offset: u64,
    pub chunk_size: u64,
}

impl Default for SearchOptions {
    fn default() -> Self {
        SearchOptions {
            max_results: DEFAULT_MAX_RESULTS,
            alignment: 1,
            alignment_offset: 0,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl SearchOptions {
    fn accepts(&self, address: u64) -> bool {
        address.wrapping_sub(self.alignment_offset) % self.alignment == 0
    }
}

/// One hit, with the range it was found in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SearchMatch {
    pub address: u64,
    pub physical_address: u64,
    pub range: PageRange,
}

/// Scan `ranges` in order for `pattern`. Nothing is read until the returned
/// iterator is advanced.
pub fn search<'a>(
    reader: &'a dyn PhysicalMemory,
    ranges: &'a [PageRange],
    pattern: &SearchPattern,
    options: SearchOptions,
) -> InspectResult<SearchMatches<'a>> {
    let needle = pattern.to_bytes();
    if needle.is_empty() {
        return Err(InspectError::invalid_argument("search pattern is empty"));
    }
    if options.alignment == 0 {
        return Err(InspectError::invalid_argument("alignment must be non-zero"));
    }
    if options.chunk_size == 0 {
        return Err(InspectError::invalid_argument("chunk size must be non-zero"));
    }

    info!(
        "searching {} ranges for {} bytes (align {:#x}, offset {:#x})",
        ranges.len(),
        needle.len(),
        options.alignment,
        options.alignment_offset
    );

    Ok(SearchMatches {
        reader,
        ranges,
        finder: Finder::new(&needle).into_owned(),
        options,
        range_index: 0,
        offset: 0,
        pending: VecDeque::new(),
        found: 0,
        finished: false,
    })
}

/// Lazy sequence of matches. A read failure is yielded once and ends it.
pub struct SearchMatches<'a> {
    reader: &'a dyn PhysicalMemory,
    ranges: &'a [PageRange],
    finder: Finder<'static>,
    options: SearchOptions,
    range_index: usize,
    /// Offset of the next window inside the current range.
    offset: u64,
    /// Accepted virtual addresses of the last window with their range index.
    pending: VecDeque<(u64, usize)>,
    found: u64,
    finished: bool,
}

impl SearchMatches<'_> {
    /// Scan the next window of the current range, queueing accepted hits.
    fn scan_window(&mut self) -> InspectResult<()> {
        let ranges = self.ranges;
        let range = &ranges[self.range_index];
        let needle_len = self.finder.needle().len() as u64;
        let remaining = range.page_size - self.offset;

        if remaining < needle_len {
            self.next_range();
            return Ok(());
        }

        let window = remaining.min(self.options.chunk_size);
        let read_len = remaining.min(window + needle_len - 1);
        let data = self
            .reader
            .read(range.physical_address + self.offset, read_len)?;

        for pos in self.finder.find_iter(&data) {
            let pos = pos as u64;
            // Hits starting in the overlap belong to the next window.
            if pos >= window {
                break;
            }
            let address = range.virtual_address + self.offset + pos;
            if self.options.accepts(address) {
                self.pending.push_back((address, self.range_index));
            }
        }

        self.offset += window;
        if self.offset >= range.page_size {
            self.next_range();
        }
        Ok(())
    }

    fn next_range(&mut self) {
        self.range_index += 1;
        self.offset = 0;
    }
}

impl Iterator for SearchMatches<'_> {
    type Item = InspectResult<SearchMatch>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.finished || self.found >= self.options.max_results {
                return None;
            }

            if let Some((address, index)) = self.pending.pop_front() {
                self.found += 1;
                let range = &self.ranges[index];
                let physical_address = range.physical_address + (address - range.virtual_address);
                return Some(Ok(SearchMatch {
                    address,
                    physical_address,
                    range: range.clone(),
                }));
            }

            if self.range_index >= self.ranges.len() {
                debug!("search finished with {} matches", self.found);
                self.finished = true;
                return None;
            }

            if let Err(e) = self.scan_window() {
                self.finished = true;
                return Some(Err(e));
            }
        }
    }
}
