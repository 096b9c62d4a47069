//! Plugin system trait for the page table inspector
use crate::analysis::aliases::AliasGroup;
use crate::analysis::aslr::{AslrInfo, LeakReport};
use crate::arch::{ControlRegisters, PagingBackend};
use crate::error::InspectResult;
use crate::filter::{analyze, build_filter, WindowArgs};
use crate::memory::PhysicalMemory;
use crate::range::{coalesce, CoalescedRange, PageRange};
use crate::search::SearchMatch;
use crate::translation::{walk, RootKey, TraversalCache, WalkOptions};

/// What a command asks of the walked tables.
#[derive(Debug, Clone, Default)]
pub struct Query {
    pub filters: Vec<String>,
    pub window: WindowArgs,
    pub walk: WalkOptions,
    /// Coalesce contiguous ranges for display.
    pub merge: bool,
}

/// Analysis context that provides access to all necessary components
pub struct AnalysisContext<'a> {
    pub reader: &'a dyn PhysicalMemory,
    pub backend: &'a dyn PagingBackend,
    pub registers: &'a ControlRegisters,
    pub cache: &'a mut TraversalCache,
    pub query: Query,
}

impl AnalysisContext<'_> {
    /// Every range reachable from the roots, unfiltered.
    pub fn walk(&mut self) -> InspectResult<Vec<PageRange>> {
        walk(
            self.reader,
            self.backend,
            self.registers,
            self.cache,
            &self.query.walk,
        )
    }

    /// Walk, then apply the query's filter tokens and window.
    pub fn filtered(&mut self) -> InspectResult<(Vec<PageRange>, Vec<PageRange>)> {
        let (filter, window) = build_filter(self.query.filters.as_slice(), &self.query.window, self.backend)?;
        let all = self.walk()?;
        let kept = analyze(&all, &filter, &window);
        Ok((all, kept))
    }
}

/// Output from plugins - different types of data
pub enum PluginOutput {
    Ranges(Vec<PageRange>),
    Coalesced(Vec<CoalescedRange>),
    Matches(Vec<SearchMatch>),
    Aliases(Vec<AliasGroup>),
    Aslr(AslrInfo),
    Leaks(Vec<LeakReport>),
    Info(Vec<(String, String)>),
    Roots(Vec<RootKey>),
    Message(String),
}

impl PluginOutput {
    /// Ranges, merged when the query asks for it.
    pub fn ranges(ranges: Vec<PageRange>, merge: bool) -> Self {
        if merge {
            PluginOutput::Coalesced(coalesce(&ranges))
        } else {
            PluginOutput::Ranges(ranges)
        }
    }
}

/// Trait that all inspector plugins must implement
pub trait InspectPlugin {
    /// Get the name of the plugin
    fn name(&self) -> &str;

    /// Get a description of what the plugin does
    fn description(&self) -> &str;

    /// Run the plugin with the provided analysis context
    fn run(&self, context: &mut AnalysisContext) -> InspectResult<PluginOutput>;
}
