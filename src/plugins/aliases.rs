//! Aliases plugin - virtual ranges sharing physical memory
use crate::analysis::aliases::find_aliases;
use crate::error::InspectResult;
use crate::filter::WindowArgs;
use crate::plugins::plugin_trait::{AnalysisContext, InspectPlugin, PluginOutput};
use std::collections::HashSet;

pub struct AliasesPlugin;

impl InspectPlugin for AliasesPlugin {
    fn name(&self) -> &str {
        "aliases"
    }

    fn description(&self) -> &str {
        "Find virtual ranges backed by the same physical memory"
    }

    fn run(&self, context: &mut AnalysisContext) -> InspectResult<PluginOutput> {
        // Groups are built from the whole table; filters only select which are shown.
        let (all, kept) = context.filtered()?;
        let mut groups = find_aliases(&all);

        if !context.query.filters.is_empty() || context.query.window != WindowArgs::default() {
            let selected: HashSet<u64> = kept.iter().map(|r| r.virtual_address).collect();
            groups.retain(|group| {
                group
                    .members
                    .iter()
                    .any(|member| selected.contains(&member.virtual_address))
            });
        }
        Ok(PluginOutput::Aliases(groups))
    }
}
