//! Dump plugin - prints the selected page table ranges
use crate::error::InspectResult;
use crate::plugins::plugin_trait::{AnalysisContext, InspectPlugin, PluginOutput};

pub struct DumpPlugin;

impl InspectPlugin for DumpPlugin {
    fn name(&self) -> &str {
        "dump"
    }

    fn description(&self) -> &str {
        "Print the page table"
    }

    fn run(&self, context: &mut AnalysisContext) -> InspectResult<PluginOutput> {
        let (_, ranges) = context.filtered()?;
        Ok(PluginOutput::ranges(ranges, context.query.merge))
    }
}
