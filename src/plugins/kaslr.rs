//! KASLR plugins - image slide, physmap base and leaked pointers
use crate::analysis::aslr::{aslr_info, find_leaks};
use crate::error::{InspectError, InspectResult};
use crate::filter::WindowArgs;
use crate::plugins::plugin_trait::{AnalysisContext, InspectPlugin, PluginOutput};
use log::Level;

const NO_ANCHORS: &str = "No KASLR anchors found in the page table";

pub struct KaslrPlugin;

impl InspectPlugin for KaslrPlugin {
    fn name(&self) -> &str {
        "kaslr"
    }

    fn description(&self) -> &str {
        "Print the kernel image slide and physmap base"
    }

    fn run(&self, context: &mut AnalysisContext) -> InspectResult<PluginOutput> {
        // Anchors are looked up in the whole table.
        if !context.query.filters.is_empty() || context.query.window != WindowArgs::default() {
            return Err(InspectError::invalid_argument(
                "kaslr reads the whole page table; --filter and address windows do not apply",
            ));
        }
        let all = context.walk()?;
        let verbose = log::log_enabled!(Level::Info);
        match aslr_info(&all, context.backend.aslr_layout(), verbose) {
            Some(info) => Ok(PluginOutput::Aslr(info)),
            None => Ok(PluginOutput::Message(NO_ANCHORS.to_string())),
        }
    }
}

pub struct KaslrLeaksPlugin {
    pub per_value: u64,
}

impl InspectPlugin for KaslrLeaksPlugin {
    fn name(&self) -> &str {
        "kaslr-leaks"
    }

    fn description(&self) -> &str {
        "Search for values that disclose the KASLR offsets"
    }

    fn run(&self, context: &mut AnalysisContext) -> InspectResult<PluginOutput> {
        let (all, kept) = context.filtered()?;
        let info = match aslr_info(&all, context.backend.aslr_layout(), false) {
            Some(info) => info,
            None => return Ok(PluginOutput::Message(NO_ANCHORS.to_string())),
        };
        let leaks = find_leaks(context.reader, &kept, &info, self.per_value)?;
        Ok(PluginOutput::Leaks(leaks))
    }
}
