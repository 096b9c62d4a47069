//! Translate plugin - resolves one virtual address
use crate::error::InspectResult;
use crate::plugins::plugin_trait::{AnalysisContext, InspectPlugin, PluginOutput};
use crate::translation::translate;

pub struct TranslatePlugin {
    pub address: u64,
}

impl InspectPlugin for TranslatePlugin {
    fn name(&self) -> &str {
        "translate"
    }

    fn description(&self) -> &str {
        "Translate a virtual address to its physical address"
    }

    fn run(&self, context: &mut AnalysisContext) -> InspectResult<PluginOutput> {
        let (_, ranges) = context.filtered()?;
        let message = match translate(&ranges, self.address) {
            Some((range, physical)) => format!(
                "{:#x} -> {:#x}\n{}",
                self.address, physical, range
            ),
            None => format!("{:#x} is not mapped", self.address),
        };
        Ok(PluginOutput::Message(message))
    }
}
