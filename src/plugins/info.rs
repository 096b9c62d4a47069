//! Info plugin - paging mode and register values
use crate::error::InspectResult;
use crate::plugins::plugin_trait::{AnalysisContext, InspectPlugin, PluginOutput};

pub struct InfoPlugin;

impl InspectPlugin for InfoPlugin {
    fn name(&self) -> &str {
        "info"
    }

    fn description(&self) -> &str {
        "Print paging mode and register information"
    }

    fn run(&self, context: &mut AnalysisContext) -> InspectResult<PluginOutput> {
        let mut rows = context.backend.describe();

        let regs = context.registers;
        let named = [
            ("cr0", regs.cr0),
            ("cr3", regs.cr3),
            ("cr4", regs.cr4),
            ("efer", regs.efer),
            ("pat", regs.pat),
            ("ttbr0_el1", regs.ttbr0_el1),
            ("ttbr1_el1", regs.ttbr1_el1),
            ("tcr_el1", regs.tcr_el1),
            ("satp", regs.satp),
        ];
        for (name, value) in named {
            if let Some(value) = value {
                rows.push((name.to_string(), format!("{:#018x}", value)));
            }
        }

        rows.push(("cached roots".to_string(), context.cache.len().to_string()));
        Ok(PluginOutput::Info(rows))
    }
}
