//! Cache plugins - list and clear saved page tables
use crate::error::InspectResult;
use crate::plugins::plugin_trait::{AnalysisContext, InspectPlugin, PluginOutput};
use crate::translation::{cache_clear, cache_list};

pub struct CacheListPlugin;

impl InspectPlugin for CacheListPlugin {
    fn name(&self) -> &str {
        "list"
    }

    fn description(&self) -> &str {
        "List cached page tables"
    }

    fn run(&self, context: &mut AnalysisContext) -> InspectResult<PluginOutput> {
        Ok(PluginOutput::Roots(cache_list(context.cache)))
    }
}

pub struct CacheClearPlugin;

impl InspectPlugin for CacheClearPlugin {
    fn name(&self) -> &str {
        "clear"
    }

    fn description(&self) -> &str {
        "Clear all cached page tables"
    }

    fn run(&self, context: &mut AnalysisContext) -> InspectResult<PluginOutput> {
        let count = context.cache.len();
        cache_clear(context.cache);
        Ok(PluginOutput::Message(format!("Cleared {} cached page tables", count)))
    }
}
