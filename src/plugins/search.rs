//! Search plugin - scans the memory behind the selected ranges
use crate::error::InspectResult;
use crate::plugins::plugin_trait::{AnalysisContext, InspectPlugin, PluginOutput};
use crate::search::{search, SearchOptions, SearchPattern};
use log::warn;

pub struct SearchPlugin {
    pub pattern: SearchPattern,
    pub options: SearchOptions,
}

impl InspectPlugin for SearchPlugin {
    fn name(&self) -> &str {
        "search"
    }

    fn description(&self) -> &str {
        "Search the memory behind the selected ranges"
    }

    fn run(&self, context: &mut AnalysisContext) -> InspectResult<PluginOutput> {
        let (_, ranges) = context.filtered()?;

        // One range at a time: a hole in the dump only loses the range mapping it.
        let mut matches = Vec::new();
        for range in &ranges {
            let found = matches.len() as u64;
            if found >= self.options.max_results {
                break;
            }
            let options = SearchOptions {
                max_results: self.options.max_results - found,
                ..self.options
            };
            for hit in search(context.reader, std::slice::from_ref(range), &self.pattern, options)? {
                match hit {
                    Ok(hit) => matches.push(hit),
                    Err(e) => {
                        warn!("skipping range {:#x}: {}", range.virtual_address, e);
                    }
                }
            }
        }
        Ok(PluginOutput::Matches(matches))
    }
}
