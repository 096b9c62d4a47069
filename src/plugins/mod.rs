//! Inspector commands, one plugin per command
pub mod aliases;
pub mod cache;
pub mod dump;
pub mod info;
pub mod kaslr;
pub mod plugin_trait;
pub mod search;
pub mod translate;

pub use aliases::AliasesPlugin;
pub use cache::{CacheClearPlugin, CacheListPlugin};
pub use dump::DumpPlugin;
pub use info::InfoPlugin;
pub use kaslr::{KaslrLeaksPlugin, KaslrPlugin};
pub use plugin_trait::{AnalysisContext, InspectPlugin, PluginOutput, Query};
pub use search::SearchPlugin;
pub use translate::TranslatePlugin;
