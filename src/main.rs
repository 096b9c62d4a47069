//! Main entry point for the guest page table inspector
use anyhow::{Context, Result};
use clap::Parser;
use log::{debug, info, LevelFilter};
use std::io::BufRead;

use ptinspect::arch::{backend_for, ControlRegisters, PagingBackend};
use ptinspect::cli::args::{Cli, Command, OutputFormatArg, QueryArgs, ShellLine};
use ptinspect::error::{InspectError, InspectResult};
use ptinspect::formats::traits::{OutputDestination, OutputFormat, OutputWriter};
use ptinspect::memory::{MemoryMap, PhysicalMemory};
use ptinspect::plugins::{
    AliasesPlugin, AnalysisContext, CacheClearPlugin, CacheListPlugin, DumpPlugin, InfoPlugin,
    InspectPlugin, KaslrLeaksPlugin, KaslrPlugin, Query, SearchPlugin, TranslatePlugin,
};
use ptinspect::translation::TraversalCache;

fn main() -> Result<()> {
    // Parse command-line arguments
    let cli = Cli::parse();
    setup_logging(&cli);

    let memory_map = MemoryMap::open(&cli.memory_dump)
        .with_context(|| format!("failed to open memory dump {}", cli.memory_dump.display()))?;

    if memory_map.is_lime() {
        info!("LiME header detected, {} regions", memory_map.regions().len());
    } else {
        info!("No LiME header found; assuming raw memory capture");
    }
    for (i, region) in memory_map.regions().iter().enumerate() {
        debug!(
            "region {}: {:#x}-{:#x} at file offset {:#x}",
            i, region.start, region.end, region.file_offset
        );
    }

    let registers = cli
        .registers
        .load()
        .context("failed to load register values")?;
    let backend = backend_for(cli.arch, &registers)?;

    // Determine output format and destination
    let output_format = match cli.format {
        OutputFormatArg::Text => OutputFormat::Text,
        OutputFormatArg::Csv => OutputFormat::Csv,
        OutputFormatArg::Json => OutputFormat::Json,
        OutputFormatArg::Jsonl => OutputFormat::Jsonl,
    };

    let output_dest = if let Some(output_path) = &cli.output {
        OutputDestination::File(output_path.clone())
    } else {
        OutputDestination::Stdout
    };

    let output_writer = OutputWriter::new(output_format, output_dest);
    let mut cache = TraversalCache::new();

    let command = cli.command.clone().unwrap_or_else(Command::default_dump);
    let session = Session {
        reader: &memory_map,
        backend: backend.as_ref(),
        registers: &registers,
        writer: &output_writer,
    };

    match command {
        Command::Shell => session.run_shell(&mut cache)?,
        other => session.run_command(&other, &mut cache)?,
    }

    Ok(())
}

fn setup_logging(cli: &Cli) {
    let level = if cli.debug {
        LevelFilter::Debug
    } else if cli.verbose {
        LevelFilter::Info
    } else {
        LevelFilter::Warn
    };

    env_logger::Builder::new()
        .filter_level(level)
        .format_timestamp(None)
        .parse_default_env()
        .init();
}

fn to_query(args: &QueryArgs) -> Query {
    Query {
        filters: args.filter.clone(),
        window: args.window(),
        walk: args.walk_options(),
        merge: args.merge,
    }
}

/// Everything a command needs except the cache, which outlives single commands in the shell.
struct Session<'a> {
    reader: &'a dyn PhysicalMemory,
    backend: &'a dyn PagingBackend,
    registers: &'a ControlRegisters,
    writer: &'a OutputWriter,
}

impl Session<'_> {
    /// Run a specific plugin based on the command
    fn run_command(&self, command: &Command, cache: &mut TraversalCache) -> InspectResult<()> {
        let (plugin, query): (Box<dyn InspectPlugin>, Option<&QueryArgs>) = match command {
            Command::Dump { query } => (Box::new(DumpPlugin), Some(query)),
            Command::Search {
                pattern,
                max,
                align,
                query,
            } => (
                Box::new(SearchPlugin {
                    pattern: pattern.pattern()?,
                    options: Command::search_options(*max, align.as_deref()),
                }),
                Some(query),
            ),
            Command::Translate { address, query } => {
                (Box::new(TranslatePlugin { address: *address }), Some(query))
            }
            Command::Aliases { query } => (Box::new(AliasesPlugin), Some(query)),
            Command::Kaslr { query } => (Box::new(KaslrPlugin), Some(query)),
            Command::KaslrLeaks { per_value, query } => (
                Box::new(KaslrLeaksPlugin {
                    per_value: *per_value,
                }),
                Some(query),
            ),
            Command::Info => (Box::new(InfoPlugin), None),
            Command::List => (Box::new(CacheListPlugin), None),
            Command::Clear => (Box::new(CacheClearPlugin), None),
            Command::Shell => {
                return Err(InspectError::invalid_argument(
                    "shell cannot be started from inside the shell",
                ))
            }
        };

        let mut context = AnalysisContext {
            reader: self.reader,
            backend: self.backend,
            registers: self.registers,
            cache,
            query: query.map(to_query).unwrap_or_default(),
        };

        debug!("running plugin {}: {}", plugin.name(), plugin.description());
        let output = plugin.run(&mut context)?;
        self.writer.write(&output)
    }

    /// Read commands from stdin until EOF or `quit`.
    fn run_shell(&self, cache: &mut TraversalCache) -> Result<()> {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let line = line.context("failed to read command")?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if line == "quit" || line == "exit" {
                break;
            }

            match ShellLine::try_parse_from(line.split_whitespace()) {
                Ok(parsed) => {
                    if let Err(e) = self.run_command(&parsed.command, cache) {
                        eprintln!("Error: {}", e);
                    }
                }
                Err(e) => {
                    // Help and usage errors go to the terminal; the session continues.
                    let _ = e.print();
                }
            }
        }
        Ok(())
    }
}
