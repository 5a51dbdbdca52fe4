//! CLI argument parsing using `clap`.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

/// Command-line arguments for `loom`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "loom",
    version,
    about = "Run task graphs with an in-process scheduler and runner.",
    long_about = None
)]
pub struct CliArgs {
    /// Host the task scheduler (and its lease / retention pollers).
    ///
    /// With neither `--scheduler` nor `--runner`, both roles run.
    #[arg(short = 's', long)]
    pub scheduler: bool,

    /// Host the task runner.
    #[arg(short = 'r', long)]
    pub runner: bool,

    /// Path to the engine config file (TOML). Defaults apply when omitted.
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Override the domain from the config file.
    #[arg(long, value_name = "NAME")]
    pub domain: Option<String>,

    /// JSON file with `tasks` and `graphs` arrays of definitions.
    #[arg(long, value_name = "PATH")]
    pub definitions: Option<PathBuf>,

    /// Run this graph, wait for it to finish and exit.
    #[arg(long, value_name = "GRAPH")]
    pub run: Option<String>,

    /// Target the graph acts on (at most one active graph per target).
    #[arg(long, value_name = "TARGET", requires = "run")]
    pub target: Option<String>,

    /// Run options as a JSON object, overlaid on the definition's options.
    #[arg(long, value_name = "JSON", requires = "run")]
    pub options: Option<String>,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `LOOM_LOG` (an `EnvFilter` directive) or `info` is used.
    #[arg(long, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl CliArgs {
    /// (scheduler, runner)
    pub fn roles(&self) -> (bool, bool) {
        if !self.scheduler && !self.runner {
            (true, true)
        } else {
            (self.scheduler, self.runner)
        }
    }
}

pub fn parse() -> CliArgs {
    CliArgs::parse()
}
