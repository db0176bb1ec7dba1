// src/cli.rs

//! CLI argument parsing using `clap`.

use clap::{Parser, ValueEnum};

/// Command-line arguments for `jobflow`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "jobflow",
    version,
    about = "Run scheduled tasks and dependency-ordered workflows.",
    long_about = None
)]
pub struct CliArgs {
    /// Path to the config file (TOML).
    #[arg(long, value_name = "PATH", default_value = "jobflow.toml")]
    pub config: String,

    /// Run whatever is due right now (plus anything it triggers) and exit.
    #[arg(long)]
    pub once: bool,

    /// Start this workflow or task immediately, wait for it and exit.
    ///
    /// Workflow tasks are addressed as `<workflow>.<task>`.
    #[arg(long, value_name = "NAME", conflicts_with = "from_task")]
    pub run: Option<String>,

    /// Run a partial workflow starting at this task (`<workflow>.<task>`):
    /// the task and everything downstream of it.
    #[arg(long, value_name = "NAME")]
    pub from_task: Option<String>,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `JOBFLOW_LOG` or a default level will be used.
    #[arg(long, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    /// Parse + validate, print the catalog, but don't execute anything.
    #[arg(long)]
    pub dry_run: bool,
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

pub fn parse() -> CliArgs {
    CliArgs::parse()
}
