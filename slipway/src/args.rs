//! Command-line surface of the emitted pipeline binary.
//!
//! The same binary is invoked three ways: by the author (`--mode=cli`, the
//! default), by the cli backend inside each per-step container
//! (`--step=<serial>`), and to render a hosted-CI document (`--mode=drone`).
//! Parse errors exit with code 2; execution errors exit with code 1.

use clap::{Parser, ValueEnum};

/// Which backend consumes the frozen collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    /// Execute the pipeline locally, one container per step.
    Cli,
    /// Render a drone configuration document.
    Drone,
}

#[derive(Debug, Clone, Parser)]
#[command(name = "pipeline", disable_help_subcommand = true)]
pub struct PipelineArgs {
    /// Backend used to run the pipeline.
    #[arg(long, value_enum, default_value_t = Mode::Cli)]
    pub mode: Mode,

    /// Execute only the step with this serial.
    #[arg(long)]
    pub step: Option<i64>,

    /// Run identifier; generated randomly when absent.
    #[arg(long)]
    pub build_id: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Supply a pipeline argument; may repeat.
    #[arg(long = "arg", value_name = "KEY=VALUE", value_parser = parse_key_val)]
    pub args: Vec<(String, String)>,

    /// Path to the pipeline crate, relative to the module root.
    #[arg(value_name = "PATH", default_value = ".")]
    pub path: String,
}

impl PipelineArgs {
    /// Parse from the process arguments. Exits with code 2 on bad input.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Fallible variant for tests and re-invocation.
    pub fn try_parse_args<I, T>(iter: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        Self::try_parse_from(iter)
    }
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected KEY=VALUE, got '{s}'"))
}
