//! CLI command definitions and dispatch.

pub mod diff;
pub mod logs;
pub mod ps;
pub mod rm;
pub mod run;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use strata_common::config::RuntimeConfig;
use strata_runtime::Engine;

/// strata: run one command in an isolated, resource-bounded container.
#[derive(Parser, Debug)]
#[command(name = "strata", version, about, long_about = None)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Command,

    /// JSON runtime configuration file.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Runtime-owned state directory (overrides the configuration file).
    #[arg(long, global = true, env = "STRATA_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Parent cgroup for container groups (overrides the configuration file).
    #[arg(long, global = true, env = "STRATA_CGROUP_ROOT")]
    pub cgroup_root: Option<PathBuf>,

    /// Diagnostic log format on stderr.
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

/// Diagnostic output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human-readable lines.
    Text,
    /// One JSON object per event.
    Json,
}

/// Available CLI subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create, start and wait for a container described by a JSON spec.
    Run(run::RunArgs),
    /// List containers known to the runtime.
    Ps(ps::PsArgs),
    /// Print a container's captured output.
    Logs(logs::LogsArgs),
    /// Remove a stopped container and its files.
    Rm(rm::RmArgs),
    /// Show changes in a container's writable layer.
    Diff(diff::DiffArgs),
}

impl Cli {
    /// Resolves the runtime configuration from the file and overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration file cannot be loaded.
    pub fn runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        let mut config = match &self.config {
            Some(path) => RuntimeConfig::load(path)
                .with_context(|| format!("cannot load configuration {}", path.display()))?,
            None => RuntimeConfig::default(),
        };
        if let Some(dir) = &self.data_dir {
            config.data_dir.clone_from(dir);
        }
        if let Some(root) = &self.cgroup_root {
            config.cgroup_root.clone_from(root);
        }
        Ok(config)
    }
}

/// Dispatches the parsed CLI command to its handler.
///
/// # Errors
///
/// Returns an error if the command execution fails.
pub fn execute(cli: Cli) -> anyhow::Result<ExitCode> {
    let engine = Engine::new(cli.runtime_config()?);
    tracing::debug!(host = ?engine.host_support(), "engine ready");

    let done = |result: anyhow::Result<()>| result.map(|()| ExitCode::SUCCESS);
    match cli.command {
        Command::Run(args) => run::execute(args, &engine),
        Command::Ps(args) => done(ps::execute(&args, &engine)),
        Command::Logs(args) => done(logs::execute(&args, &engine)),
        Command::Rm(args) => done(rm::execute(&args, &engine)),
        Command::Diff(args) => done(diff::execute(&args, &engine)),
    }
}
