//! `strata logs`: Print a container's captured output.

use clap::Args;
use strata_common::types::ContainerId;
use strata_runtime::Engine;

/// Arguments for the `logs` command.
#[derive(Args, Debug)]
pub struct LogsArgs {
    /// Container ID.
    pub container: String,

    /// Only print the last N lines.
    #[arg(short = 'n', long)]
    pub tail: Option<usize>,
}

/// Executes the `logs` command.
///
/// # Errors
///
/// Returns an error if the container is not found or its log is unreadable.
pub fn execute(args: &LogsArgs, engine: &Engine) -> anyhow::Result<()> {
    let id = ContainerId::new(&args.container);
    let logs = match args.tail {
        Some(lines) => engine.tail_logs(&id, lines)?,
        None => engine.logs(&id)?,
    };

    if logs.is_empty() {
        println!("No logs available for container: {}", args.container);
    } else {
        print!("{logs}");
    }
    Ok(())
}
