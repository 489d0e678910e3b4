//! `strata ps`: List containers known to the runtime.

use clap::Args;
use strata_runtime::Engine;

/// Arguments for the `ps` command.
#[derive(Args, Debug)]
pub struct PsArgs {
    /// Include destroyed containers.
    #[arg(short, long)]
    pub all: bool,

    /// Print records as JSON.
    #[arg(long)]
    pub json: bool,
}

/// Executes the `ps` command.
///
/// # Errors
///
/// Returns an error if the state directory cannot be read.
pub fn execute(args: &PsArgs, engine: &Engine) -> anyhow::Result<()> {
    let records: Vec<_> = engine
        .list()?
        .into_iter()
        .filter(|r| args.all || !r.destroyed)
        .collect();

    if args.json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }

    if records.is_empty() {
        println!("No containers.");
        return Ok(());
    }

    println!(
        "{:<34} {:<28} {:<8} {:<20} COMMAND",
        "CONTAINER ID", "STATE", "PID", "CREATED"
    );
    for record in &records {
        let pid = record.pid.map_or_else(|| "-".into(), |p| p.to_string());
        let state = if record.destroyed {
            format!("{} (destroyed)", record.state.name())
        } else {
            record.state.to_string()
        };
        println!(
            "{:<34} {:<28} {:<8} {:<20} {}",
            record.id,
            state,
            pid,
            record.created_at.format("%Y-%m-%d %H:%M:%S"),
            record.command.join(" "),
        );
    }
    Ok(())
}
