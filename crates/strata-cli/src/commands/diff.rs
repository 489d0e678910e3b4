//! `strata diff`: Show changes in a container's writable layer.

use clap::Args;
use strata_common::types::ContainerId;
use strata_runtime::Engine;

/// Arguments for the `diff` command.
#[derive(Args, Debug)]
pub struct DiffArgs {
    /// Container ID.
    pub container: String,
}

/// Executes the `diff` command.
///
/// Prints one `A`, `C` or `D` line per added, changed or deleted path.
///
/// # Errors
///
/// Returns an error if the container is not found or its layers are unreadable.
pub fn execute(args: &DiffArgs, engine: &Engine) -> anyhow::Result<()> {
    let changes = engine.diff(&ContainerId::new(&args.container))?;
    for change in &changes {
        println!("{} /{}", change.kind, change.path.display());
    }
    Ok(())
}
