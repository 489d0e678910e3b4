//! `strata rm`: Remove stopped containers and their files.

use clap::Args;
use strata_common::types::ContainerId;
use strata_runtime::Engine;

/// Arguments for the `rm` command.
#[derive(Args, Debug)]
pub struct RmArgs {
    /// Container IDs to remove.
    #[arg(required = true)]
    pub containers: Vec<String>,
}

/// Executes the `rm` command.
///
/// Every container is attempted; the first failure is reported after the
/// rest have been processed.
///
/// # Errors
///
/// Returns an error if any container is unknown, still running or its
/// resources cannot be released.
pub fn execute(args: &RmArgs, engine: &Engine) -> anyhow::Result<()> {
    let mut first_error = None;
    for name in &args.containers {
        let id = ContainerId::new(name);
        match engine.remove(&id) {
            Ok(()) => println!("{id}"),
            Err(e) => {
                eprintln!("cannot remove {id}: {e}");
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
    }
    first_error.map_or(Ok(()), |e| Err(e.into()))
}
