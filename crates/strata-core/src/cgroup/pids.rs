//! Process-count control via cgroups v2.

use std::path::Path;

use strata_common::error::Result;

use super::{read_single_value, write_control};

/// Caps the number of processes and threads in the group.
///
/// `fork` and `clone` fail with `EAGAIN` once the cap is reached.
///
/// # Errors
///
/// Returns an error if writing to `pids.max` fails.
pub fn set_pids_max(group: &Path, max: u64) -> Result<()> {
    write_control(group, "pids.max", &max.to_string())?;
    tracing::debug!(max, "process limit set");
    Ok(())
}

/// Live processes and threads in the group.
///
/// # Errors
///
/// Returns an error if `pids.current` exists but cannot be parsed.
pub fn pids_current(group: &Path) -> Result<Option<u64>> {
    read_single_value(group, "pids.current")
}
