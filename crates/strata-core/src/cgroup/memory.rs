//! Memory resource control via cgroups v2.
//!
//! Manages `memory.max` and `memory.swap.max`, and reads the group's
//! usage and out-of-memory counters.

use std::path::Path;

use strata_common::error::Result;

use super::{read_keyed_value, read_single_value, write_control};

/// Sets the hard memory ceiling in bytes.
///
/// Exceeding it invokes the group's OOM killer.
///
/// # Errors
///
/// Returns an error if writing to `memory.max` fails.
pub fn set_memory_max(group: &Path, bytes: u64) -> Result<()> {
    write_control(group, "memory.max", &bytes.to_string())?;
    tracing::debug!(bytes, "memory limit set");
    Ok(())
}

/// Forbids swapping so the memory ceiling is a real ceiling.
///
/// No-op on hosts without swap accounting.
///
/// # Errors
///
/// Returns an error if `memory.swap.max` exists but cannot be written.
pub fn disable_swap(group: &Path) -> Result<()> {
    if group.join("memory.swap.max").exists() {
        write_control(group, "memory.swap.max", "0")?;
    }
    Ok(())
}

/// Number of processes killed by the group's OOM killer.
///
/// # Errors
///
/// Returns an error if `memory.events` exists but cannot be read.
pub fn oom_kill_count(group: &Path) -> Result<Option<u64>> {
    read_keyed_value(group, "memory.events", "oom_kill")
}

/// Bytes currently charged to the group.
///
/// # Errors
///
/// Returns an error if `memory.current` exists but cannot be parsed.
pub fn memory_current(group: &Path) -> Result<Option<u64>> {
    read_single_value(group, "memory.current")
}

/// Peak bytes charged to the group.
///
/// # Errors
///
/// Returns an error if `memory.peak` exists but cannot be parsed.
pub fn memory_peak(group: &Path) -> Result<Option<u64>> {
    read_single_value(group, "memory.peak")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn swap_is_disabled_only_when_accounted() {
        let dir = tempfile::tempdir().unwrap();
        disable_swap(dir.path()).unwrap();
        assert!(!dir.path().join("memory.swap.max").exists());

        std::fs::write(dir.path().join("memory.swap.max"), "max").unwrap();
        disable_swap(dir.path()).unwrap();
        assert_eq!(
            std::fs::read_to_string(dir.path().join("memory.swap.max")).unwrap(),
            "0"
        );
    }

    #[test]
    fn oom_kill_count_reads_events() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("memory.events"),
            "low 0\nhigh 0\nmax 12\noom 2\noom_kill 2\noom_group_kill 0\n",
        )
        .unwrap();
        assert_eq!(oom_kill_count(dir.path()).unwrap(), Some(2));
    }
}
