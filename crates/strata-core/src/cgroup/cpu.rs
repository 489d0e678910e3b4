//! CPU resource control via cgroups v2.
//!
//! Manages `cpu.weight`, `cpu.max` and reads `cpu.stat`.

use std::path::Path;

use strata_common::error::Result;

use super::{read_keyed_value, write_control};

/// Sets the CPU weight for a group.
///
/// Weight is a value between 1 and 10000 that controls the relative
/// share of CPU time the group receives under contention.
///
/// # Errors
///
/// Returns an error if writing to `cpu.weight` fails.
pub fn set_cpu_weight(group: &Path, weight: u64) -> Result<()> {
    write_control(group, "cpu.weight", &weight.to_string())?;
    tracing::debug!(weight, "CPU weight set");
    Ok(())
}

/// Sets the CPU bandwidth limit.
///
/// Writes `quota_us period_us` to `cpu.max`, where `quota_us` is the
/// maximum CPU time allowed per `period_us` window. A quota above the
/// period grants more than one CPU.
///
/// # Errors
///
/// Returns an error if writing to `cpu.max` fails.
pub fn set_cpu_max(group: &Path, quota_us: u64, period_us: u64) -> Result<()> {
    write_control(group, "cpu.max", &format!("{quota_us} {period_us}"))?;
    tracing::debug!(quota_us, period_us, "CPU max quota set");
    Ok(())
}

/// Total CPU time consumed by the group, in microseconds.
///
/// # Errors
///
/// Returns an error if `cpu.stat` exists but cannot be read.
pub fn usage_usec(group: &Path) -> Result<Option<u64>> {
    read_keyed_value(group, "cpu.stat", "usage_usec")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weight_is_written_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        set_cpu_weight(dir.path(), 250).unwrap();
        assert_eq!(std::fs::read_to_string(dir.path().join("cpu.weight")).unwrap(), "250");
    }

    #[test]
    fn usage_missing_stat_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(usage_usec(dir.path()).unwrap(), None);
    }
}
