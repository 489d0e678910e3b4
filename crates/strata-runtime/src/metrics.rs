//! Resource usage snapshots.
//!
//! Reads the resource group's control files to report memory, CPU and
//! process-count usage of a container.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strata_common::types::ContainerId;
use strata_core::cgroup::GroupStats;

/// Snapshot of a container's resource usage.
///
/// Counters are `None` when the backing controller is not enabled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Container this snapshot belongs to.
    pub container_id: ContainerId,
    /// When the counters were read.
    pub timestamp: DateTime<Utc>,
    /// Memory charged to the group, in bytes.
    pub memory_usage_bytes: Option<u64>,
    /// Peak memory charged to the group, in bytes.
    pub memory_peak_bytes: Option<u64>,
    /// Processes killed by the group's OOM killer.
    pub oom_kills: Option<u64>,
    /// CPU time consumed, in microseconds.
    pub cpu_usage_usec: Option<u64>,
    /// Live processes and threads.
    pub pids_current: Option<u64>,
}

impl MetricsSnapshot {
    /// Builds a snapshot from raw group counters.
    #[must_use]
    pub fn from_stats(container_id: ContainerId, stats: GroupStats) -> Self {
        Self {
            container_id,
            timestamp: Utc::now(),
            memory_usage_bytes: stats.memory_current,
            memory_peak_bytes: stats.memory_peak,
            oom_kills: stats.oom_kills,
            cpu_usage_usec: stats.cpu_usage_usec,
            pids_current: stats.pids_current,
        }
    }
}
