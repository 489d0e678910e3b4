//! Persistent container records.
//!
//! Each container directory holds a `state.json` rewritten atomically on
//! every lifecycle transition, so `ps`, `logs`, `diff` and `rm` work from
//! a different runtime process than the one that started the container.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strata_common::constants::STATE_FILE;
use strata_common::error::{Result, StrataError};
use strata_common::types::{ContainerId, ContainerState, IsolationFacets, Layer};

/// Persistent record of one container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerRecord {
    /// Container identifier.
    pub id: ContainerId,
    /// Read-only layers, lowest precedence first.
    pub layers: Vec<Layer>,
    /// Entrypoint command.
    pub command: Vec<String>,
    /// Private hostname, if any.
    pub hostname: Option<String>,
    /// Last observed lifecycle state.
    #[serde(flatten)]
    pub state: ContainerState,
    /// Host PID of the init process while running.
    pub pid: Option<u32>,
    /// Isolation facets actually granted.
    pub granted: IsolationFacets,
    /// Resource group directory.
    pub cgroup_path: PathBuf,
    /// Merged view mount point.
    pub merged_dir: PathBuf,
    /// Writable layer directory.
    pub upper_dir: PathBuf,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Time the init process exec'd.
    pub started_at: Option<DateTime<Utc>>,
    /// Time the init process was reaped.
    pub finished_at: Option<DateTime<Utc>>,
    /// Whether `destroy` released the container's kernel resources.
    #[serde(default)]
    pub destroyed: bool,
}

/// Writes `record` to `<dir>/state.json` via a temporary file and rename.
///
/// # Errors
///
/// Returns an error if the file cannot be written or renamed.
pub fn save(dir: &Path, record: &ContainerRecord) -> Result<()> {
    let path = dir.join(STATE_FILE);
    let tmp = dir.join(format!(".{STATE_FILE}.tmp"));
    let json = serde_json::to_vec_pretty(record)?;
    std::fs::write(&tmp, json).map_err(|e| StrataError::io(&tmp, e))?;
    std::fs::rename(&tmp, &path).map_err(|e| StrataError::io(&path, e))?;
    tracing::debug!(id = %record.id, state = %record.state, "container record saved");
    Ok(())
}

/// Reads `<dir>/state.json`.
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed.
pub fn load(dir: &Path) -> Result<ContainerRecord> {
    let path = dir.join(STATE_FILE);
    let content = std::fs::read(&path).map_err(|e| StrataError::io(&path, e))?;
    Ok(serde_json::from_slice(&content)?)
}

/// Reads every record under `containers_dir`, oldest first.
///
/// Directories without a readable record are skipped with a warning.
///
/// # Errors
///
/// Returns an error if `containers_dir` exists but cannot be listed.
pub fn load_all(containers_dir: &Path) -> Result<Vec<ContainerRecord>> {
    let entries = match std::fs::read_dir(containers_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(StrataError::io(containers_dir, e)),
    };
    let mut records = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| StrataError::io(containers_dir, e))?;
        if !entry.path().is_dir() {
            continue;
        }
        match load(&entry.path()) {
            Ok(record) => records.push(record),
            Err(e) => {
                tracing::warn!(path = %entry.path().display(), error = %e, "skipping unreadable container record");
            }
        }
    }
    records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
    Ok(records)
}
