//! Global configuration model for the strata runtime.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants;
use crate::error::{Result, StrataError};

/// Root configuration for the strata runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Runtime-owned directory holding one subdirectory per container.
    pub data_dir: PathBuf,
    /// Parent cgroup under which container groups are created.
    pub cgroup_root: PathBuf,
    /// Seconds between `SIGTERM` and `SIGKILL` when destroying a running container.
    pub stop_grace_period_secs: u64,
    /// Seconds to wait for a killed container to be reaped.
    pub kill_timeout_secs: u64,
}

impl RuntimeConfig {
    /// Loads a configuration file in JSON format.
    ///
    /// Missing fields take their default values.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| StrataError::io(path, e))?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Directory holding per-container state.
    #[must_use]
    pub fn containers_dir(&self) -> PathBuf {
        self.data_dir.join(constants::CONTAINERS_DIR)
    }

    /// Grace period before escalating to `SIGKILL`.
    #[must_use]
    pub const fn stop_grace_period(&self) -> Duration {
        Duration::from_secs(self.stop_grace_period_secs)
    }

    /// Bound on waiting for a killed process to be reaped.
    #[must_use]
    pub const fn kill_timeout(&self) -> Duration {
        Duration::from_secs(self.kill_timeout_secs)
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(constants::DEFAULT_DATA_DIR),
            cgroup_root: PathBuf::from(constants::DEFAULT_CGROUP_ROOT),
            stop_grace_period_secs: constants::DEFAULT_STOP_GRACE_SECS,
            kill_timeout_secs: constants::DEFAULT_KILL_TIMEOUT_SECS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("strata.json");
        std::fs::write(&path, r#"{"data_dir": "/tmp/strata", "stop_grace_period_secs": 1}"#)
            .unwrap();

        let config = RuntimeConfig::load(&path).expect("load");
        assert_eq!(config.data_dir, PathBuf::from("/tmp/strata"));
        assert_eq!(config.stop_grace_period(), Duration::from_secs(1));
        assert_eq!(config.cgroup_root, PathBuf::from(constants::DEFAULT_CGROUP_ROOT));
        assert_eq!(config.containers_dir(), PathBuf::from("/tmp/strata/containers"));
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let err = RuntimeConfig::load(Path::new("/nonexistent/strata.json")).unwrap_err();
        assert!(matches!(err, StrataError::Io { .. }));
    }
}
