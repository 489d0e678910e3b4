//! Container log management.
//!
//! With [`Stdio::Log`](strata_common::types::Stdio::Log) the entrypoint's
//! stdout and stderr are appended to `container.log` in the container
//! directory.

use std::path::{Path, PathBuf};

use strata_common::constants::LOG_FILE;
use strata_common::error::{Result, StrataError};

/// Returns the log file path for a container directory.
#[must_use]
pub fn log_path(container_dir: &Path) -> PathBuf {
    container_dir.join(LOG_FILE)
}

/// Reads container logs from disk.
///
/// Returns an empty string if the log file does not exist yet.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be read.
pub fn read_logs(container_dir: &Path) -> Result<String> {
    let path = log_path(container_dir);
    match std::fs::read(&path) {
        Ok(bytes) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(StrataError::io(path, e)),
    }
}

/// Returns the last `lines` lines of the container log.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be read.
pub fn tail_logs(container_dir: &Path, lines: usize) -> Result<String> {
    let content = read_logs(container_dir)?;
    let all: Vec<&str> = content.lines().collect();
    let start = all.len().saturating_sub(lines);
    Ok(all[start..].iter().map(|l| format!("{l}\n")).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_path_is_inside_container_dir() {
        let p = log_path(Path::new("/var/lib/strata/containers/abc"));
        assert_eq!(p, PathBuf::from("/var/lib/strata/containers/abc/container.log"));
    }

    #[test]
    fn read_logs_missing_file_returns_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let content = read_logs(dir.path()).expect("should succeed");
        assert!(content.is_empty());
    }

    #[test]
    fn tail_keeps_last_lines() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(log_path(dir.path()), "one\ntwo\nthree\n").unwrap();
        assert_eq!(tail_logs(dir.path(), 2).unwrap(), "two\nthree\n");
        assert_eq!(tail_logs(dir.path(), 10).unwrap(), "one\ntwo\nthree\n");
    }

    #[test]
    fn invalid_utf8_is_replaced() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(log_path(dir.path()), [b'o', b'k', 0xff, b'\n']).unwrap();
        assert!(read_logs(dir.path()).unwrap().starts_with("ok"));
    }
}
