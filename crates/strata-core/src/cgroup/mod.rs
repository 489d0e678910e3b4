//! Cgroups v2 resource groups.
//!
//! A [`ResourceGroup`] is one directory under the configured group root
//! (by default `/sys/fs/cgroup/strata/<container_id>`) carrying the
//! container's memory, CPU and process-count limits. Enforcement is the
//! kernel's: the group's OOM killer, CPU throttling and `fork` failures.

pub mod cpu;
pub mod memory;
pub mod pids;

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use strata_common::error::{Result, StrataError};
use strata_common::types::{ContainerId, CpuLimit, ResourceLimits};

/// Controllers a group may use. Only the ones backing a requested limit are mandatory.
const CONTROLLERS: [&str; 3] = ["cpu", "memory", "pids"];

/// Poll interval while waiting for a group to drain.
const DRAIN_POLL: Duration = Duration::from_millis(10);

/// Point-in-time usage read from a group's control files.
///
/// Fields are `None` when the corresponding controller is not enabled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GroupStats {
    /// Bytes currently charged to the group.
    pub memory_current: Option<u64>,
    /// Highest charge observed (`memory.peak`, kernel 5.19+).
    pub memory_peak: Option<u64>,
    /// Number of processes the group's OOM killer has terminated.
    pub oom_kills: Option<u64>,
    /// Total CPU time consumed, in microseconds.
    pub cpu_usage_usec: Option<u64>,
    /// Live processes and threads in the group.
    pub pids_current: Option<u64>,
}

/// Handle to one container's resource group.
///
/// Dropping the handle removes the group if it is empty; call
/// [`ResourceGroup::destroy`] to observe the outcome.
#[derive(Debug)]
pub struct ResourceGroup {
    path: PathBuf,
    destroyed: AtomicBool,
}

impl ResourceGroup {
    /// Creates the group `<root>/<container_id>` and applies `limits`.
    ///
    /// Enables the needed controllers on `root` first. If applying a limit
    /// fails, the new directory is removed before the error is returned.
    ///
    /// # Errors
    ///
    /// Returns [`StrataError::Privilege`] if the hierarchy is not writable or
    /// a controller backing a requested limit is unavailable, and
    /// [`StrataError::Internal`] if the group already exists.
    pub fn create(root: &Path, container_id: &ContainerId, limits: &ResourceLimits) -> Result<Self> {
        prepare_root(root, limits)?;

        let path = root.join(container_id.as_str());
        std::fs::create_dir(&path).map_err(|e| match e.kind() {
            ErrorKind::AlreadyExists => StrataError::Internal {
                message: format!("resource group {} already exists", path.display()),
            },
            _ => classify_io(&path, e),
        })?;
        let group = Self {
            path,
            destroyed: AtomicBool::new(false),
        };
        tracing::info!(path = %group.path.display(), "resource group created");

        // On failure `group` is dropped here, which removes the empty directory.
        group.apply_limits(limits)?;
        Ok(group)
    }

    /// Opens an existing group left behind by an earlier runtime process.
    ///
    /// # Errors
    ///
    /// Returns [`StrataError::NotFound`] if the group directory does not exist.
    pub fn open(root: &Path, container_id: &ContainerId) -> Result<Self> {
        let path = root.join(container_id.as_str());
        if !path.is_dir() {
            return Err(StrataError::NotFound {
                kind: "resource group",
                id: container_id.to_string(),
            });
        }
        Ok(Self {
            path,
            destroyed: AtomicBool::new(false),
        })
    }

    /// Path of the group directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes every set limit to the group's control files.
    ///
    /// # Errors
    ///
    /// Returns an error if writing to a control file fails.
    pub fn apply_limits(&self, limits: &ResourceLimits) -> Result<()> {
        if limits.is_unbounded() {
            tracing::debug!(path = %self.path.display(), "no resource limits requested");
            return Ok(());
        }
        if let Some(bytes) = limits.memory_bytes {
            memory::set_memory_max(&self.path, bytes)?;
            memory::disable_swap(&self.path)?;
        }
        match limits.cpu {
            Some(CpuLimit::Weight(weight)) => cpu::set_cpu_weight(&self.path, weight)?,
            Some(CpuLimit::Quota {
                quota_us,
                period_us,
            }) => cpu::set_cpu_max(&self.path, quota_us, period_us)?,
            None => {}
        }
        if let Some(max) = limits.max_processes {
            pids::set_pids_max(&self.path, max)?;
        }
        Ok(())
    }

    /// Moves a process, and every descendant it forks afterwards, into the group.
    ///
    /// # Errors
    ///
    /// Returns an error if writing to `cgroup.procs` fails.
    pub fn attach(&self, pid: u32) -> Result<()> {
        write_control(&self.path, "cgroup.procs", &pid.to_string())?;
        tracing::debug!(pid, path = %self.path.display(), "process attached to resource group");
        Ok(())
    }

    /// Process IDs currently attached to the group.
    ///
    /// A missing group has no processes.
    ///
    /// # Errors
    ///
    /// Returns an error if `cgroup.procs` exists but cannot be read.
    pub fn procs(&self) -> Result<Vec<u32>> {
        let file = self.path.join("cgroup.procs");
        match std::fs::read_to_string(&file) {
            Ok(content) => Ok(content
                .lines()
                .filter_map(|line| line.trim().parse().ok())
                .collect()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(StrataError::io(file, e)),
        }
    }

    /// Sends `SIGKILL` to every process in the group.
    ///
    /// Uses `cgroup.kill` (Linux 5.14+) when present, otherwise signals
    /// each PID listed in `cgroup.procs`.
    ///
    /// # Errors
    ///
    /// Returns an error if the group cannot be read or written.
    pub fn kill_all(&self) -> Result<()> {
        if self.path.join("cgroup.kill").exists() {
            write_control(&self.path, "cgroup.kill", "1")?;
        } else {
            for pid in self.procs()? {
                let raw = i32::try_from(pid).map_err(|_| StrataError::Internal {
                    message: format!("pid {pid} out of range"),
                })?;
                // The process may exit between listing and signalling.
                let _ = nix::sys::signal::kill(
                    nix::unistd::Pid::from_raw(raw),
                    nix::sys::signal::Signal::SIGKILL,
                );
            }
        }
        tracing::info!(path = %self.path.display(), "killed all processes in resource group");
        Ok(())
    }

    /// Waits until no process is attached, up to `timeout`.
    ///
    /// Returns whether the group drained in time.
    ///
    /// # Errors
    ///
    /// Returns an error if `cgroup.procs` cannot be read.
    pub fn drain(&self, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.procs()?.is_empty() {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            std::thread::sleep(DRAIN_POLL);
        }
    }

    /// Reads the group's current usage counters.
    ///
    /// # Errors
    ///
    /// Returns an error if a present control file cannot be read or parsed.
    pub fn stats(&self) -> Result<GroupStats> {
        Ok(GroupStats {
            memory_current: memory::memory_current(&self.path)?,
            memory_peak: memory::memory_peak(&self.path)?,
            oom_kills: memory::oom_kill_count(&self.path)?,
            cpu_usage_usec: cpu::usage_usec(&self.path)?,
            pids_current: pids::pids_current(&self.path)?,
        })
    }

    /// Returns whether [`ResourceGroup::destroy`] has completed.
    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    /// Removes the group.
    ///
    /// Idempotent: succeeds if the group was already removed, by this handle
    /// or externally. Leaves the group untouched while processes are attached.
    ///
    /// # Errors
    ///
    /// Returns [`StrataError::GroupBusy`] if a process is still attached.
    pub fn destroy(&self) -> Result<()> {
        if self.is_destroyed() {
            tracing::debug!(path = %self.path.display(), "resource group already destroyed");
            return Ok(());
        }
        if !self.procs()?.is_empty() {
            return Err(StrataError::GroupBusy {
                path: self.path.clone(),
            });
        }
        match std::fs::remove_dir(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) if e.raw_os_error() == Some(libc::EBUSY) => {
                return Err(StrataError::GroupBusy {
                    path: self.path.clone(),
                });
            }
            Err(e) => return Err(StrataError::io(&self.path, e)),
        }
        self.destroyed.store(true, Ordering::Release);
        tracing::info!(path = %self.path.display(), "resource group destroyed");
        Ok(())
    }
}

impl Drop for ResourceGroup {
    fn drop(&mut self) {
        if !self.is_destroyed() {
            if let Err(e) = self.destroy() {
                tracing::warn!(path = %self.path.display(), error = %e, "leaving resource group behind");
            }
        }
    }
}

/// Creates the group root and enables the controllers its children need.
fn prepare_root(root: &Path, limits: &ResourceLimits) -> Result<()> {
    std::fs::create_dir_all(root).map_err(|e| classify_io(root, e))?;

    let available_file = root.join("cgroup.controllers");
    let available = std::fs::read_to_string(&available_file).map_err(|e| match e.kind() {
        ErrorKind::NotFound => StrataError::Privilege {
            message: format!("{} is not a cgroup v2 group", root.display()),
        },
        _ => classify_io(&available_file, e),
    })?;
    let available: Vec<&str> = available.split_whitespace().collect();

    for required in required_controllers(limits) {
        if !available.contains(&required) {
            return Err(StrataError::Privilege {
                message: format!(
                    "controller '{required}' is not delegated to {}",
                    root.display()
                ),
            });
        }
    }

    let enabled = std::fs::read_to_string(root.join("cgroup.subtree_control")).unwrap_or_default();
    let enabled: Vec<&str> = enabled.split_whitespace().collect();
    let to_enable: Vec<String> = CONTROLLERS
        .iter()
        .filter(|c| available.contains(c) && !enabled.contains(c))
        .map(|c| format!("+{c}"))
        .collect();
    if !to_enable.is_empty() {
        write_control(root, "cgroup.subtree_control", &to_enable.join(" "))?;
    }
    Ok(())
}

/// Controllers that must be available for `limits` to be enforceable.
fn required_controllers(limits: &ResourceLimits) -> Vec<&'static str> {
    let mut required = Vec::new();
    if limits.cpu.is_some() {
        required.push("cpu");
    }
    if limits.memory_bytes.is_some() {
        required.push("memory");
    }
    if limits.max_processes.is_some() {
        required.push("pids");
    }
    required
}

/// Writes `value` to the control file `name` inside `group`.
pub(crate) fn write_control(group: &Path, name: &str, value: &str) -> Result<()> {
    let file = group.join(name);
    std::fs::write(&file, value).map_err(|e| classify_io(&file, e))?;
    tracing::debug!(file = %file.display(), value, "control file written");
    Ok(())
}

/// Reads a single-value control file such as `memory.current`.
///
/// `"max"` and a missing file both read as `None`.
pub(crate) fn read_single_value(group: &Path, name: &str) -> Result<Option<u64>> {
    let file = group.join(name);
    let content = match std::fs::read_to_string(&file) {
        Ok(c) => c,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(StrataError::io(file, e)),
    };
    let value = content.trim();
    if value == "max" {
        return Ok(None);
    }
    value.parse().map(Some).map_err(|_| StrataError::Internal {
        message: format!("unexpected content in {}: {value:?}", file.display()),
    })
}

/// Reads `key` from a flat-keyed control file such as `memory.events`.
pub(crate) fn read_keyed_value(group: &Path, name: &str, key: &str) -> Result<Option<u64>> {
    let file = group.join(name);
    let content = match std::fs::read_to_string(&file) {
        Ok(c) => c,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(StrataError::io(file, e)),
    };
    Ok(content.lines().find_map(|line| {
        let (k, v) = line.split_once(' ')?;
        (k == key).then(|| v.trim().parse().ok()).flatten()
    }))
}

/// Maps permission failures on the hierarchy to privilege errors.
fn classify_io(path: &Path, e: std::io::Error) -> StrataError {
    match e.kind() {
        ErrorKind::PermissionDenied | ErrorKind::ReadOnlyFilesystem => StrataError::Privilege {
            message: format!("cannot write cgroup hierarchy at {}: {e}", path.display()),
        },
        _ => StrataError::io(path, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A directory that looks like a delegated cgroup v2 group.
    fn fake_root(controllers: &str) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("cgroup.controllers"), controllers).unwrap();
        std::fs::write(dir.path().join("cgroup.subtree_control"), "").unwrap();
        dir
    }

    fn read(path: &Path) -> String {
        std::fs::read_to_string(path).unwrap()
    }

    #[test]
    fn create_writes_requested_limits() {
        let root = fake_root("cpu memory pids");
        let limits = ResourceLimits {
            memory_bytes: Some(64 * 1024 * 1024),
            cpu: Some(CpuLimit::Quota {
                quota_us: 50_000,
                period_us: 100_000,
            }),
            max_processes: Some(16),
        };
        let group = ResourceGroup::create(root.path(), &ContainerId::new("c1"), &limits).unwrap();

        assert_eq!(group.path(), root.path().join("c1"));
        assert_eq!(read(&group.path().join("memory.max")), "67108864");
        assert_eq!(read(&group.path().join("cpu.max")), "50000 100000");
        assert_eq!(read(&group.path().join("pids.max")), "16");
        assert_eq!(
            read(&root.path().join("cgroup.subtree_control")),
            "+cpu +memory +pids"
        );
        std::mem::forget(group);
    }

    #[test]
    fn unset_limits_leave_control_files_alone() {
        let root = fake_root("cpu memory pids");
        let group =
            ResourceGroup::create(root.path(), &ContainerId::new("c2"), &ResourceLimits::default())
                .unwrap();
        assert!(!group.path().join("memory.max").exists());
        assert!(!group.path().join("cpu.weight").exists());
        assert!(!group.path().join("pids.max").exists());
        group.destroy().unwrap();
        assert!(!root.path().join("c2").exists());
    }

    #[test]
    fn missing_controller_is_a_privilege_error() {
        let root = fake_root("cpu pids");
        let limits = ResourceLimits {
            memory_bytes: Some(1 << 20),
            ..ResourceLimits::default()
        };
        let err = ResourceGroup::create(root.path(), &ContainerId::new("c3"), &limits).unwrap_err();
        assert!(matches!(err, StrataError::Privilege { .. }), "{err}");
        assert!(!root.path().join("c3").exists());
    }

    #[test]
    fn non_cgroup_root_is_a_privilege_error() {
        let root = tempfile::tempdir().unwrap();
        let err = ResourceGroup::create(root.path(), &ContainerId::new("c4"), &ResourceLimits::default())
            .unwrap_err();
        assert!(matches!(err, StrataError::Privilege { .. }), "{err}");
    }

    #[test]
    fn duplicate_group_is_an_internal_error() {
        let root = fake_root("cpu memory pids");
        std::fs::create_dir(root.path().join("dup")).unwrap();
        let err = ResourceGroup::create(root.path(), &ContainerId::new("dup"), &ResourceLimits::default())
            .unwrap_err();
        assert!(matches!(err, StrataError::Internal { .. }), "{err}");
    }

    #[test]
    fn attach_writes_pid() {
        let root = fake_root("cpu memory pids");
        let group =
            ResourceGroup::create(root.path(), &ContainerId::new("c5"), &ResourceLimits::default())
                .unwrap();
        group.attach(4242).unwrap();
        assert_eq!(group.procs().unwrap(), vec![4242]);
        std::mem::forget(group);
    }

    #[test]
    fn destroy_refuses_while_processes_attached() {
        let root = fake_root("cpu memory pids");
        let group =
            ResourceGroup::create(root.path(), &ContainerId::new("c6"), &ResourceLimits::default())
                .unwrap();
        group.attach(1).unwrap();
        let err = group.destroy().unwrap_err();
        assert!(matches!(err, StrataError::GroupBusy { .. }), "{err}");
        assert!(!group.is_destroyed());
        assert!(group.path().exists());
        std::mem::forget(group);
    }

    #[test]
    fn destroy_is_idempotent() {
        let root = fake_root("cpu memory pids");
        let group =
            ResourceGroup::create(root.path(), &ContainerId::new("c7"), &ResourceLimits::default())
                .unwrap();
        group.destroy().unwrap();
        group.destroy().unwrap();
        assert!(group.is_destroyed());
    }

    #[test]
    fn destroy_after_external_removal_succeeds() {
        let root = fake_root("cpu memory pids");
        std::fs::create_dir(root.path().join("gone")).unwrap();
        let group = ResourceGroup::open(root.path(), &ContainerId::new("gone")).unwrap();
        std::fs::remove_dir(root.path().join("gone")).unwrap();
        group.destroy().unwrap();
    }

    #[test]
    fn open_missing_group_is_not_found() {
        let root = fake_root("cpu memory pids");
        let err = ResourceGroup::open(root.path(), &ContainerId::new("none")).unwrap_err();
        assert!(matches!(err, StrataError::NotFound { .. }));
    }

    #[test]
    fn stats_read_present_counters() {
        let root = fake_root("cpu memory pids");
        let group =
            ResourceGroup::create(root.path(), &ContainerId::new("c8"), &ResourceLimits::default())
                .unwrap();
        std::fs::write(group.path().join("memory.current"), "4096\n").unwrap();
        std::fs::write(
            group.path().join("memory.events"),
            "low 0\nhigh 0\nmax 3\noom 1\noom_kill 1\n",
        )
        .unwrap();
        std::fs::write(
            group.path().join("cpu.stat"),
            "usage_usec 1500\nuser_usec 1000\nsystem_usec 500\n",
        )
        .unwrap();

        let stats = group.stats().unwrap();
        assert_eq!(stats.memory_current, Some(4096));
        assert_eq!(stats.memory_peak, None);
        assert_eq!(stats.oom_kills, Some(1));
        assert_eq!(stats.cpu_usage_usec, Some(1500));
        assert_eq!(stats.pids_current, None);
        std::mem::forget(group);
    }

    #[test]
    fn single_value_max_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("pids.max"), "max\n").unwrap();
        assert_eq!(read_single_value(dir.path(), "pids.max").unwrap(), None);
    }
}
