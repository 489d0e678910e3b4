//! Container handle and lifecycle operations.
//!
//! A [`ContainerHandle`] owns the merged view, the resource group and the
//! init process of one container. Every lifecycle operation goes through
//! one mutex, so `start`, `destroy` and the reaper thread observing the
//! process's exit never act on a resource at the same time.
//!
//! The reaper waits for the init process with `WNOWAIT` and only reaps it
//! while holding the lock. Until then the PID stays a zombie, so `destroy`
//! can signal it without racing PID reuse.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::sys::wait::{Id, WaitPidFlag, WaitStatus, waitid, waitpid};
use nix::unistd::Pid;
use parking_lot::{Condvar, Mutex, MutexGuard};
use strata_common::error::{Result, StrataError};
use strata_common::spec::ContainerSpec;
use strata_common::types::{ContainerId, ContainerState, FailureReason, IsolationFacets};
use strata_core::cgroup::ResourceGroup;
use strata_core::filesystem::layers::{self, Change};
use strata_core::filesystem::overlayfs::{MergedView, WritableLayer};
use strata_core::namespace::user;

use crate::logs;
use crate::metrics::MetricsSnapshot;
use crate::process::{self, SpawnRequest};
use crate::state::{self, ContainerRecord};

/// Progress of the one-time resource release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Teardown {
    Pending,
    InProgress,
    Done,
}

/// Mutable lifecycle state, guarded by [`Inner::lifecycle`].
#[derive(Debug)]
struct Lifecycle {
    state: ContainerState,
    pid: Option<Pid>,
    view: Option<MergedView>,
    group: Option<ResourceGroup>,
    /// Last signal `destroy` sent to the init process.
    stop_signal: Option<Signal>,
    teardown: Teardown,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

impl Lifecycle {
    /// The state `start` is refused in, if any.
    ///
    /// A `Created` container whose view was lost to a failed teardown
    /// cannot start either: there is no root to spawn into.
    fn start_blocker(&self) -> Option<&'static str> {
        if self.teardown != Teardown::Pending {
            return Some("destroyed");
        }
        if self.state != ContainerState::Created {
            return Some(self.state.name());
        }
        if self.view.as_ref().is_none_or(|v| !v.is_mounted()) {
            return Some("unmounted");
        }
        None
    }
}

#[derive(Debug)]
struct Inner {
    id: ContainerId,
    spec: ContainerSpec,
    dir: PathBuf,
    cgroup_root: PathBuf,
    stop_grace: Duration,
    kill_timeout: Duration,
    granted: IsolationFacets,
    created_at: DateTime<Utc>,
    lifecycle: Mutex<Lifecycle>,
    changed: Condvar,
}

/// Shared handle to one container.
///
/// Clones refer to the same container; any clone may `wait` while another
/// calls `destroy`.
#[derive(Debug, Clone)]
pub struct ContainerHandle {
    inner: Arc<Inner>,
}

/// Settings the engine hands to a new handle.
pub(crate) struct HandleParts {
    pub id: ContainerId,
    pub spec: ContainerSpec,
    pub dir: PathBuf,
    pub cgroup_root: PathBuf,
    pub stop_grace: Duration,
    pub kill_timeout: Duration,
    pub granted: IsolationFacets,
    pub view: MergedView,
}

impl ContainerHandle {
    pub(crate) fn new(parts: HandleParts) -> Self {
        let lifecycle = Lifecycle {
            state: ContainerState::Created,
            pid: None,
            view: Some(parts.view),
            group: None,
            stop_signal: None,
            teardown: Teardown::Pending,
            started_at: None,
            finished_at: None,
        };
        Self {
            inner: Arc::new(Inner {
                id: parts.id,
                spec: parts.spec,
                dir: parts.dir,
                cgroup_root: parts.cgroup_root,
                stop_grace: parts.stop_grace,
                kill_timeout: parts.kill_timeout,
                granted: parts.granted,
                created_at: Utc::now(),
                lifecycle: Mutex::new(lifecycle),
                changed: Condvar::new(),
            }),
        }
    }

    /// Container identifier.
    #[must_use]
    pub fn id(&self) -> &ContainerId {
        &self.inner.id
    }

    /// The spec this container was created from.
    #[must_use]
    pub fn spec(&self) -> &ContainerSpec {
        &self.inner.spec
    }

    /// Isolation facets actually granted, which may be fewer than requested
    /// under [`FacetPolicy::BestEffort`](strata_common::types::FacetPolicy::BestEffort).
    #[must_use]
    pub fn granted(&self) -> IsolationFacets {
        self.inner.granted
    }

    /// Runtime-owned directory holding the container's layers and record.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }

    /// Writable layer directory.
    #[must_use]
    pub fn upper_dir(&self) -> PathBuf {
        self.inner.dir.join(strata_common::constants::UPPER_DIR)
    }

    /// Merged view mount point.
    #[must_use]
    pub fn merged_dir(&self) -> PathBuf {
        self.inner.dir.join(strata_common::constants::MERGED_DIR)
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn status(&self) -> ContainerState {
        self.inner.lifecycle.lock().state.clone()
    }

    /// Host PID of the init process while it runs.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.inner
            .lifecycle
            .lock()
            .pid
            .map(|p| p.as_raw().unsigned_abs())
    }

    /// Spawns the isolated process and moves the container to `Running`.
    ///
    /// Creates the resource group, clones the init process into the granted
    /// namespaces, writes identity maps, attaches the process to the group,
    /// and only then lets it run its setup steps and exec. On failure every
    /// resource created by this call is released, the state becomes
    /// `Failed`, and the merged view is left for `destroy`.
    ///
    /// # Errors
    ///
    /// Returns [`StrataError::InvalidState`] unless the container is
    /// `Created`, [`StrataError::Privilege`] if the group or namespaces
    /// cannot be created, [`StrataError::Spawn`] if a setup step failed, and
    /// [`StrataError::EntrypointNotFound`] if the entrypoint does not exist
    /// in the merged view.
    pub fn start(&self) -> Result<()> {
        let inner = &self.inner;
        let mut lc = inner.lifecycle.lock();
        if let Some(state) = lc.start_blocker() {
            return Err(StrataError::InvalidState {
                id: inner.id.to_string(),
                state: state.into(),
                expected: ContainerState::Created.name().into(),
            });
        }

        match inner.spawn_attached() {
            Ok((pid, group)) => {
                lc.pid = Some(pid);
                lc.group = Some(group);
                lc.state = ContainerState::Running;
                lc.started_at = Some(Utc::now());
                inner.persist(&lc);
                tracing::info!(id = %inner.id, pid = pid.as_raw(), granted = %inner.granted, "container started");
            }
            Err(e) => {
                lc.state = ContainerState::Failed {
                    reason: FailureReason::Setup {
                        message: e.to_string(),
                    },
                };
                lc.finished_at = Some(Utc::now());
                inner.persist(&lc);
                let _ = inner.changed.notify_all();
                tracing::warn!(id = %inner.id, error = %e, "container failed to start");
                return Err(e);
            }
        }
        drop(lc);

        let reaper = Arc::clone(&self.inner);
        let spawned = std::thread::Builder::new()
            .name(format!("reaper-{}", inner.id.as_str().chars().take(8).collect::<String>()))
            .spawn(move || reaper.reap());
        if let Err(e) = spawned {
            // Without a reaper nobody would observe the exit; take the container down.
            tracing::error!(id = %inner.id, error = %e, "cannot spawn reaper thread");
            let mut lc = inner.lifecycle.lock();
            if let Some(pid) = lc.pid {
                let _ = kill(pid, Signal::SIGKILL);
                let status = waitpid(pid, None);
                lc.pid = None;
                lc.state = match status {
                    Ok(status) => classify_exit(status, 0, Some(Signal::SIGKILL)),
                    Err(_) => ContainerState::Failed {
                        reason: FailureReason::Terminated {
                            signal: Signal::SIGKILL as i32,
                        },
                    },
                };
                inner.persist(&lc);
                let _ = inner.changed.notify_all();
            }
            return Err(StrataError::Internal {
                message: format!("cannot spawn reaper thread: {e}"),
            });
        }
        Ok(())
    }

    /// Blocks until the container leaves `Running`, or until it is destroyed
    /// if it never started.
    #[must_use]
    pub fn wait(&self) -> ContainerState {
        let mut lc = self.inner.lifecycle.lock();
        while !Self::settled(&lc) {
            self.inner.changed.wait(&mut lc);
        }
        lc.state.clone()
    }

    /// Like [`ContainerHandle::wait`], giving up after `timeout`.
    ///
    /// Returns `None` if the container is still running.
    #[must_use]
    pub fn wait_timeout(&self, timeout: Duration) -> Option<ContainerState> {
        let deadline = Instant::now() + timeout;
        let mut lc = self.inner.lifecycle.lock();
        while !Self::settled(&lc) {
            if self.inner.changed.wait_until(&mut lc, deadline).timed_out() {
                return Self::settled(&lc).then(|| lc.state.clone());
            }
        }
        Some(lc.state.clone())
    }

    /// Non-blocking form of [`ContainerHandle::wait`].
    #[must_use]
    pub fn try_wait(&self) -> Option<ContainerState> {
        let lc = self.inner.lifecycle.lock();
        Self::settled(&lc).then(|| lc.state.clone())
    }

    fn settled(lc: &Lifecycle) -> bool {
        lc.state.is_terminal() || lc.teardown == Teardown::Done
    }

    /// Terminates the process if needed and releases every resource,
    /// keeping the writable layer.
    ///
    /// # Errors
    ///
    /// See [`ContainerHandle::destroy_with`].
    pub fn destroy(&self) -> Result<()> {
        self.destroy_with(WritableLayer::Keep)
    }

    /// Terminates the process if needed and releases every resource.
    ///
    /// A running process gets `SIGTERM`, then `SIGKILL` (for the whole
    /// group) after the grace period. The group is removed before the view
    /// is unmounted. Safe to call repeatedly and concurrently with `wait`:
    /// resources are released exactly once and later calls return `Ok`.
    ///
    /// # Errors
    ///
    /// Returns [`StrataError::Internal`] if the process survives `SIGKILL`
    /// for the kill timeout, and [`StrataError::GroupBusy`] or an I/O error
    /// if a resource cannot be released. A failed call can be retried.
    pub fn destroy_with(&self, mode: WritableLayer) -> Result<()> {
        let inner = &self.inner;
        let mut lc = inner.lifecycle.lock();
        loop {
            match lc.teardown {
                Teardown::Done => {
                    tracing::debug!(id = %inner.id, "container already destroyed");
                    return Ok(());
                }
                Teardown::InProgress => inner.changed.wait(&mut lc),
                Teardown::Pending => break,
            }
        }
        lc.teardown = Teardown::InProgress;

        if lc.state == ContainerState::Running {
            if let Err(e) = inner.terminate(&mut lc) {
                lc.teardown = Teardown::Pending;
                let _ = inner.changed.notify_all();
                return Err(e);
            }
        }

        let group = lc.group.take();
        let view = lc.view.take();
        drop(lc);

        let released = inner.release(group.as_ref(), view.as_ref(), mode);

        let mut lc = inner.lifecycle.lock();
        match released {
            Ok(()) => {
                lc.teardown = Teardown::Done;
                if mode == WritableLayer::Discard {
                    inner.remove_dir();
                } else {
                    inner.persist(&lc);
                }
                tracing::info!(id = %inner.id, state = %lc.state, "container destroyed");
            }
            Err(ref e) => {
                tracing::warn!(id = %inner.id, error = %e, "container teardown incomplete");
                if group.as_ref().is_some_and(|g| !g.is_destroyed()) {
                    lc.group = group;
                }
                if view.as_ref().is_some_and(MergedView::is_mounted) || mode == WritableLayer::Discard {
                    lc.view = view;
                }
                lc.teardown = Teardown::Pending;
            }
        }
        let _ = inner.changed.notify_all();
        released
    }

    /// Resource usage of the container's group.
    ///
    /// # Errors
    ///
    /// Returns [`StrataError::InvalidState`] if the container has no group
    /// (never started, or destroyed).
    pub fn metrics(&self) -> Result<MetricsSnapshot> {
        let lc = self.inner.lifecycle.lock();
        let Some(group) = &lc.group else {
            return Err(StrataError::InvalidState {
                id: self.inner.id.to_string(),
                state: lc.state.name().into(),
                expected: ContainerState::Running.name().into(),
            });
        };
        Ok(MetricsSnapshot::from_stats(
            self.inner.id.clone(),
            group.stats()?,
        ))
    }

    /// Lists the writable layer's changes relative to the read-only layers.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the writable layer cannot be walked.
    pub fn changes(&self) -> Result<Vec<Change>> {
        let lowers: Vec<PathBuf> = self.inner.spec.layers.iter().map(|l| l.path.clone()).collect();
        layers::changes(&lowers, &self.upper_dir())
    }

    /// Captured output of a container started with `Stdio::Log`.
    ///
    /// # Errors
    ///
    /// Returns an error if the log file exists but cannot be read.
    pub fn logs(&self) -> Result<String> {
        logs::read_logs(&self.inner.dir)
    }

    /// Writes the current record to the container directory.
    pub(crate) fn save_record(&self) -> Result<()> {
        let lc = self.inner.lifecycle.lock();
        state::save(&self.inner.dir, &self.inner.record(&lc))
    }
}

impl Inner {
    /// Creates the group, clones the init process, maps identities,
    /// attaches, and releases the child into its setup steps.
    fn spawn_attached(&self) -> Result<(Pid, ResourceGroup)> {
        let group = ResourceGroup::create(&self.cgroup_root, &self.id, &self.spec.limits)?;
        let root = self.dir.join(strata_common::constants::MERGED_DIR);
        let log_path = logs::log_path(&self.dir);
        let pending = process::spawn(&SpawnRequest {
            spec: &self.spec,
            granted: self.granted,
            root: &root,
            log_path: &log_path,
        })?;

        if self.granted.user {
            if let Some(mapping) = &self.spec.user_mapping {
                user::write_id_maps(pending.pid(), mapping)?;
            }
        }
        group.attach(pending.pid())?;
        let pid = pending.release()?;
        Ok((pid, group))
    }

    /// Waits for the init process to exit and records its terminal state.
    fn reap(&self) {
        let Some(pid) = self.lifecycle.lock().pid else {
            return;
        };
        loop {
            match waitid(Id::Pid(pid), WaitPidFlag::WEXITED | WaitPidFlag::WNOWAIT) {
                Ok(_) => break,
                Err(Errno::EINTR) => {}
                Err(e) => {
                    tracing::error!(id = %self.id, pid = pid.as_raw(), error = %e, "waitid failed");
                    break;
                }
            }
        }

        let mut lc = self.lifecycle.lock();
        let status = loop {
            match waitpid(pid, None) {
                Err(Errno::EINTR) => {}
                other => break other,
            }
        };
        let oom_kills = lc
            .group
            .as_ref()
            .and_then(|g| g.stats().ok())
            .and_then(|s| s.oom_kills)
            .unwrap_or(0);
        lc.state = match status {
            Ok(status) => classify_exit(status, oom_kills, lc.stop_signal),
            Err(e) => ContainerState::Failed {
                reason: FailureReason::Setup {
                    message: format!("lost track of init process {pid}: {e}"),
                },
            },
        };
        lc.pid = None;
        lc.finished_at = Some(Utc::now());
        self.persist(&lc);
        let _ = self.changed.notify_all();
        tracing::info!(id = %self.id, state = %lc.state, "container exited");
    }

    /// Stops a running init process, escalating from `SIGTERM` to `SIGKILL`.
    ///
    /// Releases the lock while waiting for the reaper to observe the exit.
    fn terminate(&self, lc: &mut MutexGuard<'_, Lifecycle>) -> Result<()> {
        let Some(pid) = lc.pid else {
            return Ok(());
        };

        lc.stop_signal = Some(Signal::SIGTERM);
        let _ = kill(pid, Signal::SIGTERM);
        tracing::info!(id = %self.id, pid = pid.as_raw(), "sent SIGTERM");
        if self.wait_exit(lc, self.stop_grace) {
            return Ok(());
        }

        lc.stop_signal = Some(Signal::SIGKILL);
        let _ = kill(pid, Signal::SIGKILL);
        if let Some(group) = &lc.group {
            if let Err(e) = group.kill_all() {
                tracing::warn!(id = %self.id, error = %e, "group-wide kill failed");
            }
        }
        tracing::info!(id = %self.id, pid = pid.as_raw(), "sent SIGKILL");
        if self.wait_exit(lc, self.kill_timeout) {
            return Ok(());
        }
        Err(StrataError::Internal {
            message: format!(
                "container {} (pid {pid}) survived SIGKILL for {:?}",
                self.id, self.kill_timeout
            ),
        })
    }

    fn wait_exit(&self, lc: &mut MutexGuard<'_, Lifecycle>, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while lc.state == ContainerState::Running {
            if self.changed.wait_until(lc, deadline).timed_out() {
                break;
            }
        }
        lc.state != ContainerState::Running
    }

    /// Releases the group, then the view. Runs without the lock held.
    fn release(
        &self,
        group: Option<&ResourceGroup>,
        view: Option<&MergedView>,
        mode: WritableLayer,
    ) -> Result<()> {
        if let Some(group) = group {
            if !group.procs()?.is_empty() {
                // Descendants that outlived the init process.
                group.kill_all()?;
                if !group.drain(self.kill_timeout)? {
                    return Err(StrataError::GroupBusy {
                        path: group.path().to_path_buf(),
                    });
                }
            }
            group.destroy()?;
        }
        if let Some(view) = view {
            view.teardown(mode)?;
        }
        Ok(())
    }

    fn record(&self, lc: &Lifecycle) -> ContainerRecord {
        ContainerRecord {
            id: self.id.clone(),
            layers: self.spec.layers.clone(),
            command: self.spec.command.clone(),
            hostname: self.spec.hostname.clone(),
            state: lc.state.clone(),
            pid: lc.pid.map(|p| p.as_raw().unsigned_abs()),
            granted: self.granted,
            cgroup_path: self.cgroup_root.join(self.id.as_str()),
            merged_dir: self.dir.join(strata_common::constants::MERGED_DIR),
            upper_dir: self.dir.join(strata_common::constants::UPPER_DIR),
            created_at: self.created_at,
            started_at: lc.started_at,
            finished_at: lc.finished_at,
            destroyed: lc.teardown == Teardown::Done,
        }
    }

    /// Best-effort record update on a lifecycle transition.
    fn persist(&self, lc: &Lifecycle) {
        if let Err(e) = state::save(&self.dir, &self.record(lc)) {
            tracing::warn!(id = %self.id, error = %e, "cannot persist container record");
        }
    }

    fn remove_dir(&self) {
        match std::fs::remove_dir_all(&self.dir) {
            Ok(()) => tracing::debug!(id = %self.id, "container directory removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(id = %self.id, path = %self.dir.display(), error = %e, "cannot remove container directory");
            }
        }
    }
}

/// Maps the init process's wait status onto a terminal state.
///
/// A kill while the group recorded OOM kills is attributed to memory
/// enforcement unless `destroy` sent a signal; a signal death after
/// `destroy` signalled is a termination; any other signal death is a crash.
pub(crate) fn classify_exit(
    status: WaitStatus,
    oom_kills: u64,
    stop_signal: Option<Signal>,
) -> ContainerState {
    match status {
        WaitStatus::Exited(_, 0) => ContainerState::Exited { code: 0 },
        WaitStatus::Exited(_, _) if oom_kills > 0 => ContainerState::Failed {
            reason: FailureReason::OutOfMemory,
        },
        WaitStatus::Exited(_, code) => ContainerState::Exited { code },
        WaitStatus::Signaled(_, Signal::SIGKILL, _) if oom_kills > 0 && stop_signal.is_none() => {
            ContainerState::Failed {
                reason: FailureReason::OutOfMemory,
            }
        }
        WaitStatus::Signaled(_, signal, _) if stop_signal.is_some() => ContainerState::Failed {
            reason: FailureReason::Terminated {
                signal: signal as i32,
            },
        },
        WaitStatus::Signaled(_, signal, _) => ContainerState::Failed {
            reason: FailureReason::Crashed {
                signal: signal as i32,
            },
        },
        other => ContainerState::Failed {
            reason: FailureReason::Setup {
                message: format!("unexpected wait status {other:?}"),
            },
        },
    }
}
