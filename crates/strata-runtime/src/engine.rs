//! Runtime engine: the narrow command interface used by callers.
//!
//! The engine validates specs, negotiates isolation with the host, and
//! composes merged views. Containers it creates are driven through their
//! [`ContainerHandle`]. Records persisted under the data directory let a
//! later engine list, inspect and garbage-collect containers.

use std::path::{Path, PathBuf};

use nix::sys::signal::kill;
use nix::unistd::Pid;
use strata_common::config::RuntimeConfig;
use strata_common::constants::{MERGED_DIR, UPPER_DIR, WORK_DIR};
use strata_common::error::{Result, StrataError};
use strata_common::spec::ContainerSpec;
use strata_common::types::{ContainerId, ContainerState};
use strata_core::cgroup::ResourceGroup;
use strata_core::filesystem::layers::{self, Change};
use strata_core::filesystem::overlayfs;
use strata_core::namespace::{self, HostSupport};

use crate::container::{ContainerHandle, HandleParts};
use crate::logs;
use crate::state::{self, ContainerRecord};

/// Removes a half-built container directory unless disarmed.
struct DirGuard {
    path: PathBuf,
    armed: bool,
}

impl DirGuard {
    const fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    const fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for DirGuard {
    fn drop(&mut self) {
        if self.armed {
            if let Err(e) = std::fs::remove_dir_all(&self.path) {
                tracing::warn!(path = %self.path.display(), error = %e, "cannot remove partial container directory");
            }
        }
    }
}

/// The runtime engine that coordinates container creation and bookkeeping.
#[derive(Debug, Clone)]
pub struct Engine {
    config: RuntimeConfig,
    host: HostSupport,
}

impl Engine {
    /// Creates an engine, probing the host's namespace support.
    #[must_use]
    pub fn new(config: RuntimeConfig) -> Self {
        Self::with_host_support(config, namespace::probe_available())
    }

    /// Creates an engine with an explicit view of the host's capabilities.
    #[must_use]
    pub const fn with_host_support(config: RuntimeConfig, host: HostSupport) -> Self {
        Self { config, host }
    }

    /// Engine configuration.
    #[must_use]
    pub const fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Host namespace support used for facet negotiation.
    #[must_use]
    pub const fn host_support(&self) -> &HostSupport {
        &self.host
    }

    /// Validates `spec`, composes its merged view and returns a `Created` handle.
    ///
    /// Nothing is spawned. On failure no directory or mount is left behind.
    ///
    /// # Errors
    ///
    /// Returns [`StrataError::Validation`] for a malformed spec,
    /// [`StrataError::Privilege`] if a requested facet cannot be granted
    /// under the spec's facet policy, and [`StrataError::Compose`] if the
    /// merged view cannot be built.
    pub fn create(&self, spec: ContainerSpec) -> Result<ContainerHandle> {
        spec.validate()?;
        let granted = namespace::negotiate(&spec.isolation, &self.host, spec.facet_policy)?;

        let id = ContainerId::generate();
        let dir = self.config.containers_dir().join(id.as_str());
        std::fs::create_dir_all(&dir).map_err(|e| StrataError::io(&dir, e))?;
        let mut guard = DirGuard::new(dir.clone());

        let view = overlayfs::compose_view(
            &spec.layers,
            &dir.join(UPPER_DIR),
            &dir.join(WORK_DIR),
            &dir.join(MERGED_DIR),
        )?;

        let handle = ContainerHandle::new(HandleParts {
            id: id.clone(),
            spec,
            dir,
            cgroup_root: self.config.cgroup_root.clone(),
            stop_grace: self.config.stop_grace_period(),
            kill_timeout: self.config.kill_timeout(),
            granted,
            view,
        });
        handle.save_record()?;
        guard.disarm();

        tracing::info!(id = %id, granted = %granted, "container created");
        Ok(handle)
    }

    /// Persisted records of every container under the data directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the containers directory cannot be listed.
    pub fn list(&self) -> Result<Vec<ContainerRecord>> {
        state::load_all(&self.config.containers_dir())
    }

    /// Loads one container's record.
    ///
    /// # Errors
    ///
    /// Returns [`StrataError::NotFound`] if no such container exists.
    pub fn inspect(&self, id: &ContainerId) -> Result<ContainerRecord> {
        state::load(&self.container_dir(id)?)
    }

    /// Garbage-collects a container whose handle is gone: unmounts a stale
    /// view, removes an empty group and deletes the container directory.
    ///
    /// Not for containers still driven by a live [`ContainerHandle`]; use
    /// [`ContainerHandle::destroy_with`] for those.
    ///
    /// # Errors
    ///
    /// Returns [`StrataError::InvalidState`] if the container's init process
    /// is still alive, [`StrataError::GroupBusy`] if its group still has
    /// processes, and [`StrataError::NotFound`] for an unknown ID.
    pub fn remove(&self, id: &ContainerId) -> Result<()> {
        let dir = self.container_dir(id)?;
        let record = state::load(&dir)?;
        if let Some(pid) = record.pid.filter(|_| record.state == ContainerState::Running) {
            let alive = i32::try_from(pid).is_ok_and(|raw| kill(Pid::from_raw(raw), None).is_ok());
            if alive {
                return Err(StrataError::InvalidState {
                    id: id.to_string(),
                    state: record.state.name().into(),
                    expected: "stopped".into(),
                });
            }
        }

        overlayfs::detach_stale(&record.merged_dir)?;
        match ResourceGroup::open(&self.config.cgroup_root, id) {
            Ok(group) => group.destroy()?,
            Err(StrataError::NotFound { .. }) => {}
            Err(e) => return Err(e),
        }
        std::fs::remove_dir_all(&dir).map_err(|e| StrataError::io(&dir, e))?;
        tracing::info!(id = %id, "container removed");
        Ok(())
    }

    /// Captured output of a container started with `Stdio::Log`.
    ///
    /// # Errors
    ///
    /// Returns [`StrataError::NotFound`] for an unknown ID.
    pub fn logs(&self, id: &ContainerId) -> Result<String> {
        logs::read_logs(&self.container_dir(id)?)
    }

    /// The last `lines` lines of a container's captured output.
    ///
    /// # Errors
    ///
    /// Returns [`StrataError::NotFound`] for an unknown ID.
    pub fn tail_logs(&self, id: &ContainerId, lines: usize) -> Result<String> {
        logs::tail_logs(&self.container_dir(id)?, lines)
    }

    /// Changes in a container's writable layer.
    ///
    /// # Errors
    ///
    /// Returns [`StrataError::NotFound`] for an unknown ID.
    pub fn diff(&self, id: &ContainerId) -> Result<Vec<Change>> {
        let record = self.inspect(id)?;
        let lowers: Vec<PathBuf> = record.layers.iter().map(|l| l.path.clone()).collect();
        layers::changes(&lowers, &record.upper_dir)
    }

    fn container_dir(&self, id: &ContainerId) -> Result<PathBuf> {
        if !id.is_path_safe() {
            return Err(StrataError::Validation {
                message: format!("invalid container id: {id:?}"),
            });
        }
        let dir = self.config.containers_dir().join(id.as_str());
        if !is_dir(&dir) {
            return Err(StrataError::NotFound {
                kind: "container",
                id: id.to_string(),
            });
        }
        Ok(dir)
    }
}

fn is_dir(path: &Path) -> bool {
    path.symlink_metadata().is_ok_and(|m| m.is_dir())
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_common::error::ErrorKind;
    use strata_common::types::{
        CpuLimit, FacetPolicy, IsolationFacets, Layer, ResourceLimits, Stdio,
    };

    fn engine(data_dir: &Path, host: HostSupport) -> Engine {
        let config = RuntimeConfig {
            data_dir: data_dir.to_path_buf(),
            cgroup_root: data_dir.join("cgroup"),
            ..RuntimeConfig::default()
        };
        Engine::with_host_support(config, host)
    }

    fn unprivileged_host() -> HostSupport {
        HostSupport {
            kernel: IsolationFacets::all(),
            privileged: false,
            user_namespaces: false,
        }
    }

    fn spec(layer: &Path) -> ContainerSpec {
        ContainerSpec {
            layers: vec![Layer::new("base", layer)],
            command: vec!["/bin/true".into()],
            env: Vec::new(),
            hostname: None,
            limits: ResourceLimits {
                memory_bytes: Some(1 << 26),
                cpu: Some(CpuLimit::Weight(100)),
                max_processes: None,
            },
            isolation: IsolationFacets {
                pid: true,
                mount: true,
                ..IsolationFacets::none()
            },
            facet_policy: FacetPolicy::Strict,
            user_mapping: None,
            stdio: Stdio::Inherit,
        }
    }

    #[test]
    fn invalid_spec_touches_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut bad = spec(dir.path());
        bad.command.clear();
        let err = engine(dir.path(), unprivileged_host()).create(bad).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(!dir.path().join("containers").exists());
    }

    #[test]
    fn ungrantable_facets_fail_before_allocation() {
        let dir = tempfile::tempdir().unwrap();
        let err = engine(dir.path(), unprivileged_host())
            .create(spec(dir.path()))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Privilege);
        assert!(!dir.path().join("containers").exists());
    }

    #[test]
    fn missing_layer_leaves_no_container_directory() {
        let dir = tempfile::tempdir().unwrap();
        let host = HostSupport {
            kernel: IsolationFacets::all(),
            privileged: true,
            user_namespaces: true,
        };
        let err = engine(dir.path(), host)
            .create(spec(&dir.path().join("no-such-layer")))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Compose);
        let containers = dir.path().join("containers");
        assert_eq!(std::fs::read_dir(&containers).unwrap().count(), 0);
    }

    #[test]
    fn unknown_container_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let e = engine(dir.path(), unprivileged_host());
        let err = e.logs(&ContainerId::new("missing")).unwrap_err();
        assert!(matches!(err, StrataError::NotFound { .. }));
        let err = e.diff(&ContainerId::new("../etc")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn list_without_containers_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(engine(dir.path(), unprivileged_host()).list().unwrap().is_empty());
    }
}
