//! Domain primitive types used across the strata workspace.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Unique identifier for a container instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContainerId(String);

impl ContainerId {
    /// Creates a new container ID from a string value.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a random container ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    /// Returns the inner string representation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns whether the ID is safe to use as a single path component.
    #[must_use]
    pub fn is_path_safe(&self) -> bool {
        !self.0.is_empty()
            && self.0 != "."
            && self.0 != ".."
            && self
                .0
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Content or sequence key identifying a read-only layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LayerId(String);

impl LayerId {
    /// Creates a layer ID from a string value.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the inner string representation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A read-only directory tree supplied by the image collaborator.
///
/// Layers are shared by any number of containers and never written to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Layer {
    /// Layer key.
    pub id: LayerId,
    /// Local directory holding the layer's tree.
    pub path: PathBuf,
}

impl Layer {
    /// Creates a layer reference.
    #[must_use]
    pub fn new(id: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            id: LayerId::new(id),
            path: path.into(),
        }
    }
}

/// CPU bound for a resource group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CpuLimit {
    /// Relative weight under contention (`cpu.weight`, 1-10000).
    Weight(u64),
    /// Hard bandwidth cap: `quota_us` of CPU time per `period_us` window (`cpu.max`).
    Quota {
        /// Allowed CPU time per period, in microseconds.
        quota_us: u64,
        /// Accounting period, in microseconds.
        period_us: u64,
    },
}

/// Resource limits for a container. Unset fields inherit the ambient limit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Memory ceiling in bytes (`memory.max`).
    pub memory_bytes: Option<u64>,
    /// CPU weight or quota.
    pub cpu: Option<CpuLimit>,
    /// Maximum number of processes and threads (`pids.max`).
    pub max_processes: Option<u64>,
}

impl ResourceLimits {
    /// Returns whether no limit is set.
    #[must_use]
    pub const fn is_unbounded(&self) -> bool {
        self.memory_bytes.is_none() && self.cpu.is_none() && self.max_processes.is_none()
    }
}

/// One kind of namespace isolation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Facet {
    /// Process-ID namespace.
    Pid,
    /// Network stack namespace.
    Network,
    /// Mount table namespace.
    Mount,
    /// Hostname and domain name (UTS) namespace.
    Hostname,
    /// System V IPC and POSIX message queue namespace.
    Ipc,
    /// User and group identity mapping namespace.
    User,
}

impl Facet {
    /// Every facet, in creation order.
    pub const ALL: [Self; 6] = [
        Self::User,
        Self::Pid,
        Self::Mount,
        Self::Network,
        Self::Hostname,
        Self::Ipc,
    ];

    /// Name of the facet's entry under `/proc/<pid>/ns/`.
    #[must_use]
    pub const fn proc_ns_name(self) -> &'static str {
        match self {
            Self::Pid => "pid",
            Self::Network => "net",
            Self::Mount => "mnt",
            Self::Hostname => "uts",
            Self::Ipc => "ipc",
            Self::User => "user",
        }
    }
}

impl fmt::Display for Facet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.proc_ns_name())
    }
}

/// A set of isolation facets: requested by a spec or granted by the host.
#[allow(clippy::struct_excessive_bools)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct IsolationFacets {
    /// Isolate the PID namespace.
    pub pid: bool,
    /// Isolate the network namespace.
    pub network: bool,
    /// Isolate the mount namespace.
    pub mount: bool,
    /// Isolate the UTS (hostname) namespace.
    pub hostname: bool,
    /// Isolate the IPC namespace.
    pub ipc: bool,
    /// Create a user namespace with identity mapping.
    pub user: bool,
}

impl IsolationFacets {
    /// The empty set.
    #[must_use]
    pub const fn none() -> Self {
        Self {
            pid: false,
            network: false,
            mount: false,
            hostname: false,
            ipc: false,
            user: false,
        }
    }

    /// Every facet.
    #[must_use]
    pub const fn all() -> Self {
        Self {
            pid: true,
            network: true,
            mount: true,
            hostname: true,
            ipc: true,
            user: true,
        }
    }

    /// Returns whether `facet` is in the set.
    #[must_use]
    pub const fn contains(&self, facet: Facet) -> bool {
        match facet {
            Facet::Pid => self.pid,
            Facet::Network => self.network,
            Facet::Mount => self.mount,
            Facet::Hostname => self.hostname,
            Facet::Ipc => self.ipc,
            Facet::User => self.user,
        }
    }

    /// Adds or removes `facet`.
    pub const fn set(&mut self, facet: Facet, enabled: bool) {
        match facet {
            Facet::Pid => self.pid = enabled,
            Facet::Network => self.network = enabled,
            Facet::Mount => self.mount = enabled,
            Facet::Hostname => self.hostname = enabled,
            Facet::Ipc => self.ipc = enabled,
            Facet::User => self.user = enabled,
        }
    }

    /// Facets present in the set, in creation order.
    pub fn iter(&self) -> impl Iterator<Item = Facet> + '_ {
        Facet::ALL.into_iter().filter(|f| self.contains(*f))
    }

    /// Facets in `self` but not in `other`.
    #[must_use]
    pub fn missing_from(&self, other: &Self) -> Vec<Facet> {
        self.iter().filter(|f| !other.contains(*f)).collect()
    }

    /// Facets present in both sets.
    #[must_use]
    pub fn intersection(&self, other: &Self) -> Self {
        let mut out = Self::none();
        for facet in self.iter().filter(|f| other.contains(*f)) {
            out.set(facet, true);
        }
        out
    }

    /// Returns whether the set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }
}

impl fmt::Display for IsolationFacets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("none");
        }
        let names: Vec<_> = self.iter().map(Facet::proc_ns_name).collect();
        f.write_str(&names.join(","))
    }
}

/// What to do when the host cannot grant every requested facet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FacetPolicy {
    /// Fail with a privilege error.
    #[default]
    Strict,
    /// Continue with the facets the host can grant and report them.
    BestEffort,
}

/// A contiguous range of IDs mapped into a user namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdMapping {
    /// First ID inside the container.
    pub container_id: u32,
    /// First ID on the host.
    pub host_id: u32,
    /// Number of IDs in the range.
    pub size: u32,
}

impl IdMapping {
    /// Formats the mapping as one line of `uid_map`/`gid_map`.
    #[must_use]
    pub fn to_map_line(&self) -> String {
        format!("{} {} {}", self.container_id, self.host_id, self.size)
    }
}

/// UID and GID mappings for the user facet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserMapping {
    /// UID range.
    pub uid: IdMapping,
    /// GID range.
    pub gid: IdMapping,
}

/// Where the entrypoint's standard streams go.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stdio {
    /// Inherit the runtime's stdin, stdout and stderr.
    #[default]
    Inherit,
    /// Write stdout and stderr to the container log file; stdin is `/dev/null`.
    Log,
}

/// Ordered steps the container's init process runs between clone and exec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SetupStep {
    /// Creating the namespaces (the clone itself).
    Namespaces,
    /// Waiting for the runtime to finish identity mapping and group attach.
    AwaitRuntime,
    /// Redirecting standard streams.
    Stdio,
    /// Setting the private hostname.
    Hostname,
    /// Bringing up loopback in the new network namespace.
    Loopback,
    /// Mounting a fresh `/proc` for the new PID namespace.
    ProcMount,
    /// Rebasing the filesystem root onto the merged view.
    RootRebase,
    /// Switching to the mapped container identity inside a user namespace.
    Identity,
    /// Replacing the process image with the entrypoint.
    Exec,
}

impl SetupStep {
    /// Every step, in execution order.
    pub const ORDER: [Self; 9] = [
        Self::Namespaces,
        Self::AwaitRuntime,
        Self::Stdio,
        Self::Hostname,
        Self::Loopback,
        Self::ProcMount,
        Self::RootRebase,
        Self::Identity,
        Self::Exec,
    ];

    /// Wire code used by the child's failure report.
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::Namespaces => 0,
            Self::AwaitRuntime => 1,
            Self::Stdio => 2,
            Self::Hostname => 3,
            Self::Loopback => 4,
            Self::ProcMount => 5,
            Self::RootRebase => 6,
            Self::Identity => 7,
            Self::Exec => 8,
        }
    }

    /// Inverse of [`SetupStep::code`].
    #[must_use]
    pub fn from_code(code: u8) -> Option<Self> {
        Self::ORDER.into_iter().find(|s| s.code() == code)
    }
}

impl fmt::Display for SetupStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Namespaces => "namespace creation",
            Self::AwaitRuntime => "runtime handshake",
            Self::Identity => "identity switch",
            Self::Stdio => "stdio redirection",
            Self::Hostname => "hostname",
            Self::Loopback => "loopback setup",
            Self::RootRebase => "root rebase",
            Self::ProcMount => "proc mount",
            Self::Exec => "exec",
        };
        f.write_str(s)
    }
}

/// Why a container ended in [`ContainerState::Failed`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum FailureReason {
    /// A setup step failed before the container reached `Running`.
    Setup {
        /// Human-readable description of the setup error.
        message: String,
    },
    /// The group's out-of-memory killer terminated the workload.
    OutOfMemory,
    /// The init process died from a signal nobody in the runtime sent.
    Crashed {
        /// Terminating signal number.
        signal: i32,
    },
    /// The init process died from a signal sent by `destroy`.
    Terminated {
        /// Terminating signal number.
        signal: i32,
    },
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Setup { message } => write!(f, "setup failed: {message}"),
            Self::OutOfMemory => write!(f, "killed by out-of-memory enforcement"),
            Self::Crashed { signal } => write!(f, "crashed with signal {signal}"),
            Self::Terminated { signal } => write!(f, "terminated with signal {signal}"),
        }
    }
}

/// Lifecycle state of a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum ContainerState {
    /// The merged view exists; no process has been spawned.
    Created,
    /// The isolated process is running inside its resource group.
    Running,
    /// The process exited on its own.
    Exited {
        /// Exit code.
        code: i32,
    },
    /// Setup failed or the process was killed.
    Failed {
        /// Cause of the failure.
        reason: FailureReason,
    },
}

impl ContainerState {
    /// Returns whether the state is `Exited` or `Failed`.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Exited { .. } | Self::Failed { .. })
    }

    /// Short state name without payload.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Exited { .. } => "exited",
            Self::Failed { .. } => "failed",
        }
    }
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created | Self::Running => f.write_str(self.name()),
            Self::Exited { code } => write!(f, "exited({code})"),
            Self::Failed { reason } => write!(f, "failed({reason})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_unique_and_path_safe() {
        let a = ContainerId::generate();
        let b = ContainerId::generate();
        assert_ne!(a, b);
        assert!(a.is_path_safe());
    }

    #[test]
    fn traversal_ids_are_not_path_safe() {
        assert!(!ContainerId::new("..").is_path_safe());
        assert!(!ContainerId::new("a/b").is_path_safe());
        assert!(!ContainerId::new("").is_path_safe());
    }

    #[test]
    fn facet_set_difference_lists_missing() {
        let requested = IsolationFacets::all();
        let mut granted = IsolationFacets::all();
        granted.set(Facet::User, false);
        granted.set(Facet::Network, false);
        assert_eq!(
            requested.missing_from(&granted),
            vec![Facet::User, Facet::Network]
        );
        assert!(granted.missing_from(&requested).is_empty());
    }

    #[test]
    fn facet_intersection_keeps_common_members() {
        let mut a = IsolationFacets::none();
        a.set(Facet::Pid, true);
        a.set(Facet::Mount, true);
        let mut b = IsolationFacets::none();
        b.set(Facet::Mount, true);
        b.set(Facet::Ipc, true);
        let both = a.intersection(&b);
        assert!(both.mount);
        assert!(!both.pid);
        assert!(!both.ipc);
    }

    #[test]
    fn facet_display_uses_proc_names() {
        let mut f = IsolationFacets::none();
        assert_eq!(f.to_string(), "none");
        f.set(Facet::Pid, true);
        f.set(Facet::Hostname, true);
        assert_eq!(f.to_string(), "pid,uts");
    }

    #[test]
    fn setup_step_codes_roundtrip() {
        for step in SetupStep::ORDER {
            assert_eq!(SetupStep::from_code(step.code()), Some(step));
        }
        assert_eq!(SetupStep::from_code(200), None);
    }

    #[test]
    fn terminal_states() {
        assert!(!ContainerState::Created.is_terminal());
        assert!(!ContainerState::Running.is_terminal());
        assert!(ContainerState::Exited { code: 0 }.is_terminal());
        assert!(
            ContainerState::Failed {
                reason: FailureReason::OutOfMemory
            }
            .is_terminal()
        );
    }

    #[test]
    fn state_display_includes_payload() {
        assert_eq!(ContainerState::Exited { code: 3 }.to_string(), "exited(3)");
        let failed = ContainerState::Failed {
            reason: FailureReason::Crashed { signal: 11 },
        };
        assert!(failed.to_string().contains("signal 11"));
    }

    #[test]
    fn state_serializes_with_tag() {
        let json = serde_json::to_string(&ContainerState::Exited { code: 0 }).unwrap();
        assert_eq!(json, r#"{"state":"exited","code":0}"#);
    }

    #[test]
    fn id_mapping_line_format() {
        let m = IdMapping {
            container_id: 0,
            host_id: 1000,
            size: 1,
        };
        assert_eq!(m.to_map_line(), "0 1000 1");
    }
}
