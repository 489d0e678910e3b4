//! System-wide constants and default paths.

/// Default runtime-owned directory for container state on Linux with root access.
pub const DEFAULT_DATA_DIR: &str = "/var/lib/strata";

/// Cgroups v2 unified hierarchy mount point.
pub const CGROUP_V2_PATH: &str = "/sys/fs/cgroup";

/// Default parent group under which every container group is created.
pub const DEFAULT_CGROUP_ROOT: &str = "/sys/fs/cgroup/strata";

/// Subdirectory of the data directory holding one directory per container.
pub const CONTAINERS_DIR: &str = "containers";

/// Writable (upper) layer directory name inside a container directory.
pub const UPPER_DIR: &str = "upper";

/// Overlay work directory name inside a container directory.
pub const WORK_DIR: &str = "work";

/// Merged view mount point name inside a container directory.
pub const MERGED_DIR: &str = "merged";

/// Persisted container record file name.
pub const STATE_FILE: &str = "state.json";

/// Container output file name used with [`crate::types::Stdio::Log`].
pub const LOG_FILE: &str = "container.log";

/// Maximum number of read-only layers in one merged view.
pub const MAX_LAYERS: usize = 128;

/// Upper bound on the overlay mount option string (one page).
pub const MAX_MOUNT_OPTIONS_LEN: usize = 4096;

/// Longest hostname accepted by `sethostname(2)`.
pub const MAX_HOSTNAME_LEN: usize = 64;

/// Lowest and highest values accepted by `cpu.weight`.
pub const CPU_WEIGHT_RANGE: (u64, u64) = (1, 10_000);

/// Lowest and highest `cpu.max` period in microseconds.
pub const CPU_PERIOD_RANGE_US: (u64, u64) = (1_000, 1_000_000);

/// `PATH` searched for the entrypoint when the spec does not set one.
pub const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Seconds between `SIGTERM` and `SIGKILL` when destroying a running container.
pub const DEFAULT_STOP_GRACE_SECS: u64 = 5;

/// Seconds to wait for a `SIGKILL`ed container before reporting an internal error.
pub const DEFAULT_KILL_TIMEOUT_SECS: u64 = 5;
