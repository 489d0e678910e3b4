//! User namespace identity mapping.
//!
//! Maps container UIDs/GIDs onto host IDs. The maps are written by the
//! runtime from outside the namespace while the child waits on the
//! handshake pipe.

use std::io::ErrorKind;
use std::path::Path;

use strata_common::error::{Result, StrataError};
use strata_common::types::UserMapping;

/// Writes `uid_map` and `gid_map` for the process `pid`.
///
/// An unprivileged writer must deny `setgroups` before writing `gid_map`;
/// root keeps `setgroups` available to the container.
///
/// # Errors
///
/// Returns [`StrataError::Privilege`] if the kernel refuses the mapping
/// (for example, an unprivileged runtime mapping IDs it does not own).
pub fn write_id_maps(pid: u32, mapping: &UserMapping) -> Result<()> {
    let proc_dir = Path::new("/proc").join(pid.to_string());
    let deny_setgroups = !nix::unistd::geteuid().is_root();
    write_maps_at(&proc_dir, mapping, deny_setgroups)?;
    tracing::debug!(
        pid,
        uid_map = %mapping.uid.to_map_line(),
        gid_map = %mapping.gid.to_map_line(),
        "wrote UID/GID map"
    );
    Ok(())
}

fn write_maps_at(proc_dir: &Path, mapping: &UserMapping, deny_setgroups: bool) -> Result<()> {
    if deny_setgroups {
        let setgroups = proc_dir.join("setgroups");
        if setgroups.exists() {
            write_map_file(&setgroups, "deny")?;
        }
    }
    write_map_file(&proc_dir.join("uid_map"), &mapping.uid.to_map_line())?;
    write_map_file(&proc_dir.join("gid_map"), &mapping.gid.to_map_line())
}

fn write_map_file(path: &Path, content: &str) -> Result<()> {
    std::fs::write(path, content).map_err(|e| match e.kind() {
        ErrorKind::PermissionDenied => StrataError::Privilege {
            message: format!("kernel refused {}: {e}", path.display()),
        },
        _ => StrataError::io(path, e),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_common::types::IdMapping;

    fn mapping() -> UserMapping {
        UserMapping {
            uid: IdMapping {
                container_id: 0,
                host_id: 100_000,
                size: 65_536,
            },
            gid: IdMapping {
                container_id: 0,
                host_id: 200_000,
                size: 1,
            },
        }
    }

    #[test]
    fn maps_are_written_per_id_kind() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("setgroups"), "allow").unwrap();
        write_maps_at(dir.path(), &mapping(), true).unwrap();
        let read = |name: &str| std::fs::read_to_string(dir.path().join(name)).unwrap();
        assert_eq!(read("uid_map"), "0 100000 65536");
        assert_eq!(read("gid_map"), "0 200000 1");
        assert_eq!(read("setgroups"), "deny");
    }

    #[test]
    fn privileged_writer_keeps_setgroups() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("setgroups"), "allow").unwrap();
        write_maps_at(dir.path(), &mapping(), false).unwrap();
        assert_eq!(
            std::fs::read_to_string(dir.path().join("setgroups")).unwrap(),
            "allow"
        );
    }
}
