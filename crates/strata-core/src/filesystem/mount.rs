//! Mount helpers for the container's init process.
//!
//! Everything here runs between `clone(2)` and `execve(2)`.

use std::path::Path;

use nix::errno::Errno;
use nix::mount::{MsFlags, mount};
use nix::sys::stat::Mode;

/// Bind-mounts `source` onto `target`, recursively.
///
/// # Errors
///
/// Returns the `errno` of the failed `mount(2)`.
pub fn bind_mount(source: &Path, target: &Path) -> nix::Result<()> {
    mount(
        Some(source),
        target,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None::<&str>,
    )
}

/// Mounts a fresh `proc` at `target`, normally `<new root>/proc`.
///
/// Must run before the root rebase detaches the old root: in a mount
/// namespace owned by a new user namespace the kernel only allows a `proc`
/// mount while a fully visible `proc` is still mounted in that namespace.
/// The recursive bind of the new root carries this mount along.
///
/// # Errors
///
/// Returns the `errno` of the failed `mkdir(2)` or `mount(2)`.
pub fn mount_proc(target: &Path) -> nix::Result<()> {
    match nix::unistd::mkdir(target, Mode::from_bits_truncate(0o555)) {
        Ok(()) | Err(Errno::EEXIST) => {}
        Err(e) => return Err(e),
    }
    mount(
        Some("proc"),
        target,
        Some("proc"),
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
        None::<&str>,
    )
}
