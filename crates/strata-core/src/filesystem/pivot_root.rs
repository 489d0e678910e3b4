//! Root filesystem switching for the container's init process.
//!
//! With a private mount namespace the root is switched with `pivot_root(2)`,
//! which replaces the root mount so the old root can be detached entirely.
//! Without one, `chroot(2)` is the only option and only changes this
//! process's view of `/`.

use std::path::Path;

use nix::mount::{MntFlags, umount2};
use nix::unistd::{chdir, chroot};

use super::mount::bind_mount;

/// Makes `new_root` the process's filesystem root.
///
/// In a mount namespace the new root is bind-mounted onto itself (so it is
/// a mount point), pivoted with the `pivot_root(".", ".")` idiom, and the
/// old root stacked beneath it is lazily detached. Runs in the container's
/// init process.
///
/// # Errors
///
/// Returns the `errno` of the first failed syscall.
pub fn rebase_root(new_root: &Path, mount_namespace: bool) -> nix::Result<()> {
    if !mount_namespace {
        chroot(new_root)?;
        return chdir("/");
    }
    bind_mount(new_root, new_root)?;
    chdir(new_root)?;
    nix::unistd::pivot_root(".", ".")?;
    umount2(".", MntFlags::MNT_DETACH)?;
    chdir("/")
}
