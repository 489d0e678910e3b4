//! Mount namespace setup.

use nix::mount::{MsFlags, mount};

/// Stops mount events propagating between the new namespace and the host.
///
/// Must run before any mount in the new namespace; otherwise the root
/// rebase and `/proc` mount would leak into shared peers on the host.
///
/// # Errors
///
/// Returns the `errno` of the failed `mount(2)`.
pub fn make_mounts_private() -> nix::Result<()> {
    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        None::<&str>,
    )
}
