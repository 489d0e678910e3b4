//! UTS namespace setup: the container's private hostname.

/// Sets the hostname of the current UTS namespace.
///
/// Runs in the container's init process.
///
/// # Errors
///
/// Returns the `errno` of the failed `sethostname(2)`.
pub fn set_hostname(name: &str) -> nix::Result<()> {
    nix::unistd::sethostname(name)
}
