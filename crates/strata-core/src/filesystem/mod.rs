//! Filesystem management for container isolation.
//!
//! Provides `OverlayFS` merged views, root rebasing for the container's init
//! process, mount helpers, and a userspace model of overlay read resolution
//! used to inspect a container's writable layer.

pub mod layers;
pub mod mount;
pub mod overlayfs;
pub mod pivot_root;
