//! # strata-core
//!
//! Low-level Linux isolation primitives for the strata runtime.
//!
//! This crate provides safe abstractions over:
//! - **Namespaces**: facet probing and negotiation, identity mapping,
//!   hostname, loopback and mount propagation inside a new namespace set.
//! - **Cgroups v2**: resource groups with memory, CPU and process-count limits.
//! - **Filesystem**: `OverlayFS` merged views, root rebasing via `pivot_root`,
//!   and a userspace model of overlay lookup for inspecting writable layers.
//!
//! Functions documented as running in the container's init process are
//! called between `clone(2)` and `execve(2)`: they neither log nor allocate
//! and report failures as a bare [`nix::errno::Errno`].

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

#[cfg(not(target_os = "linux"))]
compile_error!("strata-core requires Linux namespaces, cgroups v2 and OverlayFS");

pub mod cgroup;
pub mod filesystem;
pub mod namespace;
