//! Container lifecycle management for the strata runtime.
//!
//! [`engine::Engine`] validates a spec and composes its merged view;
//! [`container::ContainerHandle`] then drives the container through
//! `Created -> Running -> Exited | Failed` and releases every kernel
//! resource exactly once on `destroy`.

#![allow(unsafe_code)]
#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod container;
pub mod engine;
pub mod logs;
pub mod metrics;
mod process;
pub mod state;
mod sync;

pub use container::ContainerHandle;
pub use engine::Engine;
pub use strata_core::filesystem::overlayfs::WritableLayer;
