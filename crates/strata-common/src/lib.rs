//! # strata-common
//!
//! Shared types, the container specification, the error taxonomy,
//! configuration models, and constants used across the strata workspace.
//!
//! This crate is the leaf of the dependency graph: it depends on no other
//! internal crate and touches no kernel state.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod config;
pub mod constants;
pub mod error;
pub mod spec;
pub mod types;
