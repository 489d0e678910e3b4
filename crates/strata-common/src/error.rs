//! Unified error types for the strata workspace.
//!
//! The variants follow the runtime's error taxonomy: validation, privilege,
//! composition, spawn and internal errors are returned synchronously, while
//! resource-enforcement kills are reported as a terminal container state
//! rather than as an error.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::types::SetupStep;

/// Why composing a merged view failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComposeFailure {
    /// A layer directory does not exist.
    LayerMissing,
    /// A layer directory exists but cannot be read.
    LayerUnreadable,
    /// The writable or work directory is not a fresh, empty directory.
    WritableNotEmpty,
    /// The host or the backing filesystem lacks union-mount support.
    Unsupported,
    /// The mount syscall failed for another reason.
    MountFailed,
}

impl fmt::Display for ComposeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::LayerMissing => "layer missing",
            Self::LayerUnreadable => "layer unreadable",
            Self::WritableNotEmpty => "writable layer not empty",
            Self::Unsupported => "union mount unsupported",
            Self::MountFailed => "mount failed",
        };
        f.write_str(s)
    }
}

/// Coarse classification of an error, for callers that branch on the
/// operator response rather than on the exact variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed or contradictory spec.
    Validation,
    /// The host cannot grant what was requested.
    Privilege,
    /// The merged view could not be built.
    Compose,
    /// Isolation setup failed after the view existed.
    Spawn,
    /// The workload itself is broken (for example, a missing binary).
    Workload,
    /// The operation is not valid in the container's current state.
    State,
    /// The runtime's own bookkeeping is inconsistent.
    Internal,
    /// Plain I/O or serialization failure.
    Io,
}

/// Top-level error type shared across the workspace.
#[derive(Debug, Error)]
pub enum StrataError {
    /// The container spec is malformed or contradictory.
    #[error("invalid container spec: {message}")]
    Validation {
        /// Description of the violated rule.
        message: String,
    },

    /// A requested isolation or resource facet is unavailable with the
    /// host's privilege level. Nothing was allocated.
    #[error("insufficient privilege: {message}")]
    Privilege {
        /// Description of what could not be granted.
        message: String,
    },

    /// The merged view could not be composed.
    #[error("cannot compose merged view ({failure}): {message}")]
    Compose {
        /// Failure category.
        failure: ComposeFailure,
        /// Details, usually including the offending path.
        message: String,
    },

    /// An isolation setup step failed in the container's init process.
    #[error("container setup failed at {step}: {}", os_error(.errno))]
    Spawn {
        /// Step that failed.
        step: SetupStep,
        /// Raw `errno` reported by the failing syscall.
        errno: i32,
    },

    /// The entrypoint binary does not exist inside the merged view.
    #[error("entrypoint not found in container root: {command}")]
    EntrypointNotFound {
        /// Command as given in the spec.
        command: String,
    },

    /// The container is in the wrong state for the requested operation.
    #[error("container '{id}' is in state '{state}', expected '{expected}'")]
    InvalidState {
        /// Container identifier.
        id: String,
        /// Current state.
        state: String,
        /// State the operation requires.
        expected: String,
    },

    /// A resource group still has attached processes.
    #[error("resource group {} still has attached processes", .path.display())]
    GroupBusy {
        /// Path of the group directory.
        path: PathBuf,
    },

    /// The runtime's own bookkeeping is inconsistent.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the inconsistency.
        message: String,
    },

    /// An I/O operation failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path where the I/O error occurred.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A required resource was not found.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Type of the missing resource.
        kind: &'static str,
        /// Identifier of the missing resource.
        id: String,
    },

    /// Serialization or deserialization failed.
    #[error("serialization error: {source}")]
    Serialization {
        /// Underlying serialization error.
        #[from]
        source: serde_json::Error,
    },
}

impl StrataError {
    /// Shorthand for an [`StrataError::Io`] at `path`.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Classifies the error by the operator response it demands.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation { .. } => ErrorKind::Validation,
            Self::Privilege { .. } => ErrorKind::Privilege,
            Self::Compose { .. } => ErrorKind::Compose,
            Self::Spawn { .. } => ErrorKind::Spawn,
            Self::EntrypointNotFound { .. } => ErrorKind::Workload,
            Self::InvalidState { .. } | Self::GroupBusy { .. } => ErrorKind::State,
            Self::Internal { .. } => ErrorKind::Internal,
            Self::Io { .. } | Self::NotFound { .. } | Self::Serialization { .. } => ErrorKind::Io,
        }
    }
}

fn os_error(errno: &i32) -> std::io::Error {
    std::io::Error::from_raw_os_error(*errno)
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, StrataError>;
