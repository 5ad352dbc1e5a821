//! Error types for depot
//!
//! This module defines the common error types used throughout the system.

use std::path::PathBuf;
use thiserror::Error;

/// Common result type for depot operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for depot
#[derive(Debug, Error)]
pub enum Error {
    /// Entry or sidecar absent at the probed location.
    #[error("file not found: {}", .path.display())]
    NotFound { path: PathBuf },

    /// An inode is already present at the target path (create, move, link).
    #[error("file already exists: {}", .path.display())]
    FileExists { path: PathBuf },

    /// State gate rejected the operation.
    ///
    /// The `"failed to perform"` Display prefix is a stable contract
    /// with existing call sites.
    #[error("failed to perform \"{op}\" on {name}: file in state {current}, accepted states {accepted:?}")]
    FileState {
        op: &'static str,
        name: String,
        current: String,
        accepted: Vec<String>,
    },

    /// Name violates the path layout's precondition.
    #[error("invalid file name: {name}")]
    InvalidName { name: String },

    /// The same name is present in more than one state on disk.
    #[error("file {name} found in multiple states: {states:?}")]
    Corrupt { name: String, states: Vec<String> },

    /// Byte range lies outside the current sidecar content.
    #[error("metadata range out of bounds: offset {offset} + len {len} exceeds size {size}")]
    OutOfRange { offset: u64, len: usize, size: usize },

    /// Underlying filesystem error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Build a `NotFound` for the given path.
    pub fn not_found(path: impl Into<PathBuf>) -> Self {
        Self::NotFound { path: path.into() }
    }

    /// Build a `FileExists` for the given path.
    pub fn exists(path: impl Into<PathBuf>) -> Self {
        Self::FileExists { path: path.into() }
    }

    /// Check if this is a not found error
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Check if this is an already-exists error
    #[must_use]
    pub fn is_exists(&self) -> bool {
        matches!(self, Self::FileExists { .. })
    }

    /// Check if this is a state-gate rejection
    #[must_use]
    pub fn is_file_state_error(&self) -> bool {
        matches!(self, Self::FileState { .. })
    }
}
