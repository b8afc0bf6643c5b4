//! File operations available to authenticated sessions.
//!
//! This module provides:
//! - Directory listing and bounded file viewing
//! - Copy, move and rename of regular files
//! - Working directory changes
//! - Whole-file download and upload as base64
//!
//! # Confinement
//!
//! Every path argument goes through [`PathSandbox::resolve`] before any
//! filesystem access. A rejected path aborts the operation with no side
//! effect. Paths in results are rendered relative to the server root.

mod locks;
mod ops;
mod transfer;

pub use locks::{PathLockGuard, PathLocks};
pub use ops::{CopyOutcome, EntryKind, ListingEntry, View};
pub use transfer::{Download, Upload, BASE64_LINE_WIDTH};

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::config::Config;
use crate::sandbox::{PathSandbox, SandboxError};

/// Errors raised by file operations.
///
/// Paths carried for clients are root-relative. Only [`FileOpError::Io`]
/// keeps the absolute path, for server-side logging.
#[derive(Debug, Error)]
pub enum FileOpError {
    /// Path confinement failed.
    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    /// The target does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The source is not a regular file.
    #[error("not a regular file: {0}")]
    NotAFile(String),

    /// The target exists but is not a directory.
    #[error("not a directory: {0}")]
    NotADirectory(String),

    /// The destination is an existing directory.
    #[error("destination is a directory: {0}")]
    DestinationIsDirectory(String),

    /// The file exceeds the transfer limit.
    #[error("file too large: {size} bytes exceeds limit of {limit} bytes")]
    FileTooLarge { size: u64, limit: u64 },

    /// The upload payload is not valid base64.
    #[error("upload payload is not valid base64")]
    InvalidPayload,

    /// Underlying filesystem failure.
    #[error("{op} failed on {}: {source}", .path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl FileOpError {
    pub(crate) fn io(op: &'static str, path: &Path) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.to_path_buf();
        move |source| FileOpError::Io { op, path, source }
    }
}

/// Result type for file operations.
pub type FileResult<T> = Result<T, FileOpError>;

/// Limits applied to file operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileLimits {
    /// Lines returned by a file view before truncation.
    pub view_max_lines: usize,
    /// Longest single line a file view returns, in bytes.
    pub view_max_line_bytes: usize,
    /// Largest file a download or upload may move.
    pub max_transfer_size: u64,
}

impl Default for FileLimits {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for FileLimits {
    fn from(config: &Config) -> Self {
        Self {
            view_max_lines: config.file.view_max_lines,
            // One byte of headroom for dot-stuffing.
            view_max_line_bytes: config.protocol.max_line_length.saturating_sub(1),
            max_transfer_size: config.file.max_transfer_size,
        }
    }
}

/// Sandboxed file operations shared by all sessions.
#[derive(Debug)]
pub struct FileOperations {
    sandbox: PathSandbox,
    limits: FileLimits,
    locks: Option<PathLocks>,
}

impl FileOperations {
    /// Create the operations without cross-session locking.
    pub fn new(sandbox: PathSandbox, limits: FileLimits) -> Self {
        Self {
            sandbox,
            limits,
            locks: None,
        }
    }

    /// Hold per-path locks for the duration of each mutation.
    pub fn with_serialized_mutations(mut self, enabled: bool) -> Self {
        self.locks = enabled.then(PathLocks::new);
        self
    }

    pub fn sandbox(&self) -> &PathSandbox {
        &self.sandbox
    }

    pub fn limits(&self) -> FileLimits {
        self.limits
    }

    /// Lock `paths` if serialization is enabled.
    fn lock(&self, paths: &[&Path]) -> Option<PathLockGuard<'_>> {
        self.locks.as_ref().map(|locks| locks.acquire(paths))
    }

    fn display(&self, path: &Path) -> String {
        self.sandbox.display(path)
    }
}
