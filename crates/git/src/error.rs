//! Git Error Types
//!
//! This module provides structured errors using `exn` for automatic location
//! tracking and error tree construction.

use derive_more::{Display, Error};
use std::io::Error as IoError;
use std::path::PathBuf;

/// A git error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for git operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
/// Rebase conflicts and push rejections are outcomes, not errors.
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// Uncommitted or untracked files; nothing was changed.
    #[display("refusing to update because there are uncommitted changes: {}", _0.join(", "))]
    WorkingTreeDirty(#[error(not(source))] Vec<String>),
    /// The remote could not be found or contacted.
    #[display("remote unreachable: {_0}")]
    RemoteUnreachable(#[error(not(source))] String),
    /// Push failed for a reason other than a non-fast-forward rejection.
    #[display("push failed: {_0}")]
    PushHardFailure(#[error(not(source))] String),
    /// The remote refused the conflict branch update.
    #[display("pushing the conflict branch failed: {_0}")]
    ConflictBranch(#[error(not(source))] String),
    /// Rebase failed for a reason other than a conflict; it was aborted.
    #[display("rebase failed")]
    Rebase,
    #[display("not a git working copy: {}", _0.display())]
    NotARepository(#[error(not(source))] PathBuf),
    /// Clone target must be an existing, empty directory.
    #[display("clone target is not an empty directory: {}", _0.display())]
    CloneTarget(#[error(not(source))] PathBuf),
    #[display("clone failed: {_0}")]
    Clone(#[error(not(source))] String),
    /// Path escapes the working tree or is otherwise malformed.
    #[display("invalid path: {}", _0.display())]
    InvalidPath(#[error(not(source))] PathBuf),
    #[display("file not found: {}", _0.display())]
    NotFound(#[error(not(source))] PathBuf),
    #[display("file already exists: {}", _0.display())]
    AlreadyExists(#[error(not(source))] PathBuf),
    /// Any other libgit2 failure.
    #[display("git error")]
    Git,
    #[display("I/O error: {_0}")]
    Io(IoError),
}
impl From<IoError> for ErrorKind {
    fn from(err: IoError) -> Self {
        Self::Io(err)
    }
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RemoteUnreachable(_) | Self::PushHardFailure(_) | Self::Io(_))
    }
}
