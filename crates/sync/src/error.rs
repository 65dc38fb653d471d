//! Sync Error Types
//!
//! This module provides structured errors using `exn` for automatic location
//! tracking and error tree construction. Errors raised by the git layer are
//! re-raised into the matching category here so callers only ever need to
//! match on one enum.

use derive_more::{Display, Error};
use quire_book::{BookId, RepoId, RepoKind};
use quire_git::error::{Error as GitError, ErrorKind as GitErrorKind};

/// A sync error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for sync operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// The working copy has uncommitted changes; nothing was touched.
    #[display("working tree has uncommitted changes")]
    WorkingTreeDirty,
    /// The remote history contains a rename, copy or type change.
    #[display("unsupported remote change: {_0}")]
    RemoteChangeUnsupported(#[error(not(source))] String),
    #[display("remote could not be reached")]
    RemoteUnreachable,
    /// Authentication or transport failure while pushing.
    #[display("push failed")]
    PushHardFailure,
    /// The remote rejected the push again after rebasing onto it.
    #[display("push rejected after rebase")]
    PushRejected,
    #[display("could not save local changes to the conflict branch")]
    ConflictBranch,
    /// The local branch diverged from the remote and could not be rebased.
    #[display("local branch diverged from the remote")]
    Diverged,
    /// The remote has changes that have not been applied to local books yet.
    #[display("remote changes not yet applied, sync first")]
    SyncRequired,
    #[display("book store failure")]
    Store,
    #[display("git failure")]
    Git,
    #[display("sync cancelled")]
    Cancelled,
    /// A background task failed to complete.
    #[display("background task failed")]
    Worker,
    /// The resolver was called without a book and without revisions.
    #[display("no book and no revisions for {_0:?}")]
    EmptyNamesake(#[error(not(source))] String),
    #[display("repository kind {_0} cannot be synced")]
    UnsupportedRepoKind(#[error(not(source))] RepoKind),
    #[display("repository {_0} is not registered")]
    UnknownRepo(#[error(not(source))] RepoId),
    #[display("book {_0} is not linked to this repository")]
    NotLinked(#[error(not(source))] BookId),
    #[display("book {_0} has no file in the repository")]
    MissingFile(#[error(not(source))] BookId),
    #[display("invalid book name: {_0}")]
    InvalidName(#[error(not(source))] String),
    #[display("a book called {_0:?} already exists")]
    NameTaken(#[error(not(source))] String),
}

impl ErrorKind {
    /// Re-raise a git error under the sync category that matches it.
    #[track_caller]
    pub fn git(err: GitError) -> Error {
        let kind = match &*err {
            GitErrorKind::WorkingTreeDirty(_) => Self::WorkingTreeDirty,
            GitErrorKind::RemoteUnreachable(_) => Self::RemoteUnreachable,
            GitErrorKind::PushHardFailure(_) => Self::PushHardFailure,
            GitErrorKind::ConflictBranch(_) => Self::ConflictBranch,
            _ => Self::Git,
        };
        err.raise(kind)
    }

    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RemoteUnreachable | Self::PushHardFailure | Self::PushRejected | Self::Store)
    }
}
