//! Book Error Types
//!
//! This module provides structured errors using `exn` for automatic location
//! tracking and error tree construction.

use derive_more::{Display, Error};

use crate::models::{BookId, RepoId};

/// A book store error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for book store operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// No book exists with the given id.
    #[display("book not found: {_0}")]
    BookNotFound(#[error(not(source))] BookId),
    /// No repository exists with the given id.
    #[display("repository not found: {_0}")]
    RepoNotFound(#[error(not(source))] RepoId),
    /// A book with the same name already exists.
    #[display("book already exists: {_0}")]
    AlreadyExists(#[error(not(source))] String),
    /// Book names must be non-empty and must not contain path traversal.
    #[display("invalid book name: {_0}")]
    InvalidName(#[error(not(source))] String),
    /// A persisted value could not be decoded.
    #[display("invalid stored data: {_0}")]
    InvalidData(#[error(not(source))] &'static str),
    /// The storage backing the book store failed.
    #[display("book store backend failure")]
    Backend,
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Backend)
    }
}
