//! Books, links, revisions and the store that persists them.
//!
//! A **book** is a named local document. It may be **linked** to one
//! repository, and remembers the **revision** of the repository file it was
//! last synced to. The sync engine reads and writes all of this through the
//! [`BookStore`] trait.

pub mod error;
#[cfg(any(test, feature = "mock"))]
mod mock;
mod models;
mod name;
mod status;
mod store;

#[cfg(any(test, feature = "mock"))]
pub use crate::mock::MockBookStore;
pub use crate::models::{
    ActionKind, Book, BookAction, BookId, BookView, Capabilities, Link, Repo, RepoId, RepoKind, VersionedRevision,
};
pub use crate::name::{BookName, DEFAULT_EXTENSIONS, path_for, validate as validate_name};
pub use crate::status::SyncStatus;
pub use crate::store::BookStore;
use std::sync::Arc;

pub type StoreHandle = Arc<dyn BookStore>;
