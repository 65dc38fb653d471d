//! Reconciliation of local books with git repositories.
//!
//! Every book is paired with the repository files sharing its name
//! ([`BookNamesake`]) and classified into a [`SyncStatus`](quire_book::SyncStatus)
//! by [`resolve`]. [`SyncCoordinator`] runs whole passes: it commits local
//! changes, integrates with the remote, applies remote changes and records
//! the resulting status of every book.

mod coordinator;
pub mod error;
mod ignore;
mod lock;
mod namesake;

pub use crate::coordinator::{SyncCoordinator, SyncEvent, SyncOutcome, SyncReport};
pub use crate::ignore::{IGNORE_FILE, IgnoreRules};
pub use crate::lock::RepoLocks;
pub use crate::namesake::{BookNamesake, Resolution, resolve};
