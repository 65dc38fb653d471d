//! Git plumbing for quire.
//!
//! [`RepoSynchronizer`] wraps one working copy and exposes the handful of
//! operations a sync pass needs (commit, fetch, push, rebase, diff) with the
//! guarantees the pass relies on: nothing touches a dirty working tree, empty
//! commits are never created, push and rebase report rejections and conflicts
//! as outcomes rather than errors, and local work that cannot be integrated
//! is parked on a conflict branch.

mod diff;
pub mod error;
mod path;
pub mod repository;
mod settings;
mod synchronizer;
mod transport;

pub use crate::diff::{ChangeKind, FileChange};
pub use crate::path::validate as validate_path;
pub use crate::settings::GitSettings;
pub use crate::synchronizer::{GitEvent, PushOutcome, RebaseOutcome, RepoSynchronizer};
pub use crate::transport::{CredentialTransport, Credentials, TransportConfigurator};
pub use git2::Oid;
