use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use time::OffsetDateTime;

use crate::status::SyncStatus;

/// Primary key of a local book.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BookId(pub i64);

/// Primary key of a registered repository.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RepoId(pub i64);

/// The kinds of repository a book can be linked to.
///
/// Only git repositories are integrally synced (the whole repository is
/// reconciled in one pass); the other kinds are listed so that links to them
/// can be stored and their capabilities queried.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RepoKind {
    #[display("git")]
    Git,
    #[display("directory")]
    Directory,
    #[display("content-provider")]
    ContentProvider,
    #[display("mock")]
    Mock,
}

/// What a repository kind can do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Syncing needs a network connection.
    pub connection_required: bool,
    /// The repository may be synced in the background without user action.
    pub auto_sync: bool,
    /// An ignore file at the repository root is honoured.
    pub ignore_file: bool,
    /// All books of the repository are reconciled together in one pass.
    pub integrally_synced: bool,
}

impl RepoKind {
    pub fn capabilities(&self) -> Capabilities {
        match self {
            Self::Git => Capabilities {
                connection_required: true,
                auto_sync: true,
                ignore_file: true,
                integrally_synced: true,
            },
            Self::Directory | Self::ContentProvider => Capabilities {
                connection_required: false,
                auto_sync: true,
                ignore_file: true,
                integrally_synced: false,
            },
            Self::Mock => Capabilities {
                connection_required: false,
                auto_sync: false,
                ignore_file: false,
                integrally_synced: false,
            },
        }
    }
}

impl FromStr for RepoKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "git" => Ok(Self::Git),
            "directory" => Ok(Self::Directory),
            "content-provider" => Ok(Self::ContentProvider),
            "mock" => Ok(Self::Mock),
            other => Err(format!("unknown repository kind: {other}")),
        }
    }
}

/// A registered repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Repo {
    pub id: RepoId,
    pub kind: RepoKind,
    pub url: String,
}

/// Association from a book to the repository it syncs with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub repo_id: RepoId,
    pub url: String,
}

impl From<&Repo> for Link {
    fn from(repo: &Repo) -> Self {
        Self { repo_id: repo.id, url: repo.url.clone() }
    }
}

/// An immutable snapshot of one file in one repository.
///
/// Two revisions with the same [`revision`](Self::revision) describe the same
/// state. Two revisions with the same `(repo_uri, file_uri)` describe the same
/// file, possibly at different states.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedRevision {
    pub repo_id: RepoId,
    pub repo_kind: RepoKind,
    pub repo_uri: String,
    /// Path of the file relative to the repository root, `/`-separated.
    pub file_uri: String,
    /// Hash of the last commit that touched the file.
    pub revision: String,
    pub modified: OffsetDateTime,
}

impl VersionedRevision {
    /// Whether both revisions refer to the same file in the same repository.
    pub fn same_identity(&self, other: &Self) -> bool {
        self.repo_uri == other.repo_uri && self.file_uri == other.file_uri
    }

    /// Whether both revisions refer to the same state of a file.
    pub fn same_state(&self, other: &Self) -> bool {
        self.revision == other.revision
    }
}

/// A local book.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Book {
    pub id: BookId,
    pub name: String,
    /// Placeholder with no real content yet.
    pub is_dummy: bool,
    /// Modified locally since the last successful sync.
    pub is_dirty: bool,
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    #[display("info")]
    Info,
    #[display("error")]
    Error,
    #[display("progress")]
    Progress,
}

impl FromStr for ActionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "info" => Ok(Self::Info),
            "error" => Ok(Self::Error),
            "progress" => Ok(Self::Progress),
            other => Err(format!("unknown action kind: {other}")),
        }
    }
}

/// The last thing that happened to a book, shown to the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookAction {
    pub kind: ActionKind,
    pub message: String,
    pub timestamp: OffsetDateTime,
}

impl BookAction {
    pub fn new(kind: ActionKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into(), timestamp: OffsetDateTime::now_utc() }
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::new(ActionKind::Info, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(ActionKind::Error, message)
    }

    pub fn progress(message: impl Into<String>) -> Self {
        Self::new(ActionKind::Progress, message)
    }
}

/// A book together with its link, last synced revision and sync state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookView {
    pub book: Book,
    pub link: Option<Link>,
    /// The revision the book content was last known to match.
    pub synced_to: Option<VersionedRevision>,
    pub last_action: Option<BookAction>,
    pub status: Option<SyncStatus>,
}

impl BookView {
    pub fn id(&self) -> BookId {
        self.book.id
    }

    pub fn name(&self) -> &str {
        &self.book.name
    }

    pub fn is_dummy(&self) -> bool {
        self.book.is_dummy
    }

    pub fn is_dirty(&self) -> bool {
        self.book.is_dirty
    }

    pub fn has_link(&self) -> bool {
        self.link.is_some()
    }

    pub fn has_sync(&self) -> bool {
        self.synced_to.is_some()
    }

    /// Linked to the given repository.
    pub fn is_linked_to(&self, repo: RepoId) -> bool {
        self.link.as_ref().is_some_and(|link| link.repo_id == repo)
    }
}
