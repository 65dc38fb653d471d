//! Per-book synchronization status.

use std::fmt;
use std::str::FromStr;

use crate::models::ActionKind;

/// Classification of one book against the remote revisions sharing its name.
///
/// Persisted by its [`as_str`](Self::as_str) name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncStatus {
    NoChange,

    BookWithoutLinkButRevisionsExist,
    DummyWithoutLinkOneRevision,
    DummyWithoutLinkMultipleRevisions,
    NoBookOneRevision,
    NoBookMultipleRevisions,
    OnlyBookWithoutLinkAndOneRepo,
    OnlyBookWithoutLinkAndMultipleRepos,
    OnlyBookWithLink,
    OnlyDummy,
    LinkPointsToMissingRevision,
    DummyWithLink,

    ConflictNeverSynced,
    ConflictSyncedRevisionStale,
    ConflictBothModified,
    ConflictSavedToTempBranch,

    BookWithLinkLocalModified,
    BookWithLinkRemoteModified,

    /// The linked file was deleted remotely; the link was removed.
    RevisionNoLongerExists,
    /// An unlinked book still remembers a revision it lost; left alone.
    BookWithPreviousErrorAndNoLink,
}

impl SyncStatus {
    pub const ALL: [SyncStatus; 20] = [
        Self::NoChange,
        Self::BookWithoutLinkButRevisionsExist,
        Self::DummyWithoutLinkOneRevision,
        Self::DummyWithoutLinkMultipleRevisions,
        Self::NoBookOneRevision,
        Self::NoBookMultipleRevisions,
        Self::OnlyBookWithoutLinkAndOneRepo,
        Self::OnlyBookWithoutLinkAndMultipleRepos,
        Self::OnlyBookWithLink,
        Self::OnlyDummy,
        Self::LinkPointsToMissingRevision,
        Self::DummyWithLink,
        Self::ConflictNeverSynced,
        Self::ConflictSyncedRevisionStale,
        Self::ConflictBothModified,
        Self::ConflictSavedToTempBranch,
        Self::BookWithLinkLocalModified,
        Self::BookWithLinkRemoteModified,
        Self::RevisionNoLongerExists,
        Self::BookWithPreviousErrorAndNoLink,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoChange => "NO_CHANGE",
            Self::BookWithoutLinkButRevisionsExist => "BOOK_WITHOUT_LINK_BUT_REVISIONS_EXIST",
            Self::DummyWithoutLinkOneRevision => "DUMMY_WITHOUT_LINK_ONE_REVISION",
            Self::DummyWithoutLinkMultipleRevisions => "DUMMY_WITHOUT_LINK_MULTIPLE_REVISIONS",
            Self::NoBookOneRevision => "NO_BOOK_ONE_REVISION",
            Self::NoBookMultipleRevisions => "NO_BOOK_MULTIPLE_REVISIONS",
            Self::OnlyBookWithoutLinkAndOneRepo => "ONLY_BOOK_WITHOUT_LINK_AND_ONE_REPO",
            Self::OnlyBookWithoutLinkAndMultipleRepos => "ONLY_BOOK_WITHOUT_LINK_AND_MULTIPLE_REPOS",
            Self::OnlyBookWithLink => "ONLY_BOOK_WITH_LINK",
            Self::OnlyDummy => "ONLY_DUMMY",
            Self::LinkPointsToMissingRevision => "LINK_POINTS_TO_MISSING_REVISION",
            Self::DummyWithLink => "DUMMY_WITH_LINK",
            Self::ConflictNeverSynced => "CONFLICT_NEVER_SYNCED",
            Self::ConflictSyncedRevisionStale => "CONFLICT_SYNCED_REVISION_STALE",
            Self::ConflictBothModified => "CONFLICT_BOTH_MODIFIED",
            Self::ConflictSavedToTempBranch => "CONFLICT_SAVED_TO_TEMP_BRANCH",
            Self::BookWithLinkLocalModified => "BOOK_WITH_LINK_LOCAL_MODIFIED",
            Self::BookWithLinkRemoteModified => "BOOK_WITH_LINK_REMOTE_MODIFIED",
            Self::RevisionNoLongerExists => "REVISION_NO_LONGER_EXISTS",
            Self::BookWithPreviousErrorAndNoLink => "BOOK_WITH_PREVIOUS_ERROR_AND_NO_LINK",
        }
    }

    /// Human readable explanation, shown as the book's last action.
    pub fn description(&self) -> &'static str {
        match self {
            Self::NoChange => "No change",
            Self::BookWithoutLinkButRevisionsExist => {
                "Notebook has no link and one or more remote notebooks with the same name exist"
            },
            Self::DummyWithoutLinkOneRevision => "Loaded from the only remote notebook with this name",
            Self::DummyWithoutLinkMultipleRevisions => {
                "Notebook has no link and multiple remote notebooks with the same name exist"
            },
            Self::NoBookOneRevision => "Loaded from the remote notebook",
            Self::NoBookMultipleRevisions => "Multiple remote notebooks with the same name exist",
            Self::OnlyBookWithoutLinkAndOneRepo => "Linked and saved to the only repository",
            Self::OnlyBookWithoutLinkAndMultipleRepos => {
                "Notebook has no link and multiple repositories exist; link it to one of them"
            },
            Self::OnlyBookWithLink => "Saved to the linked repository",
            Self::OnlyDummy => "Notebook has no content and no remote counterpart",
            Self::LinkPointsToMissingRevision => "Link points to a repository with no notebook of this name",
            Self::DummyWithLink => "Loaded from the linked repository",
            Self::ConflictNeverSynced => "Conflict: notebook was never synced but the remote file exists",
            Self::ConflictSyncedRevisionStale => "Conflict: last synced file differs from the linked file",
            Self::ConflictBothModified => "Conflict: notebook and remote file were both modified",
            Self::ConflictSavedToTempBranch => "Conflict: local changes were saved to a temporary branch",
            Self::BookWithLinkLocalModified => "Saved local changes",
            Self::BookWithLinkRemoteModified => "Loaded remote changes",
            Self::RevisionNoLongerExists => "Remote file no longer exists; link removed",
            Self::BookWithPreviousErrorAndNoLink => {
                "Notebook lost its remote file in an earlier sync; link it again to save"
            },
        }
    }

    /// Whether the outcome must be surfaced to the user as an error.
    pub fn action_kind(&self) -> ActionKind {
        match self {
            Self::BookWithoutLinkButRevisionsExist
            | Self::DummyWithoutLinkMultipleRevisions
            | Self::NoBookMultipleRevisions
            | Self::OnlyBookWithoutLinkAndMultipleRepos
            | Self::LinkPointsToMissingRevision
            | Self::OnlyDummy
            | Self::RevisionNoLongerExists
            | Self::BookWithPreviousErrorAndNoLink => ActionKind::Error,
            status if status.is_conflict() => ActionKind::Error,
            _ => ActionKind::Info,
        }
    }

    pub fn is_error(&self) -> bool {
        self.action_kind() == ActionKind::Error
    }

    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Self::ConflictNeverSynced
                | Self::ConflictSyncedRevisionStale
                | Self::ConflictBothModified
                | Self::ConflictSavedToTempBranch
        )
    }

    /// Combine a status recorded earlier in a pass with a later one.
    ///
    /// A conflict is never replaced by a non-conflict status.
    pub fn then(self, later: SyncStatus) -> SyncStatus {
        match self.is_conflict() && !later.is_conflict() {
            true => self,
            false => later,
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown sync status: {s}"))
    }
}
