//! Pairing local books with the remote revisions that share their name, and
//! classifying every pairing into a [`SyncStatus`].

use quire_book::{BookName, BookView, RepoId, SyncStatus, VersionedRevision};
use std::collections::BTreeMap;

use crate::error::{ErrorKind, Result};

/// One local book (possibly absent) and every revision carrying its name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookNamesake {
    pub name: String,
    pub book: Option<BookView>,
    pub revisions: Vec<VersionedRevision>,
}

impl BookNamesake {
    /// Group books and revisions by book name, ordered by name.
    ///
    /// Revisions whose path has none of the `extensions` are dropped.
    pub fn group(
        books: impl IntoIterator<Item = BookView>,
        revisions: impl IntoIterator<Item = VersionedRevision>,
        extensions: &[impl AsRef<str>],
    ) -> Vec<BookNamesake> {
        let mut namesakes: BTreeMap<String, BookNamesake> = BTreeMap::new();
        for book in books {
            let name = book.name().to_string();
            entry(&mut namesakes, &name).book = Some(book);
        }
        for revision in revisions {
            if let Some(name) = BookName::from_path(&revision.file_uri, extensions) {
                entry(&mut namesakes, &name.name).revisions.push(revision);
            }
        }
        namesakes.into_values().collect()
    }

    pub fn resolve(&self, repo_count: usize) -> Result<Resolution<'_>> {
        resolve(&self.name, self.book.as_ref(), &self.revisions, repo_count)
    }
}

fn entry<'a>(namesakes: &'a mut BTreeMap<String, BookNamesake>, name: &str) -> &'a mut BookNamesake {
    namesakes.entry(name.to_string()).or_insert_with(|| BookNamesake {
        name: name.to_string(),
        book: None,
        revisions: Vec::new(),
    })
}

/// The status of a namesake and, where one applies, the revision the status
/// is about (the one to load, or the linked one).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution<'a> {
    pub status: SyncStatus,
    pub revision: Option<&'a VersionedRevision>,
}

impl<'a> Resolution<'a> {
    fn new(status: SyncStatus, revision: Option<&'a VersionedRevision>) -> Self {
        Self { status, revision }
    }
}

/// Classify a book against the revisions sharing its name.
///
/// Pure and total over every input except the empty one, and independent of
/// the order of `revisions`. Rules are tried in order, the first match wins:
///
/// 1. No book, no revisions: [`EmptyNamesake`](ErrorKind::EmptyNamesake).
/// 2. No book: one or several revisions to load.
/// 3. No revisions: a dummy, a linked book, or an orphan that can be linked
///    only when there is exactly one repository.
/// 4. Linked book: compare the synced revision with the revision in the
///    linked repository.
/// 5. Unlinked book with revisions: only dummies may be replaced.
pub fn resolve<'a>(
    name: &str,
    book: Option<&BookView>,
    revisions: &'a [VersionedRevision],
    repo_count: usize,
) -> Result<Resolution<'a>> {
    use SyncStatus::*;

    let Some(book) = book else {
        return match revisions {
            [] => exn::bail!(ErrorKind::EmptyNamesake(name.to_string())),
            [only] => Ok(Resolution::new(NoBookOneRevision, Some(only))),
            _ => Ok(Resolution::new(NoBookMultipleRevisions, None)),
        };
    };

    if revisions.is_empty() {
        let status = match (book.is_dummy(), book.has_link(), repo_count <= 1) {
            (true, _, _) => OnlyDummy,
            (false, true, _) => OnlyBookWithLink,
            (false, false, true) => OnlyBookWithoutLinkAndOneRepo,
            (false, false, false) => OnlyBookWithoutLinkAndMultipleRepos,
        };
        return Ok(Resolution::new(status, None));
    }

    let Some(link) = &book.link else {
        return Ok(match (book.is_dummy(), revisions) {
            (false, _) => Resolution::new(BookWithoutLinkButRevisionsExist, None),
            (true, [only]) => Resolution::new(DummyWithoutLinkOneRevision, Some(only)),
            (true, _) => Resolution::new(DummyWithoutLinkMultipleRevisions, None),
        });
    };

    let synced_path = book.synced_to.as_ref().map(|synced| synced.file_uri.as_str());
    let Some(latest) = latest_linked(revisions, link.repo_id, synced_path) else {
        return Ok(Resolution::new(LinkPointsToMissingRevision, None));
    };
    if book.is_dummy() {
        return Ok(Resolution::new(DummyWithLink, Some(latest)));
    }
    let Some(synced) = &book.synced_to else {
        return Ok(Resolution::new(ConflictNeverSynced, Some(latest)));
    };
    let status = match (synced.same_identity(latest), synced.same_state(latest), book.is_dirty()) {
        (false, _, _) => ConflictSyncedRevisionStale,
        (true, true, true) => BookWithLinkLocalModified,
        (true, true, false) => NoChange,
        (true, false, true) => ConflictBothModified,
        (true, false, false) => BookWithLinkRemoteModified,
    };
    Ok(Resolution::new(status, Some(latest)))
}

/// The revision in the linked repository: the one at the synced path if there
/// is one, otherwise the smallest path.
fn latest_linked<'a>(
    revisions: &'a [VersionedRevision],
    repo: RepoId,
    synced_path: Option<&str>,
) -> Option<&'a VersionedRevision> {
    let linked = revisions.iter().filter(|revision| revision.repo_id == repo);
    match synced_path {
        Some(path) => linked.clone().find(|revision| revision.file_uri == path),
        None => None,
    }
    .or_else(|| linked.min_by(|a, b| a.file_uri.cmp(&b.file_uri)))
}
