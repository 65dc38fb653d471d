use exn::ResultExt;
use quire_book::{
    BookAction, BookId, BookName, BookStore, BookView, DEFAULT_EXTENSIONS, Link, Repo, SyncStatus, VersionedRevision,
    path_for,
};
use quire_git::error::ErrorKind as GitErrorKind;
use quire_git::{ChangeKind, Oid, PushOutcome, RebaseOutcome, RepoSynchronizer};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::coordinator::{SyncOutcome, SyncReport, network};
use crate::error::{ErrorKind, Result};
use crate::ignore::{IGNORE_FILE, IgnoreRules};
use crate::namesake::{BookNamesake, resolve};

/// A book committed locally during this pass, and how it looked before.
struct Staged {
    path: String,
    before: BookView,
}

struct Entry {
    name: String,
    status: SyncStatus,
    detail: Option<String>,
}

/// Statuses decided by one phase. Written to the store together, one per book.
#[derive(Default)]
struct PhaseWrites {
    entries: BTreeMap<BookId, Entry>,
}

impl PhaseWrites {
    fn record(&mut self, view: &BookView, status: SyncStatus, detail: Option<String>) {
        match self.entries.get_mut(&view.id()) {
            Some(entry) => {
                entry.status = entry.status.then(status);
                if entry.status == status {
                    entry.detail = detail;
                }
            },
            None => {
                self.entries.insert(view.id(), Entry { name: view.name().to_string(), status, detail });
            },
        }
    }
}

/// State of one sync pass over one repository.
pub(super) struct Pass<'a> {
    store: &'a dyn BookStore,
    git: &'a Arc<RepoSynchronizer>,
    extensions: &'a [String],
    cancel: &'a CancellationToken,
    repo: Repo,
    repo_count: usize,
    ignore: IgnoreRules,
    /// Local HEAD before anything was committed.
    head_before: Option<Oid>,
    staged: BTreeMap<BookId, Staged>,
    /// Every status written so far. Books listed here count as touched.
    statuses: BTreeMap<BookId, (String, SyncStatus)>,
    conflict: Option<String>,
}

impl<'a> Pass<'a> {
    pub(super) async fn prepare(
        store: &'a dyn BookStore,
        git: &'a Arc<RepoSynchronizer>,
        extensions: &'a [String],
        cancel: &'a CancellationToken,
    ) -> Result<Self> {
        let repo = git.repo().clone();
        let capabilities = repo.kind.capabilities();
        if !capabilities.integrally_synced {
            exn::bail!(ErrorKind::UnsupportedRepoKind(repo.kind));
        }
        let repos = store.repos().await.or_raise(|| ErrorKind::Store)?;
        if !repos.iter().any(|known| known.id == repo.id) {
            exn::bail!(ErrorKind::UnknownRepo(repo.id));
        }
        git.ensure_clean().map_err(ErrorKind::git)?;
        let ignore = match capabilities.ignore_file {
            true => load_ignore_rules(git)?,
            false => IgnoreRules::default(),
        };
        Ok(Self {
            store,
            git,
            extensions,
            cancel,
            repo,
            repo_count: repos.len(),
            ignore,
            head_before: git.head().map_err(ErrorKind::git)?,
            staged: BTreeMap::new(),
            statuses: BTreeMap::new(),
            conflict: None,
        })
    }

    pub(super) async fn run(mut self) -> Result<SyncReport> {
        self.checkpoint()?;
        self.bootstrap().await?;
        self.checkpoint()?;
        self.stage_local_changes().await?;
        self.checkpoint()?;
        self.link_orphans().await?;
        self.checkpoint()?;
        let remote_head = self.connect().await?;
        self.checkpoint()?;
        self.apply_remote_changes(remote_head).await?;
        self.checkpoint()?;
        self.finalize().await?;

        let outcome = match self.conflict {
            Some(reason) => SyncOutcome::CompletedWithConflicts(reason),
            None => SyncOutcome::Completed,
        };
        Ok(SyncReport { repo: self.repo.id, outcome, statuses: self.statuses.into_values().collect() })
    }

    fn checkpoint(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            tracing::info!("sync cancelled");
            exn::bail!(ErrorKind::Cancelled);
        }
        Ok(())
    }

    // =========================================================================
    // Phases
    // =========================================================================

    /// Load every book file at HEAD when nothing is linked to the repository yet.
    async fn bootstrap(&mut self) -> Result<()> {
        let linked = self.store.books_linked_to_repo(self.repo.id).await.or_raise(|| ErrorKind::Store)?;
        if !linked.is_empty() {
            return Ok(());
        }
        let revisions = self.git.revisions(|path| self.book_name(path).is_some()).map_err(ErrorKind::git)?;
        tracing::debug!(files = revisions.len(), "bootstrapping from HEAD");

        let mut writes = PhaseWrites::default();
        for namesake in BookNamesake::group(Vec::new(), revisions, self.extensions) {
            let book = self.store.book_view_by_name(&namesake.name).await.or_raise(|| ErrorKind::Store)?;
            let resolution = resolve(&namesake.name, book.as_ref(), &namesake.revisions, self.repo_count)?;
            let view = match (resolution.status, resolution.revision) {
                (SyncStatus::NoBookOneRevision | SyncStatus::DummyWithoutLinkOneRevision, Some(revision)) => {
                    Some(self.load(&namesake.name, revision).await?)
                },
                _ => book,
            };
            match view {
                Some(view) => writes.record(&view, resolution.status, detail(resolution.revision)),
                None => tracing::warn!(book = %namesake.name, status = %resolution.status, "not loaded"),
            }
        }
        self.flush(writes).await
    }

    /// Commit linked books that changed locally or never reached the repository.
    async fn stage_local_changes(&mut self) -> Result<()> {
        let books = self.store.books_linked_to_repo(self.repo.id).await.or_raise(|| ErrorKind::Store)?;
        let mut writes = PhaseWrites::default();
        for view in books {
            if self.statuses.contains_key(&view.id()) || !(view.is_dirty() || !view.has_sync()) {
                continue;
            }
            let revisions = self.revisions_named(view.name())?;
            let resolution = resolve(view.name(), Some(&view), &revisions, self.repo_count)?;
            // A commit left behind by a pass that failed before pushing is
            // still local work, not a conflict.
            let status = match resolution.status {
                SyncStatus::ConflictNeverSynced | SyncStatus::ConflictBothModified
                    if self.is_unpushed(resolution.revision)? =>
                {
                    SyncStatus::BookWithLinkLocalModified
                },
                status => status,
            };
            let detail = match (status, resolution.revision) {
                (SyncStatus::OnlyBookWithLink | SyncStatus::BookWithLinkLocalModified, revision) => {
                    let path = self.target_path(&view, revision);
                    self.stage(&view, &path).await?;
                    Some(path)
                },
                (SyncStatus::DummyWithLink, Some(revision)) => {
                    self.load(view.name(), revision).await?;
                    detail(Some(revision))
                },
                (_, revision) => detail(revision),
            };
            writes.record(&view, status, detail);
        }
        self.flush(writes).await
    }

    /// Link unlinked books to this repository when it is the only one, and
    /// commit them.
    async fn link_orphans(&mut self) -> Result<()> {
        let books = self.store.books_without_link().await.or_raise(|| ErrorKind::Store)?;
        let mut writes = PhaseWrites::default();
        for view in books {
            if self.statuses.contains_key(&view.id()) {
                continue;
            }
            if view.has_sync() {
                writes.record(&view, SyncStatus::BookWithPreviousErrorAndNoLink, None);
                continue;
            }
            let revisions = self.revisions_named(view.name())?;
            let resolution = resolve(view.name(), Some(&view), &revisions, self.repo_count)?;
            let detail = match (resolution.status, resolution.revision) {
                (SyncStatus::OnlyBookWithoutLinkAndOneRepo, _) => {
                    let link = Link::from(&self.repo);
                    self.store.set_link(view.id(), &link).await.or_raise(|| ErrorKind::Store)?;
                    let linked = BookView { link: Some(link), ..view.clone() };
                    let path = path_for(view.name(), self.default_extension());
                    self.stage(&linked, &path).await?;
                    Some(path)
                },
                (SyncStatus::DummyWithoutLinkOneRevision, Some(revision)) => {
                    self.load(view.name(), revision).await?;
                    detail(Some(revision))
                },
                (_, revision) => detail(revision),
            };
            writes.record(&view, resolution.status, detail);
        }
        self.flush(writes).await
    }

    /// Fetch, then publish local commits: push, and on rejection rebase and
    /// push once more. Local work that cannot be rebased goes to the conflict
    /// branch. Returns the fetched remote head.
    async fn connect(&mut self) -> Result<Option<Oid>> {
        let remote_head = network(self.git, RepoSynchronizer::fetch).await?;
        let mut writes = PhaseWrites::default();

        if self.git.has_unpushed_commits().map_err(ErrorKind::git)?
            && network(self.git, RepoSynchronizer::push).await? == PushOutcome::Rejected
        {
            match self.git.rebase_onto_remote().map_err(ErrorKind::git)? {
                RebaseOutcome::Conflict => {
                    network(self.git, RepoSynchronizer::push_to_conflict_branch).await?;
                    let branch = self.git.settings().conflict_branch.clone();
                    for view in self.books_with_unpushed_changes().await? {
                        writes.record(&view, SyncStatus::ConflictSavedToTempBranch, Some(branch.clone()));
                    }
                    self.conflict = Some(format!("local changes saved to branch {branch:?}"));
                },
                RebaseOutcome::Success | RebaseOutcome::UpToDate => {
                    if network(self.git, RepoSynchronizer::push).await? == PushOutcome::Rejected {
                        exn::bail!(ErrorKind::PushRejected);
                    }
                },
            }
        }

        if self.conflict.is_none() {
            for (id, staged) in &self.staged {
                if let Some(revision) = self.git.current_revision(&staged.path).map_err(ErrorKind::git)? {
                    self.store.set_synced_revision(*id, &revision).await.or_raise(|| ErrorKind::Store)?;
                }
                self.store.mark_not_dirty(*id).await.or_raise(|| ErrorKind::Store)?;
            }
        }
        self.flush(writes).await?;
        Ok(remote_head)
    }

    /// Apply what changed remotely since the last applied remote head.
    async fn apply_remote_changes(&mut self, remote_head: Option<Oid>) -> Result<()> {
        if self.conflict.is_some() {
            tracing::info!("skipping remote changes until the conflict branch is merged");
            return Ok(());
        }
        let Some(remote_head) = remote_head else {
            return self.mark_applied();
        };
        let baseline = match (self.git.sync_marker().map_err(ErrorKind::git)?, self.head_before) {
            (Some(marker), _) => Some(marker),
            (None, Some(head)) => self.git.merge_base(head, remote_head).map_err(ErrorKind::git)?,
            (None, None) => None,
        };
        if baseline == Some(remote_head) {
            return self.mark_applied();
        }

        let changes = self.git.diff_between(baseline, remote_head).map_err(ErrorKind::git)?;
        if let Some(change) = changes.iter().find(|change| !change.is_supported()) {
            tracing::error!(path = change.path(), kind = ?change.kind, "unsupported remote change");
            exn::bail!(ErrorKind::RemoteChangeUnsupported(change.path().to_string()));
        }
        if self.git.rebase_onto_remote().map_err(ErrorKind::git)? == RebaseOutcome::Conflict {
            exn::bail!(ErrorKind::Diverged);
        }
        tracing::debug!(changes = changes.len(), "applying remote changes");

        let mut writes = PhaseWrites::default();
        for change in &changes {
            let Some(name) = self.book_name(change.path()) else {
                continue;
            };
            match change.kind {
                ChangeKind::Add | ChangeKind::Modify => self.apply_remote_file(&name, &mut writes).await?,
                ChangeKind::Delete => self.apply_remote_deletion(&name, change.path(), &mut writes).await?,
                ChangeKind::Unsupported(_) => {},
            }
        }
        self.flush(writes).await?;
        self.mark_applied()
    }

    /// Every linked book nobody touched is unchanged.
    async fn finalize(&mut self) -> Result<()> {
        let books = self.store.books_linked_to_repo(self.repo.id).await.or_raise(|| ErrorKind::Store)?;
        let mut writes = PhaseWrites::default();
        for view in books.iter().filter(|view| !self.statuses.contains_key(&view.id())) {
            writes.record(view, SyncStatus::NoChange, None);
        }
        self.flush(writes).await
    }

    // =========================================================================
    // Remote changes
    // =========================================================================

    async fn apply_remote_file(&mut self, name: &BookName, writes: &mut PhaseWrites) -> Result<()> {
        let current = self.store.book_view_by_name(&name.name).await.or_raise(|| ErrorKind::Store)?;
        // Books committed in this pass are judged by how they looked before.
        let before = current.as_ref().and_then(|view| self.staged.get(&view.id())).map(|staged| staged.before.clone());
        let is_staged = before.is_some();
        let view = before.or(current);

        let revisions = self.revisions_named(&name.name)?;
        if view.is_none() && revisions.is_empty() {
            return Ok(());
        }
        let resolution = resolve(&name.name, view.as_ref(), &revisions, self.repo_count)?;
        let load = match resolution.status {
            SyncStatus::NoBookOneRevision
            | SyncStatus::DummyWithoutLinkOneRevision
            | SyncStatus::DummyWithLink
            | SyncStatus::BookWithLinkRemoteModified => true,
            // Both sides were rebased into one file.
            SyncStatus::ConflictBothModified => is_staged,
            _ => false,
        };
        let view = match (load, resolution.revision) {
            (true, Some(revision)) => Some(self.load(&name.name, revision).await?),
            _ => view,
        };
        if let Some(view) = view {
            writes.record(&view, resolution.status, detail(resolution.revision));
        }
        Ok(())
    }

    async fn apply_remote_deletion(&mut self, name: &BookName, path: &str, writes: &mut PhaseWrites) -> Result<()> {
        let Some(view) = self.store.book_view_by_name(&name.name).await.or_raise(|| ErrorKind::Store)? else {
            return Ok(());
        };
        if !view.is_linked_to(self.repo.id) {
            return Ok(());
        }
        let synced_path = view.synced_to.as_ref().map(|synced| synced.file_uri.as_str());
        if synced_path.is_some_and(|synced| synced != path) {
            return Ok(());
        }
        self.store.delete_link(view.id()).await.or_raise(|| ErrorKind::Store)?;
        tracing::warn!(book = view.name(), path, "linked file deleted remotely, link removed");
        writes.record(&view, SyncStatus::RevisionNoLongerExists, Some(path.to_string()));
        Ok(())
    }

    /// Record the current remote head as applied.
    fn mark_applied(&self) -> Result<()> {
        if let Some(head) = self.git.remote_head().map_err(ErrorKind::git)? {
            self.git.set_sync_marker(head).map_err(ErrorKind::git)?;
        }
        Ok(())
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    async fn flush(&mut self, writes: PhaseWrites) -> Result<()> {
        for (id, entry) in writes.entries {
            let status = match self.statuses.get(&id) {
                Some((_, earlier)) => earlier.then(entry.status),
                None => entry.status,
            };
            let message = match entry.detail.filter(|_| status == entry.status) {
                Some(detail) => format!("{} ({detail})", status.description()),
                None => status.description().to_string(),
            };
            let action = BookAction::new(status.action_kind(), message);
            self.store.set_last_action_and_status(id, &action, Some(status)).await.or_raise(|| ErrorKind::Store)?;
            tracing::debug!(book = %entry.name, %status, "status recorded");
            self.statuses.insert(id, (entry.name, status));
        }
        Ok(())
    }

    async fn load(&self, name: &str, revision: &VersionedRevision) -> Result<BookView> {
        let content = self.git.retrieve_file(&revision.file_uri).map_err(ErrorKind::git)?;
        let view =
            self.store.load_or_create_from_remote(name, revision, &content).await.or_raise(|| ErrorKind::Store)?;
        tracing::info!(book = name, path = %revision.file_uri, "loaded book");
        Ok(view)
    }

    async fn stage(&mut self, view: &BookView, path: &str) -> Result<()> {
        let content = self.store.export_book(view.id()).await.or_raise(|| ErrorKind::Store)?;
        let message = self.git.settings().update_message(path);
        let commit = self.git.stage_and_commit(&[(path, &content)], &message).map_err(ErrorKind::git)?;
        tracing::info!(book = view.name(), path, committed = commit.is_some(), "staged local changes");
        self.staged.insert(view.id(), Staged { path: path.to_string(), before: view.clone() });
        Ok(())
    }

    /// Books committed in this pass, plus linked books whose files changed in
    /// local commits left unpushed by earlier passes.
    async fn books_with_unpushed_changes(&self) -> Result<Vec<BookView>> {
        let mut views: Vec<BookView> = self.staged.values().map(|staged| staged.before.clone()).collect();
        for path in self.git.unpushed_paths().map_err(ErrorKind::git)? {
            let Some(name) = self.book_name(&path) else {
                continue;
            };
            let Some(view) = self.store.book_view_by_name(&name.name).await.or_raise(|| ErrorKind::Store)? else {
                continue;
            };
            if view.is_linked_to(self.repo.id) && !views.iter().any(|known| known.id() == view.id()) {
                views.push(view);
            }
        }
        Ok(views)
    }

    /// Whether `revision` is a local commit the remote has not received.
    fn is_unpushed(&self, revision: Option<&VersionedRevision>) -> Result<bool> {
        match revision {
            Some(revision) => Ok(!self.git.is_published(&revision.revision).map_err(ErrorKind::git)?),
            None => Ok(false),
        }
    }

    /// The name of the book stored at `path`, unless the path is not a book
    /// file or is ignored.
    fn book_name(&self, path: &str) -> Option<BookName> {
        BookName::from_path(path, self.extensions).filter(|_| !self.ignore.is_ignored(path))
    }

    /// Revisions at HEAD of every file carrying the book's name.
    fn revisions_named(&self, name: &str) -> Result<Vec<VersionedRevision>> {
        let mut revisions = Vec::new();
        for extension in self.extensions {
            let path = path_for(name, extension);
            if self.ignore.is_ignored(&path) {
                continue;
            }
            if let Some(revision) = self.git.current_revision(&path).map_err(ErrorKind::git)? {
                revisions.push(revision);
            }
        }
        Ok(revisions)
    }

    /// Where a linked book is written: its file in this repository if it has
    /// one, a new file otherwise.
    fn target_path(&self, view: &BookView, revision: Option<&VersionedRevision>) -> String {
        revision
            .map(|revision| revision.file_uri.clone())
            .or_else(|| {
                let synced = view.synced_to.as_ref().filter(|synced| synced.repo_id == self.repo.id)?;
                Some(synced.file_uri.clone())
            })
            .unwrap_or_else(|| path_for(view.name(), self.default_extension()))
    }

    fn default_extension(&self) -> &str {
        self.extensions.first().map_or(DEFAULT_EXTENSIONS[0], String::as_str)
    }
}

fn detail(revision: Option<&VersionedRevision>) -> Option<String> {
    revision.map(|revision| revision.file_uri.clone())
}

fn load_ignore_rules(git: &RepoSynchronizer) -> Result<IgnoreRules> {
    match git.retrieve_file(IGNORE_FILE) {
        Ok(content) => Ok(IgnoreRules::parse(&String::from_utf8_lossy(&content))),
        Err(err) if matches!(&*err, GitErrorKind::NotFound(_)) => Ok(IgnoreRules::default()),
        Err(err) => Err(ErrorKind::git(err)),
    }
}
