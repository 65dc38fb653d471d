//! Sync passes and the book operations that must not interleave with them.

mod pass;
mod stream;

use exn::ResultExt;
use quire_book::{
    BookAction, BookId, BookName, BookView, DEFAULT_EXTENSIONS, RepoId, StoreHandle, SyncStatus, path_for,
};
use quire_git::error::Result as GitResult;
use quire_git::{Oid, PushOutcome, RebaseOutcome, RepoSynchronizer};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::error::{Error, ErrorKind, Result};
use crate::lock::RepoLocks;
use crate::coordinator::pass::Pass;

pub use crate::coordinator::stream::SyncEvent;

/// How a sync pass ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Completed,
    /// Local changes could not be integrated and were saved to the conflict
    /// branch instead.
    CompletedWithConflicts(String),
    Failed(String),
}

impl SyncOutcome {
    pub fn of(result: &Result<SyncReport>) -> Self {
        match result {
            Ok(report) => report.outcome.clone(),
            Err(err) => Self::Failed(err.to_string()),
        }
    }
}

/// What a completed pass did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub repo: RepoId,
    pub outcome: SyncOutcome,
    /// Final status of every book the pass looked at, by book name.
    pub statuses: BTreeMap<String, SyncStatus>,
}

impl SyncReport {
    pub fn status(&self, book: &str) -> Option<SyncStatus> {
        self.statuses.get(book).copied()
    }
}

/// Runs sync passes against a [`BookStore`](quire_book::BookStore).
///
/// At most one pass (or forced load, deletion, rename) runs per repository at
/// a time; callers sharing a [`RepoLocks`] registry share that guarantee.
pub struct SyncCoordinator {
    store: StoreHandle,
    locks: RepoLocks,
    extensions: Vec<String>,
}

impl SyncCoordinator {
    pub fn new(store: StoreHandle) -> Self {
        Self {
            store,
            locks: RepoLocks::default(),
            extensions: DEFAULT_EXTENSIONS.iter().map(ToString::to_string).collect(),
        }
    }

    /// Book file extensions, the first being used for new files. An empty
    /// list keeps the defaults.
    pub fn with_extensions<S: Into<String>>(mut self, extensions: impl IntoIterator<Item = S>) -> Self {
        let extensions: Vec<String> = extensions.into_iter().map(Into::into).collect();
        if !extensions.is_empty() {
            self.extensions = extensions;
        }
        self
    }

    pub fn with_locks(mut self, locks: RepoLocks) -> Self {
        self.locks = locks;
        self
    }

    pub fn locks(&self) -> &RepoLocks {
        &self.locks
    }

    pub fn extensions(&self) -> &[String] {
        &self.extensions
    }

    /// Run one full sync pass for the repository behind `git`.
    ///
    /// Phases, in order: bootstrap an empty collection from HEAD, commit local
    /// changes, link and commit orphaned books, fetch and integrate with the
    /// remote, apply remote changes, mark everything untouched as unchanged.
    /// A failure aborts the remaining phases; statuses written by earlier
    /// phases stay. Cancellation is honoured between phases.
    #[instrument(skip_all, fields(repo = %git.repo().url))]
    pub async fn sync(&self, git: &Arc<RepoSynchronizer>, cancel: &CancellationToken) -> Result<SyncReport> {
        let _guard = self.locks.lock(git.repo().id).await;
        let result = match Pass::prepare(self.store.as_ref(), git, &self.extensions, cancel).await {
            Ok(pass) => pass.run().await,
            Err(err) => Err(err),
        };
        match &result {
            Ok(report) => tracing::info!(outcome = ?report.outcome, books = report.statuses.len(), "sync finished"),
            Err(err) => tracing::warn!(error = %err, "sync failed"),
        }
        result
    }

    /// Pull the remote and reload one linked book from its file, discarding
    /// local changes to it.
    #[instrument(skip(self, git), fields(repo = %git.repo().url))]
    pub async fn force_load(&self, id: BookId, git: &Arc<RepoSynchronizer>) -> Result<BookView> {
        let _guard = self.locks.lock(git.repo().id).await;
        let view = self.linked_book(id, git).await?;
        git.ensure_clean().map_err(ErrorKind::git)?;
        pull(git).await?;

        let path = self.book_path(&view, git)?;
        let revision = git
            .current_revision(&path)
            .map_err(ErrorKind::git)?
            .ok_or_else(|| Error::from(ErrorKind::MissingFile(id)))?;
        let content = git.retrieve_file(&path).map_err(ErrorKind::git)?;
        let loaded =
            self.store.load_or_create_from_remote(view.name(), &revision, &content).await.or_raise(|| ErrorKind::Store)?;
        let action = BookAction::info(format!("Loaded from {path}"));
        self.store.set_last_action_and_status(id, &action, Some(SyncStatus::NoChange)).await.or_raise(|| ErrorKind::Store)?;
        tracing::info!(book = view.name(), path, "force-loaded book");
        Ok(loaded)
    }

    /// Delete a linked book's file from the repository, then the book itself.
    #[instrument(skip(self, git), fields(repo = %git.repo().url))]
    pub async fn delete_book(&self, id: BookId, git: &Arc<RepoSynchronizer>) -> Result<()> {
        let _guard = self.locks.lock(git.repo().id).await;
        let view = self.linked_book(id, git).await?;
        git.ensure_clean().map_err(ErrorKind::git)?;
        pull_applied(git).await?;

        let path = self.book_path(&view, git).ok();
        let committed = match &path {
            Some(path) => git.delete_and_commit(path, &git.settings().deletion_message(path)).map_err(ErrorKind::git)?,
            None => None,
        };
        self.store.delete_book(id).await.or_raise(|| ErrorKind::Store)?;
        if committed.is_some() {
            push_and_mark(git).await?;
        }
        tracing::info!(book = view.name(), path = ?path, "deleted book");
        Ok(())
    }

    /// Rename a linked book and its file in the repository.
    #[instrument(skip(self, git), fields(repo = %git.repo().url))]
    pub async fn rename_book(&self, id: BookId, name: &str, git: &Arc<RepoSynchronizer>) -> Result<BookView> {
        quire_book::validate_name(name).or_raise(|| ErrorKind::InvalidName(name.to_string()))?;
        let _guard = self.locks.lock(git.repo().id).await;
        let view = self.linked_book(id, git).await?;
        if self.store.book_view_by_name(name).await.or_raise(|| ErrorKind::Store)?.is_some() {
            exn::bail!(ErrorKind::NameTaken(name.to_string()));
        }
        git.ensure_clean().map_err(ErrorKind::git)?;
        pull_applied(git).await?;

        let from = self.book_path(&view, git).ok();
        let committed = match &from {
            Some(from) => {
                let extension = BookName::from_path(from, &self.extensions)
                    .map_or_else(|| self.default_extension().to_string(), |book| book.extension);
                let to = path_for(name, &extension);
                let message = git.settings().rename_message(from, &to);
                git.rename_and_commit(from, &to, &message).map_err(ErrorKind::git)?.map(|_| to)
            },
            None => None,
        };
        self.store.rename_book(id, name).await.or_raise(|| ErrorKind::Store)?;
        if let Some(to) = &committed {
            if let Some(revision) = git.current_revision(to).map_err(ErrorKind::git)? {
                self.store.set_synced_revision(id, &revision).await.or_raise(|| ErrorKind::Store)?;
            }
            push_and_mark(git).await?;
        }
        let action = BookAction::info(format!("Renamed from {}", view.name()));
        self.store.set_last_action_and_status(id, &action, view.status).await.or_raise(|| ErrorKind::Store)?;
        tracing::info!(from = view.name(), to = name, "renamed book");
        self.store.book_view(id).await.or_raise(|| ErrorKind::Store)?.ok_or_else(|| Error::from(ErrorKind::NotLinked(id)))
    }

    fn default_extension(&self) -> &str {
        self.extensions.first().map_or(DEFAULT_EXTENSIONS[0], String::as_str)
    }

    async fn linked_book(&self, id: BookId, git: &RepoSynchronizer) -> Result<BookView> {
        match self.store.book_view(id).await.or_raise(|| ErrorKind::Store)? {
            Some(view) if view.is_linked_to(git.repo().id) => Ok(view),
            _ => exn::bail!(ErrorKind::NotLinked(id)),
        }
    }

    /// The file a linked book lives in: its synced path, or the first
    /// existing file carrying its name.
    fn book_path(&self, view: &BookView, git: &RepoSynchronizer) -> Result<String> {
        if let Some(synced) = view.synced_to.as_ref().filter(|synced| synced.repo_id == git.repo().id) {
            return Ok(synced.file_uri.clone());
        }
        for extension in &self.extensions {
            let path = path_for(view.name(), extension);
            if git.current_revision(&path).map_err(ErrorKind::git)?.is_some() {
                return Ok(path);
            }
        }
        exn::bail!(ErrorKind::MissingFile(view.id()))
    }
}

/// Run a network operation on the blocking pool.
pub(crate) async fn network<T: Send + 'static>(
    git: &Arc<RepoSynchronizer>,
    operation: fn(&RepoSynchronizer) -> GitResult<T>,
) -> Result<T> {
    let git = Arc::clone(git);
    tokio::task::spawn_blocking(move || operation(&git))
        .await
        .or_raise(|| ErrorKind::Worker)?
        .map_err(ErrorKind::git)
}

/// Fetch and rebase onto the remote head.
///
/// Remote changes pulled here are not applied to books, so the last applied
/// remote head is pinned first for the next pass to diff from.
async fn pull(git: &Arc<RepoSynchronizer>) -> Result<Option<Oid>> {
    let remote = network(git, RepoSynchronizer::fetch).await?;
    if let (None, Some(remote), Some(head)) =
        (git.sync_marker().map_err(ErrorKind::git)?, remote, git.head().map_err(ErrorKind::git)?)
        && let Some(base) = git.merge_base(head, remote).map_err(ErrorKind::git)?
    {
        git.set_sync_marker(base).map_err(ErrorKind::git)?;
    }
    match git.rebase_onto_remote().map_err(ErrorKind::git)? {
        RebaseOutcome::Conflict => exn::bail!(ErrorKind::Diverged),
        RebaseOutcome::Success | RebaseOutcome::UpToDate => Ok(remote),
    }
}

/// [`pull`], refusing when the remote has changes not yet applied to books.
async fn pull_applied(git: &Arc<RepoSynchronizer>) -> Result<()> {
    let remote = pull(git).await?;
    if remote.is_some() && git.sync_marker().map_err(ErrorKind::git)? != remote {
        exn::bail!(ErrorKind::SyncRequired);
    }
    Ok(())
}

/// Push a commit made outside a pass and record the new remote head as
/// applied, so the next pass does not see the change as remote.
async fn push_and_mark(git: &Arc<RepoSynchronizer>) -> Result<()> {
    if network(git, RepoSynchronizer::push).await? == PushOutcome::Rejected {
        exn::bail!(ErrorKind::PushRejected);
    }
    if let Some(head) = git.remote_head().map_err(ErrorKind::git)? {
        git.set_sync_marker(head).map_err(ErrorKind::git)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests;
