use exn::ResultExt;
use git2::build::CheckoutBuilder;
use git2::{
    Commit, DiffFindOptions, ErrorCode, FetchOptions, Index, ObjectType, Oid, PushOptions, RemoteCallbacks,
    Repository, Sort, Status, StatusOptions, Tree, TreeWalkMode, TreeWalkResult,
};
use quire_book::{Repo, VersionedRevision};
use std::cell::RefCell;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use time::OffsetDateTime;
use tokio::sync::mpsc::UnboundedSender;
use tracing::instrument;

use crate::diff::FileChange;
use crate::error::{ErrorKind, Result};
use crate::path::{to_repo_string, validate as validate_path};
use crate::settings::GitSettings;
use crate::transport::TransportConfigurator;

/// Result of pushing the local branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Fast-forward or already up to date.
    Accepted,
    /// The remote has commits the local branch lacks.
    Rejected,
}

/// Result of replaying local commits onto the fetched remote head.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebaseOutcome {
    /// Local branch now contains the remote head (rebased or fast-forwarded).
    Success,
    /// Nothing to integrate.
    UpToDate,
    /// Replaying hit a conflict. The rebase was aborted and the working copy
    /// is exactly as it was before.
    Conflict,
}

/// Messages reported by the remote during network operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GitEvent {
    /// Text the remote printed on its sideband channel.
    RemoteProgress(String),
    /// The remote refused to update a reference.
    RefRejected { refname: String, message: String },
}

/// Git operations for one repository, each upholding the clean working tree
/// invariant: anything that changes the working copy first checks that there
/// is nothing uncommitted in it, and refuses to run otherwise.
///
/// All methods block. Network operations ([`fetch`](Self::fetch),
/// [`push`](Self::push), [`push_to_conflict_branch`](Self::push_to_conflict_branch))
/// should be moved off async executors by the caller.
pub struct RepoSynchronizer {
    repository: Mutex<Repository>,
    repo: Repo,
    settings: GitSettings,
    transport: Arc<dyn TransportConfigurator>,
    events: Option<UnboundedSender<GitEvent>>,
}

impl RepoSynchronizer {
    pub fn new(
        repository: Repository,
        repo: Repo,
        settings: GitSettings,
        transport: Arc<dyn TransportConfigurator>,
    ) -> Self {
        Self { repository: Mutex::new(repository), repo, settings, transport, events: None }
    }

    /// Report remote messages on `events`.
    pub fn with_events(mut self, events: UnboundedSender<GitEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// The repository record revisions are attributed to.
    pub fn repo(&self) -> &Repo {
        &self.repo
    }

    pub fn settings(&self) -> &GitSettings {
        &self.settings
    }

    fn git(&self) -> MutexGuard<'_, Repository> {
        // A panic in another operation cannot leave libgit2 state half-written
        // in memory; the on-disk state is what matters.
        self.repository.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn callbacks(&self) -> RemoteCallbacks<'static> {
        let mut callbacks = self.transport.remote_callbacks();
        if let Some(events) = self.events.clone() {
            callbacks.sideband_progress(move |data| {
                let text = String::from_utf8_lossy(data).trim().to_string();
                if !text.is_empty() {
                    tracing::debug!(message = %text, "remote");
                    _ = events.send(GitEvent::RemoteProgress(text));
                }
                true
            });
        }
        callbacks
    }

    // =========================================================================
    // Working tree
    // =========================================================================

    /// Fails with [`WorkingTreeDirty`](ErrorKind::WorkingTreeDirty) if any file
    /// is modified, staged or untracked. Ignored files do not count.
    pub fn ensure_clean(&self) -> Result<()> {
        check_clean(&self.git())
    }

    /// Write each file into the working tree, stage it and commit.
    ///
    /// Returns `None` without committing when the staged tree equals HEAD's.
    pub fn stage_and_commit(&self, files: &[(&str, &[u8])], message: &str) -> Result<Option<Oid>> {
        let repo = self.git();
        check_clean(&repo)?;
        let root = workdir(&repo)?;
        let mut index = repo.index().or_raise(|| ErrorKind::Git)?;
        for (path, content) in files {
            let relative = validate_path(path)?;
            write_into(&root, &relative, content)?;
            index.add_path(&relative).or_raise(|| ErrorKind::Git)?;
        }
        index.write().or_raise(|| ErrorKind::Git)?;
        self.commit_index(&repo, &mut index, message)
    }

    /// Remove a file from the working tree and commit the deletion.
    pub fn delete_and_commit(&self, path: &str, message: &str) -> Result<Option<Oid>> {
        let repo = self.git();
        check_clean(&repo)?;
        let root = workdir(&repo)?;
        let relative = validate_path(path)?;
        let full = root.join(&relative);
        if !full.is_file() {
            exn::bail!(ErrorKind::NotFound(relative));
        }
        fs::remove_file(&full).map_err(ErrorKind::from)?;
        let mut index = repo.index().or_raise(|| ErrorKind::Git)?;
        index.remove_path(&relative).or_raise(|| ErrorKind::Git)?;
        index.write().or_raise(|| ErrorKind::Git)?;
        self.commit_index(&repo, &mut index, message)
    }

    /// Move a file within the working tree and commit the move.
    ///
    /// Refuses to overwrite an existing destination.
    pub fn rename_and_commit(&self, from: &str, to: &str, message: &str) -> Result<Option<Oid>> {
        let repo = self.git();
        check_clean(&repo)?;
        let root = workdir(&repo)?;
        let (from, to) = (validate_path(from)?, validate_path(to)?);
        if !root.join(&from).is_file() {
            exn::bail!(ErrorKind::NotFound(from));
        }
        if root.join(&to).exists() {
            exn::bail!(ErrorKind::AlreadyExists(to));
        }
        if let Some(parent) = root.join(&to).parent() {
            fs::create_dir_all(parent).map_err(ErrorKind::from)?;
        }
        fs::rename(root.join(&from), root.join(&to)).map_err(ErrorKind::from)?;
        let mut index = repo.index().or_raise(|| ErrorKind::Git)?;
        index.remove_path(&from).or_raise(|| ErrorKind::Git)?;
        index.add_path(&to).or_raise(|| ErrorKind::Git)?;
        index.write().or_raise(|| ErrorKind::Git)?;
        self.commit_index(&repo, &mut index, message)
    }

    /// Read a file from the working tree, which matches HEAD while clean.
    pub fn retrieve_file(&self, path: &str) -> Result<Vec<u8>> {
        let root = workdir(&self.git())?;
        let relative = validate_path(path)?;
        fs::read(root.join(&relative)).map_err(|err| match err.kind() {
            std::io::ErrorKind::NotFound => exn::Exn::from(ErrorKind::NotFound(relative)),
            _ => exn::Exn::from(ErrorKind::Io(err)),
        })
    }

    /// Write a file into the working tree without staging it.
    pub fn write_file(&self, path: &str, content: &[u8]) -> Result<()> {
        let root = workdir(&self.git())?;
        write_into(&root, &validate_path(path)?, content)
    }

    fn commit_index(&self, repo: &Repository, index: &mut Index, message: &str) -> Result<Option<Oid>> {
        let tree_id = index.write_tree().or_raise(|| ErrorKind::Git)?;
        let parent = match head_id(repo)? {
            Some(id) => Some(repo.find_commit(id).or_raise(|| ErrorKind::Git)?),
            None => None,
        };
        let tree = repo.find_tree(tree_id).or_raise(|| ErrorKind::Git)?;
        let unchanged = match &parent {
            Some(parent) => parent.tree_id() == tree_id,
            None => tree.is_empty(),
        };
        if unchanged {
            tracing::debug!(message, "nothing to commit");
            return Ok(None);
        }
        let signature = self.settings.signature()?;
        let parents: Vec<&Commit<'_>> = parent.iter().collect();
        let id = repo
            .commit(Some("HEAD"), &signature, &signature, message, &tree, &parents)
            .or_raise(|| ErrorKind::Git)?;
        tracing::info!(commit = %id, message, "committed");
        Ok(Some(id))
    }

    // =========================================================================
    // Remote
    // =========================================================================

    /// Fetch all remote branches. Returns the remote head of the configured
    /// branch, `None` when the remote does not have it (empty remote).
    ///
    /// Never touches the working tree.
    #[instrument(skip(self), fields(remote = %self.settings.remote))]
    pub fn fetch(&self) -> Result<Option<Oid>> {
        let repo = self.git();
        let unreachable = || ErrorKind::RemoteUnreachable(self.settings.remote.clone());
        let mut remote = repo.find_remote(&self.settings.remote).or_raise(unreachable)?;
        let mut options = FetchOptions::new();
        options.remote_callbacks(self.callbacks());
        let refspec = format!("+refs/heads/*:refs/remotes/{}/*", self.settings.remote);
        remote.fetch(&[refspec], Some(&mut options), None).or_raise(unreachable)?;
        let head = remote_head(&repo, &self.settings)?;
        tracing::debug!(head = ?head, "fetched");
        Ok(head)
    }

    /// Push the configured branch.
    #[instrument(skip(self), fields(remote = %self.settings.remote, branch = %self.settings.branch))]
    pub fn push(&self) -> Result<PushOutcome> {
        let repo = self.git();
        let Some(head) = head_id(&repo)? else {
            return Ok(PushOutcome::Accepted);
        };
        let refspec = format!("refs/heads/{0}:refs/heads/{0}", self.settings.branch);
        match self.push_refspec(&repo, &refspec)? {
            None => {
                repo.reference(&self.settings.tracking_ref(), head, true, "quire: push")
                    .or_raise(|| ErrorKind::Git)?;
                tracing::info!(commit = %head, "pushed");
                Ok(PushOutcome::Accepted)
            },
            Some(message) if is_non_fast_forward(&message) => {
                tracing::info!(message, "push rejected");
                Ok(PushOutcome::Rejected)
            },
            Some(message) => exn::bail!(ErrorKind::PushHardFailure(message)),
        }
    }

    /// Force-push the local branch head to the conflict branch. The local
    /// branch is left untouched.
    #[instrument(skip(self), fields(branch = %self.settings.conflict_branch))]
    pub fn push_to_conflict_branch(&self) -> Result<()> {
        let repo = self.git();
        let refspec = format!("+refs/heads/{}:refs/heads/{}", self.settings.branch, self.settings.conflict_branch);
        if let Some(message) = self.push_refspec(&repo, &refspec)? {
            exn::bail!(ErrorKind::ConflictBranch(message));
        }
        tracing::warn!("local changes pushed to conflict branch");
        Ok(())
    }

    /// Returns the remote's rejection message, if it refused the update.
    fn push_refspec(&self, repo: &Repository, refspec: &str) -> Result<Option<String>> {
        let unreachable = || ErrorKind::RemoteUnreachable(self.settings.remote.clone());
        let mut remote = repo.find_remote(&self.settings.remote).or_raise(unreachable)?;

        let rejection: Rc<RefCell<Option<String>>> = Rc::default();
        let captured = Rc::clone(&rejection);
        let events = self.events.clone();
        let mut callbacks = self.callbacks();
        callbacks.push_update_reference(move |refname, status| {
            if let Some(message) = status {
                tracing::warn!(refname, message, "remote rejected reference update");
                if let Some(events) = &events {
                    _ = events.send(GitEvent::RefRejected { refname: refname.into(), message: message.into() });
                }
                *captured.borrow_mut() = Some(message.to_string());
            }
            Ok(())
        });
        let mut options = PushOptions::new();
        options.remote_callbacks(callbacks);

        match remote.push(&[refspec], Some(&mut options)) {
            Ok(()) => Ok(rejection.borrow_mut().take()),
            Err(err) if err.code() == ErrorCode::NotFastForward || is_non_fast_forward(err.message()) => {
                Ok(Some(err.message().to_string()))
            },
            Err(err) => {
                let message = err.message().to_string();
                Err(err).or_raise(|| ErrorKind::PushHardFailure(message))
            },
        }
    }

    /// Replay local commits onto the fetched remote head.
    ///
    /// Fast-forwards when there is nothing local to replay. On conflict the
    /// rebase is aborted and [`RebaseOutcome::Conflict`] returned.
    #[instrument(skip(self))]
    pub fn rebase_onto_remote(&self) -> Result<RebaseOutcome> {
        let repo = self.git();
        check_clean(&repo)?;
        let Some(upstream_id) = remote_head(&repo, &self.settings)? else {
            return Ok(RebaseOutcome::UpToDate);
        };
        let local_ref = self.settings.local_ref();
        let Some(head) = head_id(&repo)? else {
            // Nothing committed locally: adopt the remote branch.
            repo.reference(&local_ref, upstream_id, true, "quire: adopt remote branch")
                .or_raise(|| ErrorKind::Git)?;
            repo.set_head(&local_ref).or_raise(|| ErrorKind::Git)?;
            repo.checkout_head(Some(CheckoutBuilder::new().force())).or_raise(|| ErrorKind::Git)?;
            return Ok(RebaseOutcome::Success);
        };
        if head == upstream_id || is_descendant(&repo, head, upstream_id)? {
            return Ok(RebaseOutcome::UpToDate);
        }
        if is_descendant(&repo, upstream_id, head)? {
            let target = repo.find_object(upstream_id, Some(ObjectType::Commit)).or_raise(|| ErrorKind::Git)?;
            repo.checkout_tree(&target, Some(CheckoutBuilder::new().force())).or_raise(|| ErrorKind::Git)?;
            repo.reference(&local_ref, upstream_id, true, "quire: fast-forward").or_raise(|| ErrorKind::Git)?;
            tracing::info!(commit = %upstream_id, "fast-forwarded");
            return Ok(RebaseOutcome::Success);
        }

        let branch = repo.head().and_then(|head| repo.reference_to_annotated_commit(&head)).or_raise(|| ErrorKind::Git)?;
        let upstream = repo.find_annotated_commit(upstream_id).or_raise(|| ErrorKind::Git)?;
        let signature = self.settings.signature()?;
        let mut rebase = repo.rebase(Some(&branch), Some(&upstream), None, None).or_raise(|| ErrorKind::Rebase)?;
        while let Some(operation) = rebase.next() {
            let conflicted = match operation {
                Ok(_) => repo.index().or_raise(|| ErrorKind::Git)?.has_conflicts(),
                Err(err) if matches!(err.code(), ErrorCode::Conflict | ErrorCode::MergeConflict) => true,
                Err(err) => {
                    _ = rebase.abort();
                    return Err(err).or_raise(|| ErrorKind::Rebase);
                },
            };
            if conflicted {
                rebase.abort().or_raise(|| ErrorKind::Rebase)?;
                tracing::warn!("rebase conflicted and was aborted");
                return Ok(RebaseOutcome::Conflict);
            }
            match rebase.commit(None, &signature, None) {
                Ok(_) => {},
                // The patch is already upstream.
                Err(err) if err.code() == ErrorCode::Applied => {},
                Err(err) => {
                    _ = rebase.abort();
                    return Err(err).or_raise(|| ErrorKind::Rebase);
                },
            }
        }
        rebase.finish(Some(&signature)).or_raise(|| ErrorKind::Rebase)?;
        tracing::info!(onto = %upstream_id, "rebased local commits");
        Ok(RebaseOutcome::Success)
    }

    // =========================================================================
    // History
    // =========================================================================

    /// The commit HEAD points at, `None` before the first commit.
    pub fn head(&self) -> Result<Option<Oid>> {
        head_id(&self.git())
    }

    /// The last fetched remote head of the configured branch.
    pub fn remote_head(&self) -> Result<Option<Oid>> {
        remote_head(&self.git(), &self.settings)
    }

    /// The remote head whose changes were last applied to the local books.
    pub fn sync_marker(&self) -> Result<Option<Oid>> {
        match self.git().refname_to_id(&self.settings.marker_ref()) {
            Ok(id) => Ok(Some(id)),
            Err(err) if err.code() == ErrorCode::NotFound => Ok(None),
            Err(err) => Err(err).or_raise(|| ErrorKind::Git),
        }
    }

    pub fn set_sync_marker(&self, id: Oid) -> Result<()> {
        self.git()
            .reference(&self.settings.marker_ref(), id, true, "quire: remote changes applied")
            .or_raise(|| ErrorKind::Git)?;
        Ok(())
    }

    pub fn merge_base(&self, one: Oid, two: Oid) -> Result<Option<Oid>> {
        match self.git().merge_base(one, two) {
            Ok(id) => Ok(Some(id)),
            Err(err) if err.code() == ErrorCode::NotFound => Ok(None),
            Err(err) => Err(err).or_raise(|| ErrorKind::Git),
        }
    }

    /// Whether the local branch carries commits the fetched remote head lacks.
    pub fn has_unpushed_commits(&self) -> Result<bool> {
        let repo = self.git();
        let Some(head) = head_id(&repo)? else {
            return Ok(false);
        };
        match remote_head(&repo, &self.settings)? {
            None => Ok(true),
            Some(remote) => Ok(head != remote && !is_descendant(&repo, remote, head)?),
        }
    }

    /// Whether the commit `revision` is reachable from the fetched remote head.
    pub fn is_published(&self, revision: &str) -> Result<bool> {
        let repo = self.git();
        let id = Oid::from_str(revision).or_raise(|| ErrorKind::Git)?;
        match remote_head(&repo, &self.settings)? {
            None => Ok(false),
            Some(remote) => Ok(remote == id || is_descendant(&repo, remote, id)?),
        }
    }

    /// Paths changed by the local commits the fetched remote head lacks.
    pub fn unpushed_paths(&self) -> Result<Vec<String>> {
        let (head, remote) = {
            let repo = self.git();
            (head_id(&repo)?, remote_head(&repo, &self.settings)?)
        };
        let Some(head) = head else {
            return Ok(Vec::new());
        };
        let base = match remote {
            Some(remote) => self.merge_base(head, remote)?,
            None => None,
        };
        if base == Some(head) {
            return Ok(Vec::new());
        }
        let mut paths = Vec::new();
        for change in self.diff_between(base, head)? {
            for path in [change.old_path, change.new_path].into_iter().flatten() {
                if !paths.contains(&path) {
                    paths.push(path);
                }
            }
        }
        Ok(paths)
    }

    /// Per-path changes between two commits, with rename and copy detection
    /// so that such changes are reported rather than guessed.
    ///
    /// `from = None` diffs against the empty tree.
    pub fn diff_between(&self, from: Option<Oid>, to: Oid) -> Result<Vec<FileChange>> {
        let repo = self.git();
        let tree_of = |id: Oid| repo.find_commit(id).and_then(|commit| commit.tree()).or_raise(|| ErrorKind::Git);
        let old = from.map(tree_of).transpose()?;
        let new = tree_of(to)?;
        let mut diff = repo.diff_tree_to_tree(old.as_ref(), Some(&new), None).or_raise(|| ErrorKind::Git)?;
        diff.find_similar(Some(DiffFindOptions::new().renames(true).copies(true))).or_raise(|| ErrorKind::Git)?;
        Ok(diff.deltas().map(FileChange::from).collect())
    }

    /// The revision of `path` at HEAD: the last commit that touched it.
    ///
    /// `None` when the file does not exist at HEAD.
    pub fn current_revision(&self, path: &str) -> Result<Option<VersionedRevision>> {
        let repo = self.git();
        let relative = validate_path(path)?;
        last_commit_touching(&repo, &relative)?
            .map(|commit| self.revision_of(&relative, &commit))
            .transpose()
    }

    /// The revisions of every file at HEAD accepted by `filter`.
    pub fn revisions(&self, filter: impl Fn(&str) -> bool) -> Result<Vec<VersionedRevision>> {
        let repo = self.git();
        let Some(head) = head_id(&repo)? else {
            return Ok(Vec::new());
        };
        let tree = repo.find_commit(head).and_then(|commit| commit.tree()).or_raise(|| ErrorKind::Git)?;
        let mut revisions = Vec::new();
        for path in tree_files(&tree)?.into_iter().filter(|path| filter(path)) {
            let relative = validate_path(&path)?;
            if let Some(commit) = last_commit_touching(&repo, &relative)? {
                revisions.push(self.revision_of(&relative, &commit)?);
            }
        }
        Ok(revisions)
    }

    fn revision_of(&self, path: &Path, commit: &Commit<'_>) -> Result<VersionedRevision> {
        Ok(VersionedRevision {
            repo_id: self.repo.id,
            repo_kind: self.repo.kind,
            repo_uri: self.repo.url.clone(),
            file_uri: to_repo_string(path)?,
            revision: commit.id().to_string(),
            modified: OffsetDateTime::from_unix_timestamp(commit.time().seconds())
                .unwrap_or(OffsetDateTime::UNIX_EPOCH),
        })
    }
}

fn workdir(repo: &Repository) -> Result<PathBuf> {
    repo.workdir()
        .map(Path::to_path_buf)
        .ok_or_else(|| exn::Exn::from(ErrorKind::NotARepository(repo.path().to_path_buf())))
}

fn write_into(root: &Path, relative: &Path, content: &[u8]) -> Result<()> {
    let full = root.join(relative);
    if let Some(parent) = full.parent() {
        fs::create_dir_all(parent).map_err(ErrorKind::from)?;
    }
    fs::write(&full, content).map_err(ErrorKind::from)?;
    Ok(())
}

fn check_clean(repo: &Repository) -> Result<()> {
    let mut options = StatusOptions::new();
    options.include_untracked(true).recurse_untracked_dirs(true).include_ignored(false);
    let statuses = repo.statuses(Some(&mut options)).or_raise(|| ErrorKind::Git)?;
    let dirty: Vec<String> = statuses
        .iter()
        .filter(|entry| entry.status() != Status::CURRENT && !entry.status().contains(Status::IGNORED))
        .map(|entry| entry.path().unwrap_or("<non-utf8 path>").to_string())
        .collect();
    match dirty.is_empty() {
        true => Ok(()),
        false => exn::bail!(ErrorKind::WorkingTreeDirty(dirty)),
    }
}

fn head_id(repo: &Repository) -> Result<Option<Oid>> {
    match repo.head() {
        Ok(head) => Ok(head.target()),
        Err(err) if matches!(err.code(), ErrorCode::UnbornBranch | ErrorCode::NotFound) => Ok(None),
        Err(err) => Err(err).or_raise(|| ErrorKind::Git),
    }
}

fn remote_head(repo: &Repository, settings: &GitSettings) -> Result<Option<Oid>> {
    match repo.refname_to_id(&settings.tracking_ref()) {
        Ok(id) => Ok(Some(id)),
        Err(err) if err.code() == ErrorCode::NotFound => Ok(None),
        Err(err) => Err(err).or_raise(|| ErrorKind::Git),
    }
}

fn is_descendant(repo: &Repository, commit: Oid, ancestor: Oid) -> Result<bool> {
    repo.graph_descendant_of(commit, ancestor).or_raise(|| ErrorKind::Git)
}

fn is_non_fast_forward(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    ["non-fast-forward", "non-fastforwardable", "fetch first", "not present locally"]
        .iter()
        .any(|needle| message.contains(needle))
}

fn blob_at(tree: &Tree<'_>, path: &Path) -> Option<Oid> {
    tree.get_path(path).ok().filter(|entry| entry.kind() == Some(ObjectType::Blob)).map(|entry| entry.id())
}

/// The newest commit reachable from HEAD whose version of `path` differs from
/// all of its parents' versions.
fn last_commit_touching<'r>(repo: &'r Repository, path: &Path) -> Result<Option<Commit<'r>>> {
    let Some(head) = head_id(repo)? else {
        return Ok(None);
    };
    let head_tree = repo.find_commit(head).and_then(|commit| commit.tree()).or_raise(|| ErrorKind::Git)?;
    if blob_at(&head_tree, path).is_none() {
        return Ok(None);
    }
    let mut walk = repo.revwalk().or_raise(|| ErrorKind::Git)?;
    walk.set_sorting(Sort::TOPOLOGICAL | Sort::TIME).or_raise(|| ErrorKind::Git)?;
    walk.push(head).or_raise(|| ErrorKind::Git)?;
    for id in walk {
        let commit = id.and_then(|id| repo.find_commit(id)).or_raise(|| ErrorKind::Git)?;
        let here = blob_at(&commit.tree().or_raise(|| ErrorKind::Git)?, path);
        if here.is_none() {
            continue;
        }
        let touched = commit.parents().all(|parent| parent.tree().ok().and_then(|tree| blob_at(&tree, path)) != here);
        if touched {
            return Ok(Some(commit));
        }
    }
    Ok(None)
}

fn tree_files(tree: &Tree<'_>) -> Result<Vec<String>> {
    let mut files = Vec::new();
    tree.walk(TreeWalkMode::PreOrder, |root, entry| {
        if entry.kind() == Some(ObjectType::Blob)
            && let Some(name) = entry.name()
        {
            files.push(format!("{root}{name}"));
        }
        TreeWalkResult::Ok
    })
    .or_raise(|| ErrorKind::Git)?;
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::ChangeKind;
    use crate::repository;
    use crate::transport::CredentialTransport;
    use git2::{Delta, RepositoryInitOptions};
    use quire_book::{RepoId, RepoKind};
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    /// A bare remote plus any number of device working copies cloned from it.
    struct Remote {
        dir: TempDir,
        url: String,
    }

    impl Remote {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            Repository::init_opts(dir.path(), RepositoryInitOptions::new().bare(true).initial_head("main")).unwrap();
            let url = dir.path().to_str().unwrap().to_string();
            Self { dir, url }
        }

        fn device(&self) -> (TempDir, RepoSynchronizer) {
            let dir = TempDir::new().unwrap();
            let transport = Arc::new(CredentialTransport::default());
            let settings = GitSettings::default();
            let repository = repository::clone(&self.url, dir.path(), &settings, transport.as_ref()).unwrap();
            let repo = Repo { id: RepoId(1), kind: RepoKind::Git, url: self.url.clone() };
            (dir, RepoSynchronizer::new(repository, repo, settings, transport))
        }

        fn branch(&self, name: &str) -> Option<Oid> {
            let bare = Repository::open_bare(self.dir.path()).unwrap();
            bare.refname_to_id(&format!("refs/heads/{name}")).ok()
        }
    }

    fn commit(device: &RepoSynchronizer, path: &str, content: &str) -> Oid {
        device.stage_and_commit(&[(path, content.as_bytes())], &format!("write {path}")).unwrap().unwrap()
    }

    #[test]
    fn test_clean_tree_detection() {
        let remote = Remote::new();
        let (dir, device) = remote.device();
        device.ensure_clean().unwrap();

        fs::write(dir.path().join("stray.org"), b"untracked").unwrap();
        let err = device.ensure_clean().unwrap_err();
        assert!(matches!(&*err, ErrorKind::WorkingTreeDirty(paths) if paths == &["stray.org".to_string()]));
    }

    #[test]
    fn test_mutations_refuse_dirty_tree_and_change_nothing() {
        let remote = Remote::new();
        let (dir, device) = remote.device();
        commit(&device, "todo.org", "one");
        fs::write(dir.path().join("todo.org"), b"edited outside").unwrap();
        let head = device.head().unwrap();

        let err = device.stage_and_commit(&[("other.org", b"x")], "msg").unwrap_err();
        assert!(matches!(&*err, ErrorKind::WorkingTreeDirty(_)));
        assert!(!dir.path().join("other.org").exists());
        assert_eq!(device.head().unwrap(), head);

        let err = device.rebase_onto_remote().unwrap_err();
        assert!(matches!(&*err, ErrorKind::WorkingTreeDirty(_)));
        assert_eq!(fs::read(dir.path().join("todo.org")).unwrap(), b"edited outside");
    }

    #[test]
    fn test_stage_and_commit_skips_empty_commits() {
        let remote = Remote::new();
        let (_dir, device) = remote.device();
        let first = commit(&device, "todo.org", "content");
        assert_eq!(device.stage_and_commit(&[("todo.org", b"content")], "again").unwrap(), None);
        assert_eq!(device.head().unwrap(), Some(first));
        // Nothing at all on an empty repository either.
        let (_dir, empty) = Remote::new().device();
        assert_eq!(empty.stage_and_commit(&[], "nothing").unwrap(), None);
    }

    #[test]
    fn test_stage_and_commit_rejects_escaping_paths() {
        let (_dir, device) = Remote::new().device();
        let err = device.stage_and_commit(&[("../escape.org", b"x")], "msg").unwrap_err();
        assert!(matches!(&*err, ErrorKind::InvalidPath(_)));
    }

    #[test]
    fn test_push_to_empty_remote_then_fetch_elsewhere() {
        let remote = Remote::new();
        let (_a_dir, a) = remote.device();
        let (_b_dir, b) = remote.device();
        assert_eq!(b.fetch().unwrap(), None);

        let id = commit(&a, "todo.org", "from a");
        assert!(a.has_unpushed_commits().unwrap());
        assert_eq!(a.push().unwrap(), PushOutcome::Accepted);
        assert!(!a.has_unpushed_commits().unwrap());
        assert_eq!(remote.branch("main"), Some(id));

        assert_eq!(b.fetch().unwrap(), Some(id));
        assert_eq!(b.rebase_onto_remote().unwrap(), RebaseOutcome::Success);
        assert_eq!(b.retrieve_file("todo.org").unwrap(), b"from a");
        assert_eq!(b.rebase_onto_remote().unwrap(), RebaseOutcome::UpToDate);
    }

    #[test]
    fn test_diverged_push_is_rejected_then_rebased() {
        let remote = Remote::new();
        let (_a_dir, a) = remote.device();
        let (_b_dir, b) = remote.device();
        commit(&a, "base.org", "base");
        a.push().unwrap();
        b.fetch().unwrap();
        b.rebase_onto_remote().unwrap();

        commit(&a, "a.org", "from a");
        a.push().unwrap();
        commit(&b, "b.org", "from b");
        b.fetch().unwrap();
        assert_eq!(b.push().unwrap(), PushOutcome::Rejected);

        assert_eq!(b.rebase_onto_remote().unwrap(), RebaseOutcome::Success);
        assert_eq!(b.push().unwrap(), PushOutcome::Accepted);
        assert_eq!(b.retrieve_file("a.org").unwrap(), b"from a");
        assert_eq!(b.retrieve_file("b.org").unwrap(), b"from b");
    }

    #[test]
    fn test_conflicting_rebase_is_aborted_and_pushed_to_conflict_branch() {
        let remote = Remote::new();
        let (_a_dir, a) = remote.device();
        let (b_dir, b) = remote.device();
        commit(&a, "todo.org", "line\n");
        a.push().unwrap();
        b.fetch().unwrap();
        b.rebase_onto_remote().unwrap();

        commit(&a, "todo.org", "line from a\n");
        a.push().unwrap();
        let local = commit(&b, "todo.org", "line from b\n");
        b.fetch().unwrap();
        assert_eq!(b.push().unwrap(), PushOutcome::Rejected);
        assert_eq!(b.rebase_onto_remote().unwrap(), RebaseOutcome::Conflict);

        // Nothing changed locally.
        assert_eq!(b.head().unwrap(), Some(local));
        assert_eq!(fs::read(b_dir.path().join("todo.org")).unwrap(), b"line from b\n");
        b.ensure_clean().unwrap();

        b.push_to_conflict_branch().unwrap();
        assert_eq!(remote.branch("quire-conflict"), Some(local));
        assert_ne!(remote.branch("main"), Some(local));
    }

    #[test]
    fn test_conflict_branch_is_overwritten() {
        let remote = Remote::new();
        let (_dir, device) = remote.device();
        commit(&device, "todo.org", "one");
        device.push_to_conflict_branch().unwrap();
        let second = commit(&device, "todo.org", "two");
        device.push_to_conflict_branch().unwrap();
        assert_eq!(remote.branch("quire-conflict"), Some(second));
    }

    #[test]
    fn test_push_to_missing_remote_is_unreachable() {
        let remote = Remote::new();
        let (_dir, device) = remote.device();
        commit(&device, "todo.org", "one");
        device.git().remote_delete("origin").unwrap();
        let err = device.push().unwrap_err();
        assert!(matches!(&*err, ErrorKind::RemoteUnreachable(_)));
        let err = device.fetch().unwrap_err();
        assert!(matches!(&*err, ErrorKind::RemoteUnreachable(_)));
    }

    #[test]
    fn test_diff_between_classifies_changes() {
        let (_dir, device) = Remote::new().device();
        commit(&device, "keep.org", "keep");
        commit(&device, "modify.org", "before");
        let from = commit(&device, "delete.org", "delete me");
        commit(&device, "modify.org", "after");
        commit(&device, "add.org", "new");
        let to = device.delete_and_commit("delete.org", "remove").unwrap().unwrap();

        let mut changes = device.diff_between(Some(from), to).unwrap();
        changes.sort_by(|a, b| a.path().cmp(b.path()));
        let summary: Vec<_> = changes.iter().map(|c| (c.path(), c.kind)).collect();
        assert_eq!(
            summary,
            vec![("add.org", ChangeKind::Add), ("delete.org", ChangeKind::Delete), ("modify.org", ChangeKind::Modify)]
        );
    }

    #[test]
    fn test_diff_between_reports_renames_as_unsupported() {
        let (_dir, device) = Remote::new().device();
        let from = commit(&device, "old.org", "some content that is long enough to be similar\n");
        let to = device.rename_and_commit("old.org", "new.org", "move").unwrap().unwrap();
        let changes = device.diff_between(Some(from), to).unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].kind, ChangeKind::Unsupported(Delta::Renamed));
        assert!(!changes[0].is_supported());
    }

    #[test]
    fn test_diff_from_nothing_adds_everything() {
        let (_dir, device) = Remote::new().device();
        commit(&device, "a.org", "a");
        let to = commit(&device, "b.org", "b");
        let changes = device.diff_between(None, to).unwrap();
        assert!(changes.iter().all(|c| c.kind == ChangeKind::Add));
        assert_eq!(changes.len(), 2);
    }

    #[test]
    fn test_current_revision_is_last_commit_touching_path() {
        let (_dir, device) = Remote::new().device();
        let todo = commit(&device, "todo.org", "todo");
        commit(&device, "other.org", "other");
        let revision = device.current_revision("todo.org").unwrap().unwrap();
        assert_eq!(revision.revision, todo.to_string());
        assert_eq!(revision.file_uri, "todo.org");
        assert_eq!(revision.repo_id, RepoId(1));
        assert!(device.current_revision("missing.org").unwrap().is_none());
    }

    #[test]
    fn test_revisions_apply_filter() {
        let (_dir, device) = Remote::new().device();
        commit(&device, "a.org", "a");
        commit(&device, "notes/b.org", "b");
        commit(&device, "image.png", "png");
        let mut paths: Vec<_> =
            device.revisions(|path| path.ends_with(".org")).unwrap().into_iter().map(|r| r.file_uri).collect();
        paths.sort();
        assert_eq!(paths, vec!["a.org", "notes/b.org"]);
    }

    #[test]
    fn test_rename_and_delete_guards() {
        let (_dir, device) = Remote::new().device();
        commit(&device, "a.org", "a");
        commit(&device, "b.org", "b");
        let err = device.rename_and_commit("a.org", "b.org", "msg").unwrap_err();
        assert!(matches!(&*err, ErrorKind::AlreadyExists(_)));
        let err = device.rename_and_commit("missing.org", "c.org", "msg").unwrap_err();
        assert!(matches!(&*err, ErrorKind::NotFound(_)));
        let err = device.delete_and_commit("missing.org", "msg").unwrap_err();
        assert!(matches!(&*err, ErrorKind::NotFound(_)));
    }

    #[test]
    fn test_sync_marker() {
        let (_dir, device) = Remote::new().device();
        assert_eq!(device.sync_marker().unwrap(), None);
        let id = commit(&device, "a.org", "a");
        device.set_sync_marker(id).unwrap();
        assert_eq!(device.sync_marker().unwrap(), Some(id));
    }

    #[test]
    fn test_merge_base() {
        let remote = Remote::new();
        let (_a_dir, a) = remote.device();
        let base = commit(&a, "a.org", "a");
        let one = commit(&a, "a.org", "b");
        assert_eq!(a.merge_base(base, one).unwrap(), Some(base));
    }

    #[test]
    fn test_published_and_unpushed() {
        let remote = Remote::new();
        let (_dir, device) = remote.device();
        let pushed = commit(&device, "a.org", "a");
        device.push().unwrap();
        device.fetch().unwrap();
        assert!(device.is_published(&pushed.to_string()).unwrap());
        assert!(device.unpushed_paths().unwrap().is_empty());

        let local = commit(&device, "b.org", "b");
        commit(&device, "a.org", "a2");
        assert!(!device.is_published(&local.to_string()).unwrap());
        assert!(device.is_published(&pushed.to_string()).unwrap());
        let mut paths = device.unpushed_paths().unwrap();
        paths.sort();
        assert_eq!(paths, vec!["a.org".to_string(), "b.org".to_string()]);
    }

    #[test]
    fn test_rejections_are_reported_on_the_event_channel() {
        let remote = Remote::new();
        let (_a_dir, a) = remote.device();
        let (_b_dir, b) = remote.device();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let b = b.with_events(tx);
        commit(&a, "a.org", "a");
        a.push().unwrap();
        commit(&b, "b.org", "b");
        b.fetch().unwrap();
        assert_eq!(b.push().unwrap(), PushOutcome::Rejected);
        // Local transports refuse before contacting the remote; others report
        // a reference rejection. Either way nothing else is emitted.
        while let Ok(event) = rx.try_recv() {
            assert!(matches!(event, GitEvent::RefRejected { .. } | GitEvent::RemoteProgress(_)));
        }
    }
}
