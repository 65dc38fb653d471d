use super::*;
use futures::StreamExt;
use git2::{Repository, RepositoryInitOptions};
use quire_book::{BookStore, MockBookStore, Repo, RepoKind};
use quire_git::{CredentialTransport, GitSettings, repository};
use std::fs;
use std::path::Path;
use tempfile::TempDir;

/// A bare repository standing in for the shared remote.
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

    fn branch(&self, name: &str) -> Option<Oid> {
        let bare = Repository::open_bare(self.dir.path()).unwrap();
        bare.refname_to_id(&format!("refs/heads/{name}")).ok()
    }

    /// Content of a file on the remote's main branch.
    fn file(&self, path: &str) -> Option<String> {
        let bare = Repository::open_bare(self.dir.path()).unwrap();
        let head = bare.refname_to_id("refs/heads/main").ok()?;
        let tree = bare.find_commit(head).unwrap().tree().unwrap();
        let entry = tree.get_path(Path::new(path)).ok()?;
        let blob = bare.find_blob(entry.id()).unwrap();
        Some(String::from_utf8(blob.content().to_vec()).unwrap())
    }

    /// Working copy of this remote for `repo`.
    fn clone_for(&self, repo: Repo) -> (TempDir, Arc<RepoSynchronizer>) {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(CredentialTransport::default());
        let settings = GitSettings::default();
        let repository = repository::clone(&self.url, dir.path(), &settings, transport.as_ref()).unwrap();
        (dir, Arc::new(RepoSynchronizer::new(repository, repo, settings, transport)))
    }

    /// Commit and push files the way another client would.
    fn seed(&self, files: &[(&str, &str)]) {
        let repo = Repo { id: RepoId(99), kind: RepoKind::Git, url: self.url.clone() };
        let (_dir, git) = self.clone_for(repo);
        let files: Vec<(&str, &[u8])> = files.iter().map(|(path, content)| (*path, content.as_bytes())).collect();
        git.stage_and_commit(&files, "seed").unwrap();
        assert_eq!(git.push().unwrap(), PushOutcome::Accepted);
    }

    /// Move the remote out of reach until [`Remote::reconnect`].
    fn disconnect(&self) {
        fs::rename(self.dir.path(), self.dir.path().with_extension("offline")).unwrap();
    }

    fn reconnect(&self) {
        fs::rename(self.dir.path().with_extension("offline"), self.dir.path()).unwrap();
    }

    async fn device(&self) -> Device {
        Device::new(self, Arc::new(MockBookStore::default())).await
    }
}

/// One client: its own book store, working copy and coordinator.
struct Device {
    dir: TempDir,
    store: Arc<MockBookStore>,
    git: Arc<RepoSynchronizer>,
    coordinator: SyncCoordinator,
}

impl Device {
    async fn new(remote: &Remote, store: Arc<MockBookStore>) -> Self {
        let repo = store.add_repo(RepoKind::Git, remote.url.clone()).await;
        let (dir, git) = remote.clone_for(repo);
        let coordinator = SyncCoordinator::new(store.clone());
        Self { dir, store, git, coordinator }
    }

    async fn sync(&self) -> Result<SyncReport> {
        self.coordinator.sync(&self.git, &CancellationToken::new()).await
    }

    async fn create(&self, name: &str, content: &str) -> BookId {
        self.store.create_book(name, content.as_bytes()).await.unwrap()
    }

    async fn edit(&self, name: &str, content: &str) {
        let id = self.book(name).await.id();
        self.store.edit(id, content.as_bytes()).await.unwrap();
    }

    async fn book(&self, name: &str) -> BookView {
        self.store.book_view_by_name(name).await.unwrap().unwrap()
    }

    async fn content(&self, name: &str) -> String {
        let id = self.book(name).await.id();
        String::from_utf8(self.store.content(id).await.unwrap()).unwrap()
    }
}

fn only_status(report: &SyncReport) -> Vec<SyncStatus> {
    report.statuses.values().copied().collect()
}

#[tokio::test]
async fn test_new_book_is_pushed_and_sync_is_idempotent() {
    let remote = Remote::new();
    let device = remote.device().await;
    device.create("todo", "* TODO buy milk\n").await;

    let report = device.sync().await.unwrap();
    assert_eq!(report.outcome, SyncOutcome::Completed);
    assert_eq!(report.status("todo"), Some(SyncStatus::OnlyBookWithoutLinkAndOneRepo));
    let book = device.book("todo").await;
    assert!(book.has_link());
    assert!(!book.is_dirty());
    assert_eq!(book.synced_to.unwrap().file_uri, "todo.org");
    assert_eq!(remote.file("todo.org").as_deref(), Some("* TODO buy milk\n"));

    let head = remote.branch("main");
    for _ in 0..2 {
        let report = device.sync().await.unwrap();
        assert_eq!(report.outcome, SyncOutcome::Completed);
        assert_eq!(only_status(&report), [SyncStatus::NoChange]);
        assert_eq!(remote.branch("main"), head);
    }
    assert_eq!(device.book("todo").await.status, Some(SyncStatus::NoChange));
}

#[tokio::test]
async fn test_todo_round_trip_between_devices() {
    let remote = Remote::new();
    let laptop = remote.device().await;
    laptop.create("todo", "* TODO write report\n").await;
    laptop.sync().await.unwrap();

    let phone = remote.device().await;
    let report = phone.sync().await.unwrap();
    assert_eq!(report.status("todo"), Some(SyncStatus::NoBookOneRevision));
    assert_eq!(phone.content("todo").await, "* TODO write report\n");
    assert!(!phone.book("todo").await.is_dirty());

    phone.edit("todo", "* DONE write report\n").await;
    let report = phone.sync().await.unwrap();
    assert_eq!(report.status("todo"), Some(SyncStatus::BookWithLinkLocalModified));
    assert_eq!(remote.file("todo.org").as_deref(), Some("* DONE write report\n"));

    let report = laptop.sync().await.unwrap();
    assert_eq!(report.status("todo"), Some(SyncStatus::BookWithLinkRemoteModified));
    assert_eq!(laptop.content("todo").await, "* DONE write report\n");

    let report = laptop.sync().await.unwrap();
    assert_eq!(report.status("todo"), Some(SyncStatus::NoChange));
}

#[tokio::test]
async fn test_new_remote_book_is_loaded_after_bootstrap() {
    let remote = Remote::new();
    let laptop = remote.device().await;
    laptop.create("todo", "a\n").await;
    laptop.sync().await.unwrap();
    let phone = remote.device().await;
    phone.sync().await.unwrap();

    remote.seed(&[("journal/2024.org", "* day one\n")]);
    let report = phone.sync().await.unwrap();
    assert_eq!(report.status("journal/2024"), Some(SyncStatus::NoBookOneRevision));
    assert_eq!(report.status("todo"), Some(SyncStatus::NoChange));
    assert_eq!(phone.content("journal/2024").await, "* day one\n");
}

#[tokio::test]
async fn test_dummy_is_replaced_by_remote_book() {
    let remote = Remote::new();
    remote.seed(&[("todo.org", "remote\n")]);
    let device = remote.device().await;
    device.store.create_dummy("todo").await.unwrap();

    let report = device.sync().await.unwrap();
    assert_eq!(report.status("todo"), Some(SyncStatus::DummyWithoutLinkOneRevision));
    let book = device.book("todo").await;
    assert!(!book.is_dummy());
    assert!(book.has_link());
    assert_eq!(device.content("todo").await, "remote\n");
}

#[tokio::test]
async fn test_edits_to_different_lines_are_merged() {
    let original = "1\n2\n3\n4\n5\n6\n7\n8\n9\n";
    let remote = Remote::new();
    let laptop = remote.device().await;
    laptop.create("todo", original).await;
    laptop.sync().await.unwrap();
    let phone = remote.device().await;
    phone.sync().await.unwrap();

    laptop.edit("todo", &original.replace("1\n", "one\n")).await;
    laptop.sync().await.unwrap();
    phone.edit("todo", &original.replace("9\n", "nine\n")).await;

    let report = phone.sync().await.unwrap();
    assert_eq!(report.outcome, SyncOutcome::Completed);
    assert_eq!(report.status("todo"), Some(SyncStatus::ConflictBothModified));
    let merged = "one\n2\n3\n4\n5\n6\n7\n8\nnine\n";
    assert_eq!(phone.content("todo").await, merged);
    assert!(!phone.book("todo").await.is_dirty());
    assert_eq!(remote.file("todo.org").as_deref(), Some(merged));

    let report = laptop.sync().await.unwrap();
    assert_eq!(report.status("todo"), Some(SyncStatus::BookWithLinkRemoteModified));
    assert_eq!(laptop.content("todo").await, merged);
}

#[tokio::test]
async fn test_conflicting_edits_go_to_conflict_branch() {
    let remote = Remote::new();
    let laptop = remote.device().await;
    laptop.create("todo", "line\n").await;
    laptop.sync().await.unwrap();
    let phone = remote.device().await;
    phone.sync().await.unwrap();

    laptop.edit("todo", "laptop\n").await;
    laptop.sync().await.unwrap();
    phone.edit("todo", "phone\n").await;

    let report = phone.sync().await.unwrap();
    assert!(matches!(report.outcome, SyncOutcome::CompletedWithConflicts(_)));
    assert_eq!(report.status("todo"), Some(SyncStatus::ConflictSavedToTempBranch));

    // The remote main branch keeps the other side, the conflict branch holds ours.
    assert_eq!(remote.file("todo.org").as_deref(), Some("laptop\n"));
    assert_eq!(remote.branch("quire-conflict"), phone.git.head().unwrap());
    // Locally nothing was lost.
    let book = phone.book("todo").await;
    assert!(book.is_dirty());
    assert_eq!(phone.content("todo").await, "phone\n");
    assert_eq!(book.last_action.unwrap().kind, quire_book::ActionKind::Error);
}

#[tokio::test]
async fn test_conflict_persists_on_later_passes() {
    let remote = Remote::new();
    let laptop = remote.device().await;
    laptop.create("todo", "line\n").await;
    laptop.create("notes", "first\n").await;
    laptop.sync().await.unwrap();
    let phone = remote.device().await;
    phone.sync().await.unwrap();

    laptop.edit("todo", "laptop\n").await;
    laptop.sync().await.unwrap();
    phone.edit("todo", "phone\n").await;
    phone.edit("notes", "second\n").await;

    for _ in 0..2 {
        let report = phone.sync().await.unwrap();
        assert!(matches!(report.outcome, SyncOutcome::CompletedWithConflicts(_)));
        assert_eq!(report.status("todo"), Some(SyncStatus::ConflictSavedToTempBranch));
        assert_eq!(report.status("notes"), Some(SyncStatus::ConflictSavedToTempBranch));
        assert_eq!(remote.branch("quire-conflict"), phone.git.head().unwrap());
        assert_eq!(remote.file("todo.org").as_deref(), Some("laptop\n"));
        assert_eq!(remote.file("notes.org").as_deref(), Some("first\n"));
        assert!(phone.book("todo").await.is_dirty());
        assert!(phone.book("notes").await.is_dirty());
    }
    assert_eq!(phone.content("todo").await, "phone\n");
    assert_eq!(phone.content("notes").await, "second\n");
}

#[tokio::test]
async fn test_new_book_is_pushed_after_remote_was_unreachable() {
    let remote = Remote::new();
    let device = remote.device().await;
    device.create("todo", "* TODO call back\n").await;

    remote.disconnect();
    let err = device.sync().await.unwrap_err();
    remote.reconnect();
    assert!(matches!(&*err, ErrorKind::RemoteUnreachable));
    assert!(device.book("todo").await.is_dirty());
    assert_eq!(remote.file("todo.org"), None);

    let report = device.sync().await.unwrap();
    assert_eq!(report.outcome, SyncOutcome::Completed);
    assert_eq!(report.status("todo"), Some(SyncStatus::BookWithLinkLocalModified));
    let book = device.book("todo").await;
    assert!(!book.is_dirty());
    assert_eq!(book.synced_to.unwrap().file_uri, "todo.org");
    assert_eq!(remote.file("todo.org").as_deref(), Some("* TODO call back\n"));

    let report = device.sync().await.unwrap();
    assert_eq!(only_status(&report), [SyncStatus::NoChange]);
    assert!(!device.book("todo").await.is_dirty());
}

#[tokio::test]
async fn test_edit_is_pushed_after_remote_was_unreachable() {
    let remote = Remote::new();
    let device = remote.device().await;
    device.create("todo", "one\n").await;
    device.sync().await.unwrap();
    device.edit("todo", "two\n").await;

    remote.disconnect();
    let err = device.sync().await.unwrap_err();
    remote.reconnect();
    assert!(matches!(&*err, ErrorKind::RemoteUnreachable));
    assert_eq!(remote.file("todo.org").as_deref(), Some("one\n"));

    let report = device.sync().await.unwrap();
    assert_eq!(report.outcome, SyncOutcome::Completed);
    assert_eq!(report.status("todo"), Some(SyncStatus::BookWithLinkLocalModified));
    let book = device.book("todo").await;
    assert!(!book.is_dirty());
    assert_eq!(book.synced_to.unwrap().revision, device.git.head().unwrap().unwrap().to_string());
    assert_eq!(remote.file("todo.org").as_deref(), Some("two\n"));

    let report = device.sync().await.unwrap();
    assert_eq!(only_status(&report), [SyncStatus::NoChange]);
}

#[tokio::test]
async fn test_dirty_working_tree_is_refused() {
    let remote = Remote::new();
    let device = remote.device().await;
    device.create("todo", "a\n").await;
    fs::write(device.dir.path().join("stray.txt"), b"untracked").unwrap();

    let err = device.sync().await.unwrap_err();
    assert!(matches!(&*err, ErrorKind::WorkingTreeDirty));
    assert!(!device.book("todo").await.has_link());
    assert_eq!(remote.branch("main"), None);
    assert!(matches!(SyncOutcome::of(&Err(err)), SyncOutcome::Failed(_)));
}

#[tokio::test]
async fn test_remote_rename_is_rejected_without_partial_update() {
    let remote = Remote::new();
    let laptop = remote.device().await;
    laptop.create("a", "a\n").await;
    laptop.create("b", "b\n").await;
    laptop.sync().await.unwrap();
    let phone = remote.device().await;
    phone.sync().await.unwrap();
    let phone_head = phone.git.head().unwrap();

    laptop.git.rename_and_commit("a.org", "c.org", "rename").unwrap();
    laptop.git.stage_and_commit(&[("b.org", b"b changed\n")], "edit").unwrap();
    assert_eq!(laptop.git.push().unwrap(), PushOutcome::Accepted);

    let err = phone.sync().await.unwrap_err();
    assert!(matches!(&*err, ErrorKind::RemoteChangeUnsupported(path) if path == "c.org"));
    assert_eq!(phone.content("b").await, "b\n");
    assert!(phone.book("a").await.has_link());
    assert_eq!(phone.git.head().unwrap(), phone_head);

    // Still refused on the next attempt.
    assert!(phone.sync().await.is_err());
}

#[tokio::test]
async fn test_orphan_is_left_alone_with_multiple_repositories() {
    let remote = Remote::new();
    let store = Arc::new(MockBookStore::default());
    let device = Device::new(&remote, Arc::clone(&store)).await;
    store.add_repo(RepoKind::Git, "file:///elsewhere.git").await;
    device.create("todo", "a\n").await;

    let report = device.sync().await.unwrap();
    assert_eq!(report.status("todo"), Some(SyncStatus::OnlyBookWithoutLinkAndMultipleRepos));
    let book = device.book("todo").await;
    assert!(!book.has_link());
    assert!(book.last_action.unwrap().message.contains("multiple repositories"));
    assert_eq!(remote.branch("main"), None);
}

#[tokio::test]
async fn test_remote_deletion_removes_link() {
    let remote = Remote::new();
    let laptop = remote.device().await;
    let id = laptop.create("todo", "a\n").await;
    laptop.sync().await.unwrap();
    let phone = remote.device().await;
    phone.sync().await.unwrap();

    laptop.coordinator.delete_book(id, &laptop.git).await.unwrap();
    assert!(laptop.store.book_view(id).await.unwrap().is_none());
    assert_eq!(remote.file("todo.org"), None);
    // The deletion is not reported back to the device that made it.
    assert!(laptop.sync().await.unwrap().statuses.is_empty());

    let report = phone.sync().await.unwrap();
    assert_eq!(report.status("todo"), Some(SyncStatus::RevisionNoLongerExists));
    let book = phone.book("todo").await;
    assert!(!book.has_link());
    assert!(book.has_sync());

    // Never pushed back automatically.
    let report = phone.sync().await.unwrap();
    assert_eq!(report.status("todo"), Some(SyncStatus::BookWithPreviousErrorAndNoLink));
    assert_eq!(remote.file("todo.org"), None);
}

#[tokio::test]
async fn test_rename_book() {
    let remote = Remote::new();
    let device = remote.device().await;
    let id = device.create("todo", "a\n").await;
    device.create("taken", "b\n").await;
    device.sync().await.unwrap();

    let err = device.coordinator.rename_book(id, "taken", &device.git).await.unwrap_err();
    assert!(matches!(&*err, ErrorKind::NameTaken(_)));
    let err = device.coordinator.rename_book(id, "../escape", &device.git).await.unwrap_err();
    assert!(matches!(&*err, ErrorKind::InvalidName(_)));

    let view = device.coordinator.rename_book(id, "done", &device.git).await.unwrap();
    assert_eq!(view.name(), "done");
    assert_eq!(view.synced_to.unwrap().file_uri, "done.org");
    assert_eq!(remote.file("todo.org"), None);
    assert_eq!(remote.file("done.org").as_deref(), Some("a\n"));

    // The rename is not mistaken for an unsupported remote change.
    let report = device.sync().await.unwrap();
    assert_eq!(report.status("done"), Some(SyncStatus::NoChange));
}

#[tokio::test]
async fn test_force_load_discards_local_changes() {
    let remote = Remote::new();
    let laptop = remote.device().await;
    laptop.create("todo", "a\n").await;
    laptop.sync().await.unwrap();
    let phone = remote.device().await;
    phone.sync().await.unwrap();

    laptop.edit("todo", "from laptop\n").await;
    laptop.sync().await.unwrap();
    phone.edit("todo", "unsaved\n").await;

    let id = phone.book("todo").await.id();
    let view = phone.coordinator.force_load(id, &phone.git).await.unwrap();
    assert!(!view.is_dirty());
    assert_eq!(phone.content("todo").await, "from laptop\n");
    assert_eq!(phone.book("todo").await.status, Some(SyncStatus::NoChange));

    let report = phone.sync().await.unwrap();
    assert_eq!(report.status("todo"), Some(SyncStatus::NoChange));
}

#[tokio::test]
async fn test_force_load_requires_link() {
    let remote = Remote::new();
    let device = remote.device().await;
    let id = device.create("todo", "a\n").await;
    let err = device.coordinator.force_load(id, &device.git).await.unwrap_err();
    assert!(matches!(&*err, ErrorKind::NotLinked(_)));
}

#[tokio::test]
async fn test_ignored_files_are_not_loaded() {
    let remote = Remote::new();
    remote.seed(&[(".quireignore", "private/\n"), ("private/diary.org", "secret\n"), ("notes.org", "n\n")]);
    let device = remote.device().await;

    let report = device.sync().await.unwrap();
    assert_eq!(report.statuses.keys().collect::<Vec<_>>(), ["notes"]);
    assert!(device.store.book_view_by_name("private/diary").await.unwrap().is_none());
}

#[tokio::test]
async fn test_cancelled_pass_writes_nothing() {
    let remote = Remote::new();
    let device = remote.device().await;
    device.create("todo", "a\n").await;
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = device.coordinator.sync(&device.git, &cancel).await.unwrap_err();
    assert!(matches!(&*err, ErrorKind::Cancelled));
    assert!(!device.book("todo").await.has_link());
    assert_eq!(device.book("todo").await.status, None);
}

#[tokio::test]
async fn test_only_integrally_synced_kinds_are_driven() {
    let remote = Remote::new();
    let store = Arc::new(MockBookStore::default());
    let repo = store.add_repo(RepoKind::Directory, remote.url.clone()).await;
    let (_dir, git) = remote.clone_for(repo);
    let coordinator = SyncCoordinator::new(store);

    let err = coordinator.sync(&git, &CancellationToken::new()).await.unwrap_err();
    assert!(matches!(&*err, ErrorKind::UnsupportedRepoKind(RepoKind::Directory)));
}

#[tokio::test]
async fn test_unregistered_repository_is_refused() {
    let remote = Remote::new();
    let repo = Repo { id: RepoId(7), kind: RepoKind::Git, url: remote.url.clone() };
    let (_dir, git) = remote.clone_for(repo);
    let coordinator = SyncCoordinator::new(Arc::new(MockBookStore::default()));

    let err = coordinator.sync(&git, &CancellationToken::new()).await.unwrap_err();
    assert!(matches!(&*err, ErrorKind::UnknownRepo(RepoId(7))));
}

#[tokio::test]
async fn test_sync_all_reports_every_repository() {
    let (work, home) = (Remote::new(), Remote::new());
    work.seed(&[("meetings.org", "m\n")]);
    home.seed(&[("groceries.org", "g\n")]);

    let store = Arc::new(MockBookStore::default());
    let work_repo = store.add_repo(RepoKind::Git, work.url.clone()).await;
    let home_repo = store.add_repo(RepoKind::Git, home.url.clone()).await;
    let (_work_dir, work_git) = work.clone_for(work_repo.clone());
    let (_home_dir, home_git) = home.clone_for(home_repo.clone());
    let coordinator = SyncCoordinator::new(store.clone());
    let cancel = CancellationToken::new();

    let repos = [work_git, home_git];
    let events: Vec<_> = coordinator.sync_all(&repos, &cancel).collect().await;
    assert_eq!(events.first(), Some(&SyncEvent::Started(2)));
    assert_eq!(events.last(), Some(&SyncEvent::Complete));
    let mut finished: Vec<_> = events
        .iter()
        .filter_map(|event| match event {
            SyncEvent::Finished(repo, outcome) => Some((*repo, outcome.clone())),
            _ => None,
        })
        .collect();
    finished.sort_by_key(|(repo, _)| *repo);
    assert_eq!(finished, [(work_repo.id, SyncOutcome::Completed), (home_repo.id, SyncOutcome::Completed)]);

    let meetings = store.book_view_by_name("meetings").await.unwrap().unwrap();
    assert!(meetings.is_linked_to(work_repo.id));
    let groceries = store.book_view_by_name("groceries").await.unwrap().unwrap();
    assert!(groceries.is_linked_to(home_repo.id));
}

#[tokio::test]
async fn test_passes_for_one_repository_are_serialized() {
    let remote = Remote::new();
    let device = remote.device().await;
    let guard = device.coordinator.locks().lock(device.git.repo().id).await;
    assert!(device.coordinator.locks().try_lock(device.git.repo().id).is_none());
    drop(guard);
    device.create("todo", "a\n").await;
    device.sync().await.unwrap();
    assert!(device.coordinator.locks().try_lock(device.git.repo().id).is_some());
}
