//! In-memory book store for testing.

use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::sync::RwLock;

use crate::BookStore;
use crate::error::{ErrorKind, Result};
use crate::models::{Book, BookAction, BookId, BookView, Link, Repo, RepoId, RepoKind, VersionedRevision};
use crate::name::validate as validate_name;
use crate::status::SyncStatus;

#[derive(Default)]
struct State {
    repos: BTreeMap<RepoId, Repo>,
    books: BTreeMap<BookId, (BookView, Vec<u8>)>,
    next_id: i64,
}

impl State {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn book_mut(&mut self, id: BookId) -> Result<&mut (BookView, Vec<u8>)> {
        self.books.get_mut(&id).ok_or_else(|| exn::Exn::from(ErrorKind::BookNotFound(id)))
    }
}

/// In-memory book store for testing.
///
/// Books and repositories live in maps behind a [`RwLock`], so all trait
/// methods operate on `&self`. Besides the [`BookStore`] operations it offers
/// the local editing calls a user interface would make (create, edit, read).
///
/// # Examples
///
/// ```
/// use quire_book::{BookStore, MockBookStore, RepoKind};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let store = MockBookStore::default();
/// store.add_repo(RepoKind::Git, "file:///tmp/remote.git").await;
/// let id = store.create_book("todo", b"* TODO buy milk").await?;
///
/// assert_eq!(store.repos().await?.len(), 1);
/// assert!(store.book_view(id).await?.unwrap().is_dirty());
/// # Ok(())
/// # }
/// ```
#[derive(Default)]
pub struct MockBookStore {
    state: RwLock<State>,
}

impl MockBookStore {
    /// Register a repository and return it.
    pub async fn add_repo(&self, kind: RepoKind, url: impl Into<String>) -> Repo {
        let mut state = self.state.write().await;
        let repo = Repo { id: RepoId(state.next_id()), kind, url: url.into() };
        state.repos.insert(repo.id, repo.clone());
        repo
    }

    /// Create a new, unlinked, dirty book.
    pub async fn create_book(&self, name: &str, content: &[u8]) -> Result<BookId> {
        self.insert(name, content, false).await
    }

    /// Create a placeholder book with no content.
    pub async fn create_dummy(&self, name: &str) -> Result<BookId> {
        self.insert(name, b"", true).await
    }

    async fn insert(&self, name: &str, content: &[u8], is_dummy: bool) -> Result<BookId> {
        validate_name(name)?;
        let mut state = self.state.write().await;
        if state.books.values().any(|(view, _)| view.name() == name) {
            exn::bail!(ErrorKind::AlreadyExists(name.to_string()));
        }
        let id = BookId(state.next_id());
        let view = BookView {
            book: Book { id, name: name.to_string(), is_dummy, is_dirty: !is_dummy },
            link: None,
            synced_to: None,
            last_action: None,
            status: None,
        };
        state.books.insert(id, (view, content.to_vec()));
        Ok(id)
    }

    /// Replace a book's content, marking it dirty.
    pub async fn edit(&self, id: BookId, content: &[u8]) -> Result<()> {
        let mut state = self.state.write().await;
        let (view, stored) = state.book_mut(id)?;
        view.book.is_dirty = true;
        view.book.is_dummy = false;
        *stored = content.to_vec();
        Ok(())
    }

    pub async fn content(&self, id: BookId) -> Result<Vec<u8>> {
        let state = self.state.read().await;
        let (_, content) = state.books.get(&id).ok_or_else(|| exn::Exn::from(ErrorKind::BookNotFound(id)))?;
        Ok(content.clone())
    }

    /// Every book, ordered by id.
    pub async fn all_books(&self) -> Vec<BookView> {
        self.state.read().await.books.values().map(|(view, _)| view.clone()).collect()
    }
}

#[async_trait]
impl BookStore for MockBookStore {
    async fn repos(&self) -> Result<Vec<Repo>> {
        Ok(self.state.read().await.repos.values().cloned().collect())
    }

    async fn books_linked_to_repo(&self, repo: RepoId) -> Result<Vec<BookView>> {
        let state = self.state.read().await;
        Ok(state.books.values().map(|(view, _)| view).filter(|view| view.is_linked_to(repo)).cloned().collect())
    }

    async fn books_without_link(&self) -> Result<Vec<BookView>> {
        let state = self.state.read().await;
        Ok(state.books.values().map(|(view, _)| view).filter(|view| !view.has_link()).cloned().collect())
    }

    async fn book_view(&self, id: BookId) -> Result<Option<BookView>> {
        Ok(self.state.read().await.books.get(&id).map(|(view, _)| view.clone()))
    }

    async fn book_view_by_name(&self, name: &str) -> Result<Option<BookView>> {
        let state = self.state.read().await;
        Ok(state.books.values().map(|(view, _)| view).find(|view| view.name() == name).cloned())
    }

    async fn set_link(&self, id: BookId, link: &Link) -> Result<()> {
        let mut state = self.state.write().await;
        if !state.repos.contains_key(&link.repo_id) {
            exn::bail!(ErrorKind::RepoNotFound(link.repo_id));
        }
        state.book_mut(id)?.0.link = Some(link.clone());
        Ok(())
    }

    async fn delete_link(&self, id: BookId) -> Result<()> {
        self.state.write().await.book_mut(id)?.0.link = None;
        Ok(())
    }

    async fn load_or_create_from_remote(
        &self,
        name: &str,
        revision: &VersionedRevision,
        content: &[u8],
    ) -> Result<BookView> {
        validate_name(name)?;
        let mut state = self.state.write().await;
        let existing = state.books.values().find(|(view, _)| view.name() == name).map(|(view, _)| view.id());
        let id = match existing {
            Some(id) => id,
            None => BookId(state.next_id()),
        };
        let last_action = existing.and_then(|id| state.books.get(&id)).and_then(|(view, _)| view.last_action.clone());
        let status = existing.and_then(|id| state.books.get(&id)).and_then(|(view, _)| view.status);
        let view = BookView {
            book: Book { id, name: name.to_string(), is_dummy: false, is_dirty: false },
            link: Some(Link { repo_id: revision.repo_id, url: revision.repo_uri.clone() }),
            synced_to: Some(revision.clone()),
            last_action,
            status,
        };
        state.books.insert(id, (view.clone(), content.to_vec()));
        Ok(view)
    }

    async fn export_book(&self, id: BookId) -> Result<Vec<u8>> {
        self.content(id).await
    }

    async fn set_synced_revision(&self, id: BookId, revision: &VersionedRevision) -> Result<()> {
        self.state.write().await.book_mut(id)?.0.synced_to = Some(revision.clone());
        Ok(())
    }

    async fn set_last_action_and_status(
        &self,
        id: BookId,
        action: &BookAction,
        status: Option<SyncStatus>,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        let (view, _) = state.book_mut(id)?;
        view.last_action = Some(action.clone());
        view.status = status;
        Ok(())
    }

    async fn mark_not_dirty(&self, id: BookId) -> Result<()> {
        self.state.write().await.book_mut(id)?.0.book.is_dirty = false;
        Ok(())
    }

    async fn rename_book(&self, id: BookId, name: &str) -> Result<()> {
        validate_name(name)?;
        let mut state = self.state.write().await;
        if state.books.values().any(|(view, _)| view.name() == name && view.id() != id) {
            exn::bail!(ErrorKind::AlreadyExists(name.to_string()));
        }
        state.book_mut(id)?.0.book.name = name.to_string();
        Ok(())
    }

    async fn delete_book(&self, id: BookId) -> Result<()> {
        match self.state.write().await.books.remove(&id) {
            Some(_) => Ok(()),
            None => exn::bail!(ErrorKind::BookNotFound(id)),
        }
    }
}
