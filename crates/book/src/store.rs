use async_trait::async_trait;

use crate::error::Result;
use crate::models::{BookAction, BookId, BookView, Link, Repo, RepoId, VersionedRevision};
use crate::status::SyncStatus;

/// Persistent local database of books, their links and last synced revisions.
///
/// The sync engine only ever talks to books through this trait. Every method
/// operates on `&self`, implementations provide their own synchronisation.
///
/// # Implementations
///
/// - `quire_cache::Library`: SQLite, the store used by the application.
/// - [`MockBookStore`](crate::MockBookStore): in memory, for tests (`mock`
///   feature).
///
/// # Errors
///
/// Methods addressing a single book return
/// [`BookNotFound`](crate::error::ErrorKind::BookNotFound) when the id is
/// unknown. Backend failures surface as
/// [`Backend`](crate::error::ErrorKind::Backend).
#[async_trait]
pub trait BookStore: Send + Sync {
    /// All registered repositories.
    async fn repos(&self) -> Result<Vec<Repo>>;

    /// Books whose link points at `repo`.
    async fn books_linked_to_repo(&self, repo: RepoId) -> Result<Vec<BookView>>;

    /// Books that have no link at all.
    async fn books_without_link(&self) -> Result<Vec<BookView>>;

    async fn book_view(&self, id: BookId) -> Result<Option<BookView>>;

    async fn book_view_by_name(&self, name: &str) -> Result<Option<BookView>>;

    /// Link a book to a repository, replacing any previous link.
    async fn set_link(&self, id: BookId, link: &Link) -> Result<()>;

    /// Remove a book's link. The synced revision is kept.
    async fn delete_link(&self, id: BookId) -> Result<()>;

    /// Create or overwrite the book called `name` with remotely loaded content.
    ///
    /// The book becomes a regular (not dummy), clean book linked to the
    /// revision's repository and synced to `revision`.
    async fn load_or_create_from_remote(
        &self,
        name: &str,
        revision: &VersionedRevision,
        content: &[u8],
    ) -> Result<BookView>;

    /// Serialize a book's content for storage in a repository.
    async fn export_book(&self, id: BookId) -> Result<Vec<u8>>;

    async fn set_synced_revision(&self, id: BookId, revision: &VersionedRevision) -> Result<()>;

    async fn set_last_action_and_status(
        &self,
        id: BookId,
        action: &BookAction,
        status: Option<SyncStatus>,
    ) -> Result<()>;

    async fn mark_not_dirty(&self, id: BookId) -> Result<()>;

    /// Give a book a new name. Fails with
    /// [`AlreadyExists`](crate::error::ErrorKind::AlreadyExists) if the name is taken.
    async fn rename_book(&self, id: BookId, name: &str) -> Result<()>;

    /// Remove a book and everything recorded about it.
    async fn delete_book(&self, id: BookId) -> Result<()>;
}
