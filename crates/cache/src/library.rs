//! [`BookStore`] over SQLite.

use async_trait::async_trait;
use exn::{OptionExt, ResultExt};
use quire_book::error::{ErrorKind, Result};
use quire_book::{BookAction, BookId, BookStore, BookView, Link, Repo, RepoId, RepoKind, SyncStatus, VersionedRevision};
use sqlx::{SqliteConnection, SqlitePool};
use tracing::instrument;

use crate::Database;
use crate::models::{BookRow, RepoRow};

/// The application's book store.
///
/// Content is kept verbatim: [`export_book`](BookStore::export_book) returns
/// exactly the bytes last written by [`create_book`](Self::create_book),
/// [`update_content`](Self::update_content) or a remote load. Every write that
/// touches more than one statement runs in a transaction.
#[derive(Debug, Clone)]
pub struct Library {
    pool: SqlitePool,
}
impl From<&Database> for Library {
    fn from(db: &Database) -> Self {
        Self { pool: db.pool().clone() }
    }
}

impl Library {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    // =========================================================================
    // Repositories
    // =========================================================================

    /// Register a new repository. Fails if one with the same URL exists.
    pub async fn add_repo(&self, kind: RepoKind, url: &str) -> Result<Repo> {
        let mut tx = self.pool.begin().await.or_raise(|| ErrorKind::Backend)?;
        if repo_by_url(&mut tx, url).await?.is_some() {
            exn::bail!(ErrorKind::AlreadyExists(url.to_string()));
        }
        let repo = insert_repo(&mut tx, kind, url).await?;
        tx.commit().await.or_raise(|| ErrorKind::Backend)?;
        Ok(repo)
    }

    /// The repository registered for `url`, registering it first if needed.
    ///
    /// An existing registration keeps its kind.
    pub async fn ensure_repo(&self, kind: RepoKind, url: &str) -> Result<Repo> {
        let mut tx = self.pool.begin().await.or_raise(|| ErrorKind::Backend)?;
        let repo = match repo_by_url(&mut tx, url).await? {
            Some(repo) => repo,
            None => insert_repo(&mut tx, kind, url).await?,
        };
        tx.commit().await.or_raise(|| ErrorKind::Backend)?;
        Ok(repo)
    }

    // =========================================================================
    // Local editing
    // =========================================================================

    /// Create a new, unlinked, dirty book.
    #[instrument(skip(self, content))]
    pub async fn create_book(&self, name: &str, content: &[u8]) -> Result<BookId> {
        self.insert_book(name, content, false).await
    }

    /// Create a placeholder book with no content.
    pub async fn create_dummy(&self, name: &str) -> Result<BookId> {
        self.insert_book(name, b"", true).await
    }

    async fn insert_book(&self, name: &str, content: &[u8], is_dummy: bool) -> Result<BookId> {
        quire_book::validate_name(name)?;
        let mut tx = self.pool.begin().await.or_raise(|| ErrorKind::Backend)?;
        if view_by_name(&mut tx, name).await?.is_some() {
            exn::bail!(ErrorKind::AlreadyExists(name.to_string()));
        }
        let (id,): (i64,) = sqlx::query_as(include_str!("../queries/insert_book.sql"))
            .bind(name)
            .bind(content)
            .bind(is_dummy)
            .bind(!is_dummy)
            .fetch_one(&mut *tx)
            .await
            .or_raise(|| ErrorKind::Backend)?;
        tx.commit().await.or_raise(|| ErrorKind::Backend)?;
        Ok(BookId(id))
    }

    /// Replace a book's content, marking it dirty.
    pub async fn update_content(&self, id: BookId, content: &[u8]) -> Result<()> {
        let result = sqlx::query(include_str!("../queries/update_content.sql"))
            .bind(content)
            .bind(id.0)
            .execute(&self.pool)
            .await
            .or_raise(|| ErrorKind::Backend)?;
        found(result.rows_affected(), id)
    }

    pub async fn content(&self, id: BookId) -> Result<Vec<u8>> {
        let row: Option<(Vec<u8>,)> = sqlx::query_as(include_str!("../queries/select_content.sql"))
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await
            .or_raise(|| ErrorKind::Backend)?;
        Ok(row.ok_or_raise(|| ErrorKind::BookNotFound(id))?.0)
    }

    /// Every book, ordered by name.
    pub async fn list_books(&self) -> Result<Vec<BookView>> {
        let rows: Vec<BookRow> = sqlx::query_as(include_str!("../queries/select_books.sql"))
            .fetch_all(&self.pool)
            .await
            .or_raise(|| ErrorKind::Backend)?;
        rows.into_iter().map(BookView::try_from).collect()
    }
}

#[async_trait]
impl BookStore for Library {
    async fn repos(&self) -> Result<Vec<Repo>> {
        let rows: Vec<RepoRow> = sqlx::query_as(include_str!("../queries/select_repos.sql"))
            .fetch_all(&self.pool)
            .await
            .or_raise(|| ErrorKind::Backend)?;
        rows.into_iter().map(Repo::try_from).collect()
    }

    async fn books_linked_to_repo(&self, repo: RepoId) -> Result<Vec<BookView>> {
        let rows: Vec<BookRow> = sqlx::query_as(include_str!("../queries/select_books_linked.sql"))
            .bind(repo.0)
            .fetch_all(&self.pool)
            .await
            .or_raise(|| ErrorKind::Backend)?;
        rows.into_iter().map(BookView::try_from).collect()
    }

    async fn books_without_link(&self) -> Result<Vec<BookView>> {
        let rows: Vec<BookRow> = sqlx::query_as(include_str!("../queries/select_books_unlinked.sql"))
            .fetch_all(&self.pool)
            .await
            .or_raise(|| ErrorKind::Backend)?;
        rows.into_iter().map(BookView::try_from).collect()
    }

    async fn book_view(&self, id: BookId) -> Result<Option<BookView>> {
        let mut conn = self.pool.acquire().await.or_raise(|| ErrorKind::Backend)?;
        view(&mut conn, id).await
    }

    async fn book_view_by_name(&self, name: &str) -> Result<Option<BookView>> {
        let mut conn = self.pool.acquire().await.or_raise(|| ErrorKind::Backend)?;
        view_by_name(&mut conn, name).await
    }

    async fn set_link(&self, id: BookId, link: &Link) -> Result<()> {
        let mut tx = self.pool.begin().await.or_raise(|| ErrorKind::Backend)?;
        let repo: Option<RepoRow> = sqlx::query_as(include_str!("../queries/select_repo.sql"))
            .bind(link.repo_id.0)
            .fetch_optional(&mut *tx)
            .await
            .or_raise(|| ErrorKind::Backend)?;
        if repo.is_none() {
            exn::bail!(ErrorKind::RepoNotFound(link.repo_id));
        }
        let result = sqlx::query(include_str!("../queries/set_link.sql"))
            .bind(link.repo_id.0)
            .bind(&link.url)
            .bind(id.0)
            .execute(&mut *tx)
            .await
            .or_raise(|| ErrorKind::Backend)?;
        found(result.rows_affected(), id)?;
        tx.commit().await.or_raise(|| ErrorKind::Backend)
    }

    async fn delete_link(&self, id: BookId) -> Result<()> {
        let result = sqlx::query(include_str!("../queries/delete_link.sql"))
            .bind(id.0)
            .execute(&self.pool)
            .await
            .or_raise(|| ErrorKind::Backend)?;
        found(result.rows_affected(), id)
    }

    #[instrument(skip(self, revision, content), fields(path = %revision.file_uri, revision = %revision.revision))]
    async fn load_or_create_from_remote(
        &self,
        name: &str,
        revision: &VersionedRevision,
        content: &[u8],
    ) -> Result<BookView> {
        quire_book::validate_name(name)?;
        let mut tx = self.pool.begin().await.or_raise(|| ErrorKind::Backend)?;
        let (id,): (i64,) = sqlx::query_as(include_str!("../queries/upsert_remote_book.sql"))
            .bind(name)
            .bind(content)
            .bind(revision.repo_id.0)
            .bind(&revision.repo_uri)
            .bind(revision.repo_id.0)
            .bind(revision.repo_kind.to_string())
            .bind(&revision.repo_uri)
            .bind(&revision.file_uri)
            .bind(&revision.revision)
            .bind(revision.modified.unix_timestamp())
            .fetch_one(&mut *tx)
            .await
            .or_raise(|| ErrorKind::Backend)?;
        let view = view(&mut tx, BookId(id)).await?.ok_or_raise(|| ErrorKind::BookNotFound(BookId(id)))?;
        tx.commit().await.or_raise(|| ErrorKind::Backend)?;
        tracing::debug!(book = %view.id(), "loaded book from repository");
        Ok(view)
    }

    async fn export_book(&self, id: BookId) -> Result<Vec<u8>> {
        self.content(id).await
    }

    async fn set_synced_revision(&self, id: BookId, revision: &VersionedRevision) -> Result<()> {
        let result = sqlx::query(include_str!("../queries/set_synced_revision.sql"))
            .bind(revision.repo_id.0)
            .bind(revision.repo_kind.to_string())
            .bind(&revision.repo_uri)
            .bind(&revision.file_uri)
            .bind(&revision.revision)
            .bind(revision.modified.unix_timestamp())
            .bind(id.0)
            .execute(&self.pool)
            .await
            .or_raise(|| ErrorKind::Backend)?;
        found(result.rows_affected(), id)
    }

    async fn set_last_action_and_status(
        &self,
        id: BookId,
        action: &BookAction,
        status: Option<SyncStatus>,
    ) -> Result<()> {
        let result = sqlx::query(include_str!("../queries/set_action.sql"))
            .bind(action.kind.to_string())
            .bind(&action.message)
            .bind(action.timestamp.unix_timestamp())
            .bind(status.map(|status| status.as_str()))
            .bind(id.0)
            .execute(&self.pool)
            .await
            .or_raise(|| ErrorKind::Backend)?;
        found(result.rows_affected(), id)
    }

    async fn mark_not_dirty(&self, id: BookId) -> Result<()> {
        let result = sqlx::query(include_str!("../queries/mark_not_dirty.sql"))
            .bind(id.0)
            .execute(&self.pool)
            .await
            .or_raise(|| ErrorKind::Backend)?;
        found(result.rows_affected(), id)
    }

    async fn rename_book(&self, id: BookId, name: &str) -> Result<()> {
        quire_book::validate_name(name)?;
        let mut tx = self.pool.begin().await.or_raise(|| ErrorKind::Backend)?;
        if view_by_name(&mut tx, name).await?.is_some_and(|other| other.id() != id) {
            exn::bail!(ErrorKind::AlreadyExists(name.to_string()));
        }
        let result = sqlx::query(include_str!("../queries/rename_book.sql"))
            .bind(name)
            .bind(id.0)
            .execute(&mut *tx)
            .await
            .or_raise(|| ErrorKind::Backend)?;
        found(result.rows_affected(), id)?;
        tx.commit().await.or_raise(|| ErrorKind::Backend)
    }

    async fn delete_book(&self, id: BookId) -> Result<()> {
        let result = sqlx::query(include_str!("../queries/delete_book.sql"))
            .bind(id.0)
            .execute(&self.pool)
            .await
            .or_raise(|| ErrorKind::Backend)?;
        found(result.rows_affected(), id)
    }
}

// =========================================================================
// Shared queries
// =========================================================================

fn found(rows_affected: u64, id: BookId) -> Result<()> {
    match rows_affected {
        0 => exn::bail!(ErrorKind::BookNotFound(id)),
        _ => Ok(()),
    }
}

async fn view(conn: &mut SqliteConnection, id: BookId) -> Result<Option<BookView>> {
    let row: Option<BookRow> = sqlx::query_as(include_str!("../queries/select_book.sql"))
        .bind(id.0)
        .fetch_optional(conn)
        .await
        .or_raise(|| ErrorKind::Backend)?;
    row.map(BookView::try_from).transpose()
}

async fn view_by_name(conn: &mut SqliteConnection, name: &str) -> Result<Option<BookView>> {
    let row: Option<BookRow> = sqlx::query_as(include_str!("../queries/select_book_by_name.sql"))
        .bind(name)
        .fetch_optional(conn)
        .await
        .or_raise(|| ErrorKind::Backend)?;
    row.map(BookView::try_from).transpose()
}

async fn repo_by_url(conn: &mut SqliteConnection, url: &str) -> Result<Option<Repo>> {
    let row: Option<RepoRow> = sqlx::query_as(include_str!("../queries/select_repo_by_url.sql"))
        .bind(url)
        .fetch_optional(conn)
        .await
        .or_raise(|| ErrorKind::Backend)?;
    row.map(Repo::try_from).transpose()
}

async fn insert_repo(conn: &mut SqliteConnection, kind: RepoKind, url: &str) -> Result<Repo> {
    sqlx::query(include_str!("../queries/insert_repo.sql"))
        .bind(kind.to_string())
        .bind(url)
        .execute(&mut *conn)
        .await
        .or_raise(|| ErrorKind::Backend)?;
    repo_by_url(conn, url).await?.ok_or_raise(|| ErrorKind::Backend)
}
