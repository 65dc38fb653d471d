use exn::{OptionExt, ResultExt};
use quire_book::error::{Error, ErrorKind};
use quire_book::{
    ActionKind, Book, BookAction, BookId, BookView, Link, Repo, RepoId, RepoKind, SyncStatus, VersionedRevision,
};
use time::OffsetDateTime;

#[derive(sqlx::FromRow)]
pub(crate) struct RepoRow {
    id: i64,
    kind: String,
    url: String,
}
impl TryFrom<RepoRow> for Repo {
    type Error = Error;
    fn try_from(row: RepoRow) -> Result<Self, Self::Error> {
        Ok(Repo { id: RepoId(row.id), kind: kind(&row.kind)?, url: row.url })
    }
}

/// One row of `books`, without the content.
#[derive(sqlx::FromRow)]
pub(crate) struct BookRow {
    id: i64,
    name: String,
    is_dummy: bool,
    is_dirty: bool,
    link_repo_id: Option<i64>,
    link_url: Option<String>,
    synced_repo_id: Option<i64>,
    synced_repo_kind: Option<String>,
    synced_repo_url: Option<String>,
    synced_file: Option<String>,
    synced_revision: Option<String>,
    synced_modified: Option<i64>,
    action_kind: Option<String>,
    action_message: Option<String>,
    action_at: Option<i64>,
    status: Option<String>,
}

impl BookRow {
    fn link(&self) -> Option<Link> {
        match (self.link_repo_id, &self.link_url) {
            (Some(repo_id), Some(url)) => Some(Link { repo_id: RepoId(repo_id), url: url.clone() }),
            _ => None,
        }
    }

    fn synced_to(&self) -> Result<Option<VersionedRevision>, Error> {
        let (Some(file_uri), Some(revision)) = (&self.synced_file, &self.synced_revision) else {
            return Ok(None);
        };
        Ok(Some(VersionedRevision {
            repo_id: RepoId(self.synced_repo_id.ok_or_raise(|| ErrorKind::InvalidData("synced repository"))?),
            repo_kind: kind(self.synced_repo_kind.as_deref().unwrap_or_default())?,
            repo_uri: self.synced_repo_url.clone().ok_or_raise(|| ErrorKind::InvalidData("synced repository url"))?,
            file_uri: file_uri.clone(),
            revision: revision.clone(),
            modified: timestamp(self.synced_modified.unwrap_or_default(), "synced revision date")?,
        }))
    }

    fn last_action(&self) -> Result<Option<BookAction>, Error> {
        let (Some(action_kind), Some(message)) = (&self.action_kind, &self.action_message) else {
            return Ok(None);
        };
        Ok(Some(BookAction {
            kind: action_kind.parse::<ActionKind>().ok().ok_or_raise(|| ErrorKind::InvalidData("action kind"))?,
            message: message.clone(),
            timestamp: timestamp(self.action_at.unwrap_or_default(), "action date")?,
        }))
    }
}

impl TryFrom<BookRow> for BookView {
    type Error = Error;
    fn try_from(row: BookRow) -> Result<Self, Self::Error> {
        let status = row
            .status
            .as_deref()
            .map(|status| status.parse::<SyncStatus>().ok().ok_or_raise(|| ErrorKind::InvalidData("sync status")))
            .transpose()?;
        let link = row.link();
        let synced_to = row.synced_to()?;
        let last_action = row.last_action()?;
        Ok(BookView {
            book: Book { id: BookId(row.id), name: row.name, is_dummy: row.is_dummy, is_dirty: row.is_dirty },
            link,
            synced_to,
            last_action,
            status,
        })
    }
}

fn kind(value: &str) -> Result<RepoKind, Error> {
    value.parse::<RepoKind>().ok().ok_or_raise(|| ErrorKind::InvalidData("repository kind"))
}

// Unix timestamps drop the nanoseconds, which neither commits nor actions need.
fn timestamp(seconds: i64, what: &'static str) -> Result<OffsetDateTime, Error> {
    OffsetDateTime::from_unix_timestamp(seconds).or_raise(|| ErrorKind::InvalidData(what))
}
