use exn::ResultExt;
use git2::Signature;

use crate::error::{ErrorKind, Result};

/// Names and identities used by a [`RepoSynchronizer`](crate::RepoSynchronizer).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitSettings {
    /// Prefix of every commit message.
    pub app_name: String,
    pub remote: String,
    pub branch: String,
    /// Branch local changes are force-pushed to when a rebase conflicts.
    /// Overwritten on every conflict.
    pub conflict_branch: String,
    pub author_name: String,
    pub author_email: String,
}

impl Default for GitSettings {
    fn default() -> Self {
        Self {
            app_name: "Quire".to_string(),
            remote: "origin".to_string(),
            branch: "main".to_string(),
            conflict_branch: "quire-conflict".to_string(),
            author_name: "Quire".to_string(),
            author_email: "quire@localhost".to_string(),
        }
    }
}

impl GitSettings {
    pub fn update_message(&self, path: &str) -> String {
        format!("{} update: {path}", self.app_name)
    }

    pub fn deletion_message(&self, path: &str) -> String {
        format!("{} deletion: {path}", self.app_name)
    }

    pub fn rename_message(&self, from: &str, to: &str) -> String {
        format!("{}: rename {from} to {to}", self.app_name)
    }

    pub(crate) fn local_ref(&self) -> String {
        format!("refs/heads/{}", self.branch)
    }

    pub(crate) fn tracking_ref(&self) -> String {
        format!("refs/remotes/{}/{}", self.remote, self.branch)
    }

    /// Local-only reference recording the last remote head applied to books.
    pub(crate) fn marker_ref(&self) -> String {
        format!("refs/quire/synced/{}", self.branch)
    }

    pub(crate) fn signature(&self) -> Result<Signature<'static>> {
        Signature::now(&self.author_name, &self.author_email).or_raise(|| ErrorKind::Git)
    }
}
