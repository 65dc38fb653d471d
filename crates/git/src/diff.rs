use git2::{Delta, DiffDelta};

/// How a single path changed between two commits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Add,
    Modify,
    Delete,
    /// Renames, copies and type changes: reported so the caller can refuse
    /// them, never interpreted.
    Unsupported(Delta),
}

impl From<Delta> for ChangeKind {
    fn from(delta: Delta) -> Self {
        match delta {
            Delta::Added => Self::Add,
            Delta::Modified => Self::Modify,
            Delta::Deleted => Self::Delete,
            other => Self::Unsupported(other),
        }
    }
}

/// One entry of [`RepoSynchronizer::diff_between`](crate::RepoSynchronizer::diff_between).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChange {
    pub kind: ChangeKind,
    pub old_path: Option<String>,
    pub new_path: Option<String>,
}

impl FileChange {
    /// The path the change is about: the new path, or the old one for deletions.
    pub fn path(&self) -> &str {
        self.new_path.as_deref().or(self.old_path.as_deref()).unwrap_or_default()
    }

    pub fn is_supported(&self) -> bool {
        !matches!(self.kind, ChangeKind::Unsupported(_))
    }
}

impl From<DiffDelta<'_>> for FileChange {
    fn from(delta: DiffDelta<'_>) -> Self {
        let path = |file: git2::DiffFile<'_>| file.path().and_then(|p| p.to_str()).map(|p| p.replace('\\', "/"));
        let kind = ChangeKind::from(delta.status());
        Self {
            kind,
            old_path: match kind {
                ChangeKind::Add => None,
                _ => path(delta.old_file()),
            },
            new_path: match kind {
                ChangeKind::Delete => None,
                _ => path(delta.new_file()),
            },
        }
    }
}
