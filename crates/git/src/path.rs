//! Working-tree path validation.
//!
//! Every path handed to the synchronizer comes from a book name or a remote
//! tree, and must resolve to a file inside the working copy.

use std::path::{Component, Path, PathBuf};

use crate::error::{ErrorKind, Result};

/// Validates a repository-relative path.
///
/// `..` may be used as long as it never climbs above the repository root. The
/// `.git` directory is off limits.
///
/// ```
/// use std::path::Path;
/// use quire_git::validate_path;
///
/// assert_eq!(validate_path("notes/todo.org").unwrap(), Path::new("notes/todo.org"));
/// assert_eq!(validate_path("notes/../todo.org").unwrap(), Path::new("todo.org"));
/// assert!(validate_path("../outside.org").is_err());
/// assert!(validate_path(".git/config").is_err());
/// ```
pub fn validate(path: impl AsRef<Path>) -> Result<PathBuf> {
    let invalid = || exn::Exn::from(ErrorKind::InvalidPath(path.as_ref().to_path_buf()));
    let mut components = Vec::new();
    for component in path.as_ref().components() {
        match component {
            Component::Normal(s) => {
                // Null bytes survive Path::components() on Unix but truncate C strings.
                if s.as_encoded_bytes().contains(&0) {
                    return Err(invalid());
                }
                components.push(s)
            },
            Component::CurDir | Component::RootDir => {},
            Component::Prefix(_) => return Err(invalid()),
            Component::ParentDir => {
                if components.pop().is_none() {
                    return Err(invalid());
                }
            },
        }
    }
    match components.first() {
        None => Err(invalid()),
        Some(first) if *first == ".git" => Err(invalid()),
        Some(_) => Ok(components.into_iter().collect()),
    }
}

/// Repository paths are always `/`-separated strings.
pub(crate) fn to_repo_string(path: &Path) -> Result<String> {
    let parts = path
        .components()
        .map(|c| c.as_os_str().to_str())
        .collect::<Option<Vec<_>>>()
        .ok_or_else(|| exn::Exn::from(ErrorKind::InvalidPath(path.to_path_buf())))?;
    Ok(parts.join("/"))
}
