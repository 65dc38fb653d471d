//! Book names and the repository paths they map to.
//!
//! A book's name is its repository path without the extension, so
//! `journal/2024.org` holds the book `journal/2024`.

use std::path::{Component, Path};

use crate::error::{ErrorKind, Result};

/// Book file extensions recognised when nothing else is configured.
pub const DEFAULT_EXTENSIONS: &[&str] = &["org"];

/// A book name recovered from a repository path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BookName {
    pub name: String,
    pub extension: String,
}

impl BookName {
    /// Derive the book name from a `/`-separated repository path, if the path
    /// has one of the supported `extensions`.
    ///
    /// ```
    /// use quire_book::BookName;
    ///
    /// let name = BookName::from_path("journal/2024.org", &["org"]).unwrap();
    /// assert_eq!(name.name, "journal/2024");
    /// assert!(BookName::from_path("image.png", &["org"]).is_none());
    /// assert!(BookName::from_path(".org", &["org"]).is_none());
    /// ```
    pub fn from_path(path: &str, extensions: &[impl AsRef<str>]) -> Option<Self> {
        let (stem, extension) = path.rsplit_once('.')?;
        let supported = extensions.iter().any(|ext| ext.as_ref().eq_ignore_ascii_case(extension));
        let file_stem = stem.rsplit('/').next().unwrap_or(stem);
        match supported && !file_stem.is_empty() && validate(stem).is_ok() {
            true => Some(Self { name: stem.to_string(), extension: extension.to_string() }),
            false => None,
        }
    }

    /// The repository path of this book.
    pub fn path(&self) -> String {
        path_for(&self.name, &self.extension)
    }
}

/// The repository path of a book called `name` stored with `extension`.
pub fn path_for(name: &str, extension: &str) -> String {
    format!("{name}.{extension}")
}

/// Validates a book name.
///
/// Names become repository paths, so they must stay inside the repository: no
/// `..` traversal, no absolute paths, no null bytes, nothing empty.
///
/// ```
/// use quire_book::validate_name;
///
/// assert!(validate_name("todo").is_ok());
/// assert!(validate_name("journal/2024").is_ok());
/// assert!(validate_name("../etc/passwd").is_err());
/// assert!(validate_name("/todo").is_err());
/// assert!(validate_name("").is_err());
/// ```
pub fn validate(name: &str) -> Result<&str> {
    let invalid = || exn::Exn::from(ErrorKind::InvalidName(name.to_string()));
    if name.is_empty() || name.contains('\0') || name.contains('\\') {
        return Err(invalid());
    }
    for component in Path::new(name).components() {
        match component {
            Component::Normal(_) => {},
            // Leading `/`, `..` and `.` all change what the name points at.
            _ => return Err(invalid()),
        }
    }
    match name.ends_with('/') || name.contains("//") {
        true => Err(invalid()),
        false => Ok(name),
    }
}
