//! Creating, cloning and opening working copies.

use exn::ResultExt;
use git2::build::{CheckoutBuilder, RepoBuilder};
use git2::{FetchOptions, Repository};
use std::fs;
use std::path::Path;

use crate::error::{ErrorKind, Result};
use crate::settings::GitSettings;
use crate::transport::TransportConfigurator;

/// Open an existing working copy and make sure its remote points at `url`.
pub fn open(path: &Path, url: &str, settings: &GitSettings) -> Result<Repository> {
    let repo = Repository::open(path).or_raise(|| ErrorKind::NotARepository(path.to_path_buf()))?;
    if repo.is_bare() {
        exn::bail!(ErrorKind::NotARepository(path.to_path_buf()));
    }
    ensure_remote(&repo, &settings.remote, url)?;
    point_head_at_branch(&repo, settings)?;
    Ok(repo)
}

/// Create a new working copy at `path` whose remote is `url`.
pub fn init(path: &Path, url: &str, settings: &GitSettings) -> Result<Repository> {
    let repo = Repository::init(path).or_raise(|| ErrorKind::Git)?;
    ensure_remote(&repo, &settings.remote, url)?;
    point_head_at_branch(&repo, settings)?;
    Ok(repo)
}

/// Clone `url` into `path`, which must be an existing empty directory.
///
/// A failed clone leaves the directory empty again.
#[tracing::instrument(skip(path, settings, transport), fields(path = %path.display()))]
pub fn clone(
    url: &str,
    path: &Path,
    settings: &GitSettings,
    transport: &dyn TransportConfigurator,
) -> Result<Repository> {
    let is_empty = fs::read_dir(path).map_err(ErrorKind::from)?.next().is_none();
    if !is_empty {
        exn::bail!(ErrorKind::CloneTarget(path.to_path_buf()));
    }

    let mut fetch = FetchOptions::new();
    fetch.remote_callbacks(transport.remote_callbacks());
    let mut builder = RepoBuilder::new();
    builder.fetch_options(fetch);
    builder.remote_create(|repo, _name, url| repo.remote(&settings.remote, url));
    // No `builder.branch()`: an empty remote has no branch to check out.
    let repo = match builder.clone(url, path) {
        Ok(repo) => repo,
        Err(err) => {
            tracing::warn!(error = %err, "clone failed, removing partial working copy");
            clear_directory(path);
            return Err(err).or_raise(|| ErrorKind::Clone(url.to_string()));
        },
    };
    point_head_at_branch(&repo, settings)?;
    tracing::info!("cloned repository");
    Ok(repo)
}

fn clear_directory(path: &Path) {
    let Ok(entries) = fs::read_dir(path) else { return };
    for entry in entries.flatten() {
        let target = entry.path();
        _ = match target.is_dir() {
            true => fs::remove_dir_all(&target),
            false => fs::remove_file(&target),
        };
    }
}

fn ensure_remote(repo: &Repository, name: &str, url: &str) -> Result<()> {
    match repo.find_remote(name) {
        Ok(remote) if remote.url() == Some(url) => {},
        Ok(_) => repo.remote_set_url(name, url).or_raise(|| ErrorKind::Git)?,
        Err(_) => {
            repo.remote(name, url).or_raise(|| ErrorKind::Git)?;
        },
    }
    Ok(())
}

/// Make `HEAD` the configured branch: an existing local branch, a new branch
/// tracking the fetched remote branch, or an unborn branch.
fn point_head_at_branch(repo: &Repository, settings: &GitSettings) -> Result<()> {
    let local = settings.local_ref();
    let current = repo.find_reference("HEAD").ok().and_then(|head| head.symbolic_target().map(String::from));
    if current.as_deref() == Some(local.as_str()) {
        return Ok(());
    }
    if repo.find_reference(&local).is_err()
        && let Ok(id) = repo.refname_to_id(&settings.tracking_ref())
    {
        repo.reference(&local, id, false, "quire: track remote branch").or_raise(|| ErrorKind::Git)?;
    }
    repo.set_head(&local).or_raise(|| ErrorKind::Git)?;
    if repo.find_reference(&local).is_ok() {
        repo.checkout_head(Some(CheckoutBuilder::new().safe())).or_raise(|| ErrorKind::Git)?;
    }
    tracing::debug!(branch = %settings.branch, "pointed HEAD at branch");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::CredentialTransport;
    use git2::RepositoryInitOptions;
    use tempfile::TempDir;

    fn bare_remote() -> (TempDir, String) {
        let dir = TempDir::new().unwrap();
        Repository::init_opts(dir.path(), RepositoryInitOptions::new().bare(true).initial_head("main")).unwrap();
        let url = dir.path().to_str().unwrap().to_string();
        (dir, url)
    }

    #[test]
    fn test_clone_empty_remote_points_head_at_branch() {
        let (_remote, url) = bare_remote();
        let target = TempDir::new().unwrap();
        let repo = clone(&url, target.path(), &GitSettings::default(), &CredentialTransport::default()).unwrap();
        let head = repo.find_reference("HEAD").unwrap();
        assert_eq!(head.symbolic_target(), Some("refs/heads/main"));
        assert_eq!(repo.find_remote("origin").unwrap().url(), Some(url.as_str()));
    }

    #[test]
    fn test_clone_into_non_empty_directory_fails() {
        let (_remote, url) = bare_remote();
        let target = TempDir::new().unwrap();
        fs::write(target.path().join("existing.txt"), b"x").unwrap();
        let err = clone(&url, target.path(), &GitSettings::default(), &CredentialTransport::default()).err().unwrap();
        assert!(matches!(&*err, ErrorKind::CloneTarget(_)));
        // Nothing was removed.
        assert!(target.path().join("existing.txt").exists());
    }

    #[test]
    fn test_failed_clone_leaves_directory_empty() {
        let missing = TempDir::new().unwrap();
        let url = missing.path().join("does-not-exist.git");
        let target = TempDir::new().unwrap();
        let err = clone(url.to_str().unwrap(), target.path(), &GitSettings::default(), &CredentialTransport::default())
            .err().unwrap();
        assert!(matches!(&*err, ErrorKind::Clone(_)));
        assert_eq!(fs::read_dir(target.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_open_rejects_bare_and_missing_repositories() {
        let (remote, url) = bare_remote();
        let err = open(remote.path(), &url, &GitSettings::default()).err().unwrap();
        assert!(matches!(&*err, ErrorKind::NotARepository(_)));

        let empty = TempDir::new().unwrap();
        let err = open(empty.path(), &url, &GitSettings::default()).err().unwrap();
        assert!(matches!(&*err, ErrorKind::NotARepository(_)));
    }

    #[test]
    fn test_open_updates_remote_url() {
        let dir = TempDir::new().unwrap();
        init(dir.path(), "file:///old.git", &GitSettings::default()).unwrap();
        let repo = open(dir.path(), "file:///new.git", &GitSettings::default()).unwrap();
        assert_eq!(repo.find_remote("origin").unwrap().url(), Some("file:///new.git"));
    }
}
