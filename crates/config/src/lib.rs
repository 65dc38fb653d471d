//! Configuration for quire.
//!
//! Values are layered, later layers winning:
//!
//! 1. built-in defaults,
//! 2. a TOML file (`--config`, or `config.toml` in the platform config
//!    directory),
//! 3. environment variables prefixed with `QUIRE_`, nested keys separated by
//!    `__` (`QUIRE_REPOSITORIES__WORK__BRANCH=trunk`).
//!
//! ```toml
//! database = "/home/me/.local/share/quire/quire.db"
//! extensions = ["org", "txt"]
//!
//! [author]
//! name = "Me"
//! email = "me@example.com"
//!
//! [repositories.notes]
//! url = "git@example.com:me/notes.git"
//! path = "/home/me/notes"
//! ssh_key = "/home/me/.ssh/id_ed25519"
//! ```

pub mod error;

use directories::ProjectDirs;
use exn::{OptionExt, ResultExt};
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use quire_book::DEFAULT_EXTENSIONS;
use quire_git::{Credentials, GitSettings};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::{ErrorKind, Result};

const CONFIG_FILE: &str = "config.toml";
const DATABASE_FILE: &str = "quire.db";
const ENV_PREFIX: &str = "QUIRE_";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// SQLite database holding the local books.
    pub database: PathBuf,
    /// Prefix of every commit message.
    pub app_name: String,
    /// Extensions a repository file must have to be a book, without the dot.
    /// The first is used for new files.
    pub extensions: Vec<String>,
    pub author: Author,
    pub repositories: BTreeMap<String, RepositoryConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Author {
    pub name: String,
    pub email: String,
}

/// One git repository and the working copy it is synced through.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryConfig {
    pub url: String,
    /// Working copy; cloned into when missing or empty.
    pub path: PathBuf,
    #[serde(default = "default_branch")]
    pub branch: String,
    #[serde(default = "default_remote")]
    pub remote: String,
    #[serde(default = "default_conflict_branch")]
    pub conflict_branch: String,
    /// Private key for SSH remotes. Without it the SSH agent is asked.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_key: Option<PathBuf>,
}

fn default_branch() -> String {
    GitSettings::default().branch
}

fn default_remote() -> String {
    GitSettings::default().remote
}

fn default_conflict_branch() -> String {
    GitSettings::default().conflict_branch
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("", "", "quire")
}

impl Default for Config {
    fn default() -> Self {
        let git = GitSettings::default();
        Self {
            database: project_dirs()
                .map(|dirs| dirs.data_dir().join(DATABASE_FILE))
                .unwrap_or_else(|| PathBuf::from(DATABASE_FILE)),
            app_name: git.app_name,
            extensions: DEFAULT_EXTENSIONS.iter().map(ToString::to_string).collect(),
            author: Author::default(),
            repositories: BTreeMap::new(),
        }
    }
}

impl Default for Author {
    fn default() -> Self {
        let git = GitSettings::default();
        Self { name: git.author_name, email: git.author_email }
    }
}

impl Config {
    /// The configuration file used when none is given explicitly.
    pub fn default_file() -> Option<PathBuf> {
        project_dirs().map(|dirs| dirs.config_dir().join(CONFIG_FILE))
    }

    /// Load and validate the configuration.
    ///
    /// An explicit `file` must exist; the default file is optional.
    pub fn load(file: Option<&Path>) -> Result<Self> {
        if let Some(file) = file
            && !file.is_file()
        {
            exn::bail!(ErrorKind::NotFound(file.to_path_buf()));
        }
        let file = file.map(Path::to_path_buf).or_else(Self::default_file);
        tracing::debug!(file = ?file, "loading configuration");
        let config: Self = Self::figment(file.as_deref())
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .or_raise(|| ErrorKind::Load)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overlaid with `file`, if any.
    fn figment(file: Option<&Path>) -> Figment {
        let figment = Figment::from(Serialized::defaults(Self::default()));
        match file {
            Some(file) => figment.merge(Toml::file(file)),
            None => figment,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.extensions.is_empty() {
            exn::bail!(ErrorKind::Invalid("at least one book extension is required".to_string()));
        }
        if let Some(bad) = self.extensions.iter().find(|ext| ext.is_empty() || ext.contains(['.', '/'])) {
            exn::bail!(ErrorKind::Invalid(format!("book extension {bad:?} must be a bare, non-empty suffix")));
        }
        for (name, repo) in &self.repositories {
            if repo.url.is_empty() {
                exn::bail!(ErrorKind::Invalid(format!("repository {name:?} has no url")));
            }
            if repo.branch.is_empty() || repo.conflict_branch.is_empty() {
                exn::bail!(ErrorKind::Invalid(format!("repository {name:?} has an empty branch name")));
            }
            if repo.branch == repo.conflict_branch {
                exn::bail!(ErrorKind::Invalid(format!(
                    "repository {name:?} uses {:?} as both its branch and its conflict branch",
                    repo.branch
                )));
            }
        }
        Ok(())
    }

    pub fn repository(&self, name: &str) -> Result<&RepositoryConfig> {
        self.repositories.get(name).ok_or_raise(|| ErrorKind::UnknownRepository(name.to_string()))
    }

    /// Git identities and branch names for one repository.
    pub fn git_settings(&self, repo: &RepositoryConfig) -> GitSettings {
        GitSettings {
            app_name: self.app_name.clone(),
            remote: repo.remote.clone(),
            branch: repo.branch.clone(),
            conflict_branch: repo.conflict_branch.clone(),
            author_name: self.author.name.clone(),
            author_email: self.author.email.clone(),
        }
    }
}

impl RepositoryConfig {
    pub fn credentials(&self) -> Credentials {
        match &self.ssh_key {
            Some(key) => Credentials::SshKey {
                username: None,
                private_key: key.clone(),
                public_key: None,
                passphrase: None,
            },
            None => Credentials::Default,
        }
    }
}
