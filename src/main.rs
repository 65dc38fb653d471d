use clap::{Parser, Subcommand};
use derive_more::{Display, Error};
use exn::ResultExt;
use futures::StreamExt;
use quire_book::{BookStore, RepoKind};
use quire_cache::{Database, Library};
use quire_config::{Config, RepositoryConfig};
use quire_git::{CredentialTransport, GitEvent, RepoSynchronizer, repository};
use quire_sync::{SyncCoordinator, SyncEvent, SyncOutcome};
use std::path::{Path, PathBuf};
use std::pin::pin;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Display, Error)]
enum AppError {
    #[display("configuration error")]
    Config,
    #[display("could not open the book database")]
    Database,
    #[display("could not prepare working copy for {_0:?}")]
    Repository(#[error(not(source))] String),
    #[display("book store error")]
    Store,
    #[display("could not read {}", _0.display())]
    Input(#[error(not(source))] PathBuf),
    #[display("{_0} repositories failed to sync")]
    SyncFailed(#[error(not(source))] usize),
    #[display("background task failed")]
    Worker,
}

type Result<T> = std::result::Result<T, exn::Exn<AppError>>;

#[derive(Parser)]
#[command(name = "quire", version, about = "Synchronize a local book collection with git repositories")]
struct Cli {
    /// Configuration file (defaults to `config.toml` in the platform config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Sync books with every configured repository, or just one
    Sync {
        /// Name of a repository from the configuration
        #[arg(short, long)]
        repo: Option<String>,
    },
    /// Show every book with its link and last sync status
    Status,
    /// Create a book from a local file; it is linked on the next sync
    Add {
        name: String,
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref()).or_raise(|| AppError::Config)?;
    let db = Database::connect(&config.database).await.or_raise(|| AppError::Database)?;
    let library = Arc::new(Library::from(&db));

    let result = match cli.command {
        Command::Sync { repo } => sync(&config, library, repo.as_deref()).await,
        Command::Status => status(&library).await,
        Command::Add { name, file } => add(&library, &name, &file).await,
    };
    db.close().await;
    result
}

async fn sync(config: &Config, library: Arc<Library>, only: Option<&str>) -> Result<()> {
    let selected: Vec<(&str, &RepositoryConfig)> = match only {
        Some(name) => vec![(name, config.repository(name).or_raise(|| AppError::Config)?)],
        None => config.repositories.iter().map(|(name, repo)| (name.as_str(), repo)).collect(),
    };
    if selected.is_empty() {
        tracing::warn!("no repositories configured, nothing to sync");
        return Ok(());
    }

    let (events, mut remote_messages) = mpsc::unbounded_channel();
    let mut synchronizers = Vec::with_capacity(selected.len());
    for (name, repo_config) in selected {
        let repo = library.ensure_repo(RepoKind::Git, &repo_config.url).await.or_raise(|| AppError::Store)?;
        let settings = config.git_settings(repo_config);
        let transport = Arc::new(CredentialTransport::new(repo_config.credentials()));
        let working_copy = open_or_clone(name, repo_config, settings.clone(), transport.clone()).await?;
        let git = RepoSynchronizer::new(working_copy, repo, settings, transport).with_events(events.clone());
        synchronizers.push(Arc::new(git));
    }
    drop(events);
    tokio::spawn(async move {
        while let Some(event) = remote_messages.recv().await {
            match event {
                GitEvent::RemoteProgress(text) => tracing::info!(remote = %text),
                GitEvent::RefRejected { refname, message } => tracing::warn!(%refname, %message, "remote rejected"),
            }
        }
    });

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted, stopping after the current step");
            on_interrupt.cancel();
        }
    });

    let coordinator = SyncCoordinator::new(library).with_extensions(&config.extensions);
    let mut events = pin!(coordinator.sync_all(&synchronizers, &cancel));
    let mut failed = 0;
    while let Some(event) = events.next().await {
        match event {
            SyncEvent::Started(count) => tracing::info!(repositories = count, "syncing"),
            SyncEvent::Finished(repo, SyncOutcome::Completed) => tracing::info!(%repo, "sync completed"),
            SyncEvent::Finished(repo, SyncOutcome::CompletedWithConflicts(reason)) => {
                tracing::warn!(%repo, %reason, "sync completed with conflicts")
            },
            SyncEvent::Finished(repo, SyncOutcome::Failed(error)) => {
                failed += 1;
                tracing::error!(%repo, %error, "sync failed");
            },
            SyncEvent::Complete => {},
        }
    }
    match failed {
        0 => Ok(()),
        n => exn::bail!(AppError::SyncFailed(n)),
    }
}

/// Open the working copy, cloning into its directory first when the
/// directory is missing or empty.
async fn open_or_clone(
    name: &str,
    config: &RepositoryConfig,
    settings: quire_git::GitSettings,
    transport: Arc<CredentialTransport>,
) -> Result<git2::Repository> {
    let path = config.path.clone();
    let url = config.url.clone();
    let error = || AppError::Repository(name.to_string());
    tokio::task::spawn_blocking(move || {
        std::fs::create_dir_all(&path)?;
        let is_empty = std::fs::read_dir(&path)?.next().is_none();
        Ok::<_, std::io::Error>(match is_empty {
            true => repository::clone(&url, &path, &settings, transport.as_ref()),
            false => repository::open(&path, &url, &settings),
        })
    })
    .await
    .or_raise(|| AppError::Worker)?
    .or_raise(error)?
    .or_raise(error)
}

async fn status(library: &Library) -> Result<()> {
    let books = library.list_books().await.or_raise(|| AppError::Store)?;
    let repos = library.repos().await.or_raise(|| AppError::Store)?;
    for book in books {
        let repo = book
            .link
            .as_ref()
            .and_then(|link| repos.iter().find(|repo| repo.id == link.repo_id))
            .map_or("-", |repo| repo.url.as_str());
        let status = book.status.map_or("-", |status| status.as_str());
        let flags = match (book.is_dummy(), book.is_dirty()) {
            (true, _) => " (dummy)",
            (false, true) => " (modified)",
            (false, false) => "",
        };
        println!("{}{flags}\t{repo}\t{status}", book.name());
        if let Some(action) = &book.last_action {
            println!("\t{}: {}", action.kind, action.message);
        }
    }
    Ok(())
}

async fn add(library: &Library, name: &str, file: &Path) -> Result<()> {
    let content = tokio::fs::read(file).await.or_raise(|| AppError::Input(file.to_path_buf()))?;
    let id = library.create_book(name, &content).await.or_raise(|| AppError::Store)?;
    tracing::info!(book = %id, name, "book created");
    Ok(())
}
