use async_stream::stream;
use futures::stream::FuturesUnordered;
use futures::{Stream, StreamExt};
use quire_book::RepoId;
use quire_git::RepoSynchronizer;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::coordinator::{SyncCoordinator, SyncOutcome};

/// Progress events emitted by [`SyncCoordinator::sync_all`].
///
/// [`Started`](Self::Started) comes first and [`Complete`](Self::Complete)
/// last, with one [`Finished`](Self::Finished) per repository in between, in
/// the order the passes end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// Passes have begun for this many repositories.
    Started(usize),
    Finished(RepoId, SyncOutcome),
    Complete,
}

impl SyncCoordinator {
    /// Sync every repository, passes for different repositories running
    /// concurrently.
    ///
    /// A failed pass is reported as [`SyncOutcome::Failed`] and does not stop
    /// the others.
    pub fn sync_all<'a>(
        &'a self,
        repos: &'a [Arc<RepoSynchronizer>],
        cancel: &'a CancellationToken,
    ) -> impl Stream<Item = SyncEvent> + 'a {
        stream!({
            yield SyncEvent::Started(repos.len());

            let mut passes: FuturesUnordered<_> = repos
                .iter()
                .map(|git| async move { (git.repo().id, SyncOutcome::of(&self.sync(git, cancel).await)) })
                .collect();
            while let Some((repo, outcome)) = passes.next().await {
                yield SyncEvent::Finished(repo, outcome);
            }

            yield SyncEvent::Complete;
        })
    }
}
