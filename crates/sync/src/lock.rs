use quire_book::RepoId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// One async mutex per repository.
///
/// Sync passes, forced loads and book deletions/renames for the same
/// repository hold its lock for their whole duration, so they never
/// interleave. Different repositories do not contend.
#[derive(Debug, Clone, Default)]
pub struct RepoLocks {
    locks: Arc<Mutex<HashMap<RepoId, Arc<AsyncMutex<()>>>>>,
}

impl RepoLocks {
    fn get(&self, repo: RepoId) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(repo).or_default())
    }

    /// Wait for the repository's lock.
    pub async fn lock(&self, repo: RepoId) -> OwnedMutexGuard<()> {
        self.get(repo).lock_owned().await
    }

    /// Take the repository's lock if nobody holds it.
    pub fn try_lock(&self, repo: RepoId) -> Option<OwnedMutexGuard<()>> {
        self.get(repo).try_lock_owned().ok()
    }
}
