//! A pool: one commit log, one branch store, and the byte range of its
//! data objects.

use std::sync::Arc;

use tarn_core::{CommitId, Error, ObjectId, PoolId, Result, StorageBackend};

use crate::branch::Branch;
use crate::branches::{self, BranchStore};
use crate::commit::CommitStore;
use crate::pools;
use crate::vacuum;

/// A handle on one data pool.
///
/// Cloning is cheap: the commit store (and its caches) and branch store are
/// shared. The embedded config is the one read when the handle was
/// produced; the root's pool cache hands out copies with a freshly-read
/// config so that a cached handle never mutates under a stale one.
#[derive(Clone)]
pub struct Pool {
    config: pools::Config,
    backend: Arc<dyn StorageBackend>,
    commits: Arc<CommitStore>,
    branches: Arc<BranchStore>,
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool").finish_non_exhaustive()
    }
}

impl Pool {
    /// Opens a pool handle from its config. No I/O is performed.
    pub(crate) fn open(backend: Arc<dyn StorageBackend>, config: pools::Config) -> Self {
        let prefix = config.path();
        Self {
            commits: Arc::new(CommitStore::new(backend.clone(), format!("{prefix}/commits"))),
            branches: Arc::new(BranchStore::new(backend.clone(), format!("{prefix}/branches"))),
            backend,
            config,
        }
    }

    /// Creates the pool's storage: seeds the `main` branch at the root
    /// sentinel.
    pub(crate) async fn create(
        backend: Arc<dyn StorageBackend>,
        config: pools::Config,
    ) -> Result<Self> {
        let pool = Self::open(backend, config);
        pool.branches.create(branches::MAIN, None).await?;
        Ok(pool)
    }

    /// Returns a copy of this handle carrying `config`.
    pub(crate) fn with_config(&self, config: pools::Config) -> Self {
        Self {
            config,
            ..self.clone()
        }
    }

    /// Returns the pool config this handle was opened with.
    #[must_use]
    pub fn config(&self) -> &pools::Config {
        &self.config
    }

    /// Returns the pool's permanent id.
    #[must_use]
    pub fn id(&self) -> PoolId {
        self.config.id
    }

    /// Opens a branch of this pool.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the branch does not exist.
    pub async fn open_branch(&self, name: &str) -> Result<Branch> {
        self.branches.lookup(name).await?;
        Ok(Branch::new(
            self.config.clone(),
            name,
            self.backend.clone(),
            self.commits.clone(),
            self.branches.clone(),
        ))
    }

    /// Creates a branch pointing at commit `at` (`None` for the root
    /// sentinel).
    ///
    /// # Errors
    ///
    /// Returns `Invalid` for a bad name, `Exists` for a taken name,
    /// `NotFound` for an unknown commit.
    pub async fn create_branch(
        &self,
        name: &str,
        at: Option<CommitId>,
    ) -> Result<branches::Config> {
        if let Some(commit) = at {
            self.commits.get(commit).await?;
        }
        let config = self.branches.create(name, at).await?;
        tracing::info!(pool = %self.config.id, branch = name, "created branch");
        Ok(config)
    }

    /// Removes a branch. Its commits stay in the log; objects only it
    /// could reach become vacuum candidates.
    ///
    /// # Errors
    ///
    /// Returns `Invalid` for `main`, `NotFound` for an unknown branch.
    pub async fn remove_branch(&self, name: &str) -> Result<()> {
        if name == branches::MAIN {
            return Err(Error::invalid(format!(
                "cannot remove the {} branch",
                branches::MAIN
            )));
        }
        self.branches.remove(name).await?;
        tracing::info!(pool = %self.config.id, branch = name, "removed branch");
        Ok(())
    }

    /// Returns all branch configs in name order.
    pub async fn branches(&self) -> Result<Vec<branches::Config>> {
        self.branches.all().await
    }

    /// Lists object ids unreachable from any branch tip and created at or
    /// before `before` (a commit id used as a time bound; `None` for no
    /// bound). When `dry_run` is false, also removes their bytes.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown `before` commit; propagates
    /// storage failures.
    pub async fn vacuum(
        &self,
        before: Option<CommitId>,
        dry_run: bool,
    ) -> Result<Vec<ObjectId>> {
        vacuum::vacuum(self, before, dry_run).await
    }

    /// Returns the storage backend the pool lives on, for collaborators
    /// that read object bytes or write vector companions at the
    /// id-derived paths.
    #[must_use]
    pub fn storage(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    pub(crate) fn commit_store(&self) -> &Arc<CommitStore> {
        &self.commits
    }

    pub(crate) fn branch_store(&self) -> &Arc<BranchStore> {
        &self.branches
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tarn_core::MemoryBackend;

    async fn pool() -> Pool {
        let backend: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        let config = pools::Config::new("logs", None, 0, 0);
        Pool::create(backend, config).await.unwrap()
    }

    #[tokio::test]
    async fn pools_are_born_with_main() {
        let pool = pool().await;
        let branches = pool.branches().await.unwrap();
        assert_eq!(branches.len(), 1);
        assert_eq!(branches[0].name, branches::MAIN);
        assert_eq!(branches[0].commit, None);

        let main = pool.open_branch(branches::MAIN).await.unwrap();
        assert_eq!(main.tip().await.unwrap(), None);
    }

    #[tokio::test]
    async fn branch_at_unknown_commit_is_rejected() {
        let pool = pool().await;
        let err = pool
            .create_branch("feature", Some(CommitId::generate()))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn main_cannot_be_removed() {
        let pool = pool().await;
        assert!(matches!(
            pool.remove_branch(branches::MAIN).await,
            Err(Error::Invalid(_))
        ));
    }

    #[tokio::test]
    async fn open_missing_branch_is_not_found() {
        let pool = pool().await;
        assert!(pool.open_branch("nope").await.unwrap_err().is_not_found());
    }
}
