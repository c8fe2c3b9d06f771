//! The lake root: top-level directory of pools and global config.
//!
//! Layout at a storage root:
//!
//! ```text
//! lake.json        magic record, exactly one entry
//! pools/           pools config journal
//! index_rules/     index-rules config journal
//! <pool_id>/       each pool's byte tree
//! ```
//!
//! Creation writes the magic record with a does-not-exist precondition so
//! that two concurrent creators resolve to one lake; a backend that cannot
//! express the precondition falls back to a best-effort put followed by a
//! readback check — the only write in the lake permitted that fallback.

use bytes::Bytes;
use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use tarn_core::{
    storage::put_unchecked, CommitId, Error, PoolId, Result, RuleId, SortKey, StorageBackend,
    WritePrecondition, WriteResult,
};

use crate::branches;
use crate::index::{Rule, RuleStore};
use crate::pool::Pool;
use crate::pools::{self, PoolStore};

/// Path of the magic record.
pub const LAKE_MAGIC_FILE: &str = "lake.json";

/// Expected magic string.
pub const LAKE_MAGIC: &str = "TARN LAKE";

/// On-disk format version this build reads and writes.
pub const LAKE_VERSION: u32 = 1;

/// Prefix of the pools config journal.
const POOLS_TAG: &str = "pools";

/// Prefix of the index-rules config journal.
const INDEX_RULES_TAG: &str = "index_rules";

/// Bounded size of the pool-handle cache.
const POOL_CACHE: usize = 1024;

#[derive(Debug, Serialize, Deserialize)]
struct LakeMagic {
    magic: String,
    version: u32,
}

/// The root of a lake: path prefix and configuration state for all pools.
pub struct Root {
    backend: Arc<dyn StorageBackend>,
    pools: PoolStore,
    rules: RuleStore,
    cache: Mutex<LruCache<PoolId, Pool>>,
}

impl std::fmt::Debug for Root {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Root").finish_non_exhaustive()
    }
}

impl Root {
    fn new(backend: Arc<dyn StorageBackend>) -> Self {
        let capacity = NonZeroUsize::new(POOL_CACHE).unwrap_or(NonZeroUsize::MIN);
        Self {
            pools: PoolStore::new(backend.clone(), POOLS_TAG),
            rules: RuleStore::new(backend.clone(), INDEX_RULES_TAG),
            backend,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Creates a new lake at the backend's root.
    ///
    /// # Errors
    ///
    /// Returns `Exists` if a lake is already present, `Corrupt`/`Invalid`
    /// if something unreadable is.
    pub async fn create(backend: Arc<dyn StorageBackend>) -> Result<Self> {
        let root = Self::new(backend);
        match root.read_magic().await {
            Ok(()) => return Err(Error::exists("lake", LAKE_MAGIC_FILE)),
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err),
        }
        root.write_magic().await?;
        tracing::info!(version = LAKE_VERSION, "created lake");
        Ok(root)
    }

    /// Opens an existing lake.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when no lake exists, `Corrupt` on a mangled
    /// magic record, `Invalid` on a version mismatch.
    pub async fn open(backend: Arc<dyn StorageBackend>) -> Result<Self> {
        let root = Self::new(backend);
        root.read_magic().await?;
        Ok(root)
    }

    /// Opens the lake, creating it if absent.
    ///
    /// # Errors
    ///
    /// Propagates `Corrupt`/`Invalid` from an unreadable lake.
    pub async fn create_or_open(backend: Arc<dyn StorageBackend>) -> Result<Self> {
        match Self::open(backend.clone()).await {
            Ok(root) => Ok(root),
            Err(err) if err.is_not_found() => match Self::create(backend.clone()).await {
                // A concurrent creator won between our open and create.
                Err(err) if err.is_exists() => Self::open(backend).await,
                other => other,
            },
            Err(err) => Err(err),
        }
    }

    async fn write_magic(&self) -> Result<()> {
        let magic = LakeMagic {
            magic: LAKE_MAGIC.to_string(),
            version: LAKE_VERSION,
        };
        let payload = serde_json::to_vec(&magic)
            .map_err(|e| Error::io(format!("serialize lake magic: {e}")))?;
        match self
            .backend
            .put(
                LAKE_MAGIC_FILE,
                Bytes::from(payload.clone()),
                WritePrecondition::DoesNotExist,
            )
            .await?
        {
            WriteResult::Success { .. } => Ok(()),
            WriteResult::PreconditionFailed { .. } => {
                Err(Error::exists("lake", LAKE_MAGIC_FILE))
            }
            WriteResult::Unsupported => {
                // One-shot bootstrap fallback: best-effort put, then an
                // external race check via readback.
                put_unchecked(self.backend.as_ref(), LAKE_MAGIC_FILE, Bytes::from(payload))
                    .await?;
                self.read_magic().await
            }
        }
    }

    async fn read_magic(&self) -> Result<()> {
        let bytes = match self.backend.get(LAKE_MAGIC_FILE).await {
            Ok(bytes) => bytes,
            Err(err) if err.is_not_found() => {
                return Err(Error::not_found("lake", LAKE_MAGIC_FILE))
            }
            Err(err) => return Err(err),
        };

        let mut stream =
            serde_json::Deserializer::from_slice(&bytes).into_iter::<serde_json::Value>();
        let first = stream
            .next()
            .ok_or_else(|| Error::corrupt("lake magic file is empty"))?
            .map_err(|e| Error::corrupt(format!("lake magic file: {e}")))?;
        if stream.next().is_some() {
            return Err(Error::corrupt(
                "lake magic file holds more than one record",
            ));
        }

        let magic: LakeMagic = serde_json::from_value(first)
            .map_err(|e| Error::corrupt(format!("lake magic file: {e}")))?;
        if magic.magic != LAKE_MAGIC {
            return Err(Error::corrupt(format!(
                "lake magic {:?} should be {LAKE_MAGIC:?}",
                magic.magic
            )));
        }
        if magic.version != LAKE_VERSION {
            return Err(Error::invalid(format!(
                "unsupported lake version: found {} while expecting {LAKE_VERSION}",
                magic.version
            )));
        }
        Ok(())
    }

    /// Returns all pool configs in name order.
    pub async fn list_pools(&self) -> Result<Vec<pools::Config>> {
        self.pools.all().await
    }

    /// Resolves a pool name or textual id to the pool id.
    ///
    /// # Errors
    ///
    /// Returns `Invalid` for an empty string, `NotFound` for an unknown
    /// name.
    pub async fn pool_id(&self, name: &str) -> Result<PoolId> {
        if name.is_empty() {
            return Err(Error::invalid("no pool name given"));
        }
        if let Ok(id) = name.parse::<PoolId>() {
            return Ok(id);
        }
        self.pools
            .lookup_by_name(name)
            .await?
            .map(|config| config.id)
            .ok_or_else(|| Error::not_found("pool", name))
    }

    /// Creates a pool.
    ///
    /// Zero `threshold`/`seek_stride` take the defaults; a `None` sort key
    /// means `ts` descending.
    ///
    /// # Errors
    ///
    /// Returns `Invalid` for a reserved name or a multi-key sort key,
    /// `Exists` for a duplicate name.
    pub async fn create_pool(
        &self,
        name: &str,
        sort_key: Option<SortKey>,
        seek_stride: u64,
        threshold: u64,
    ) -> Result<Pool> {
        if name.is_empty() {
            return Err(Error::invalid("no pool name given"));
        }
        if name == branches::RESERVED {
            return Err(Error::invalid(format!("pool cannot be named {name:?}")));
        }
        if let Some(key) = &sort_key {
            if key.keys.len() > 1 {
                return Err(Error::invalid("multiple pool keys not supported"));
            }
        }
        if self.pools.lookup_by_name(name).await?.is_some() {
            return Err(Error::exists("pool", name));
        }

        let config = pools::Config::new(name, sort_key, threshold, seek_stride);
        let pool = Pool::create(self.backend.clone(), config.clone()).await?;
        if let Err(err) = self.pools.add(&config).await {
            // Lost a create race (or the store failed); withdraw our bytes.
            remove_pool_bytes(&self.backend, config.id).await;
            return Err(err);
        }

        self.cache_put(config.id, pool.clone())?;
        tracing::info!(pool = %config.id, name = config.name, "created pool");
        Ok(pool)
    }

    /// Opens a pool by id.
    ///
    /// Cache hits return a copy carrying a freshly-read config, so a held
    /// handle stays stable while the cached entry is updated.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown id.
    pub async fn open_pool(&self, id: PoolId) -> Result<Pool> {
        let config = self.pools.lookup_by_id(id).await?;
        {
            let mut cache = self
                .cache
                .lock()
                .map_err(|_| Error::io("pool cache poisoned"))?;
            if let Some(pool) = cache.get(&id) {
                return Ok(pool.with_config(config));
            }
        }
        let pool = Pool::open(self.backend.clone(), config);
        self.cache_put(id, pool.clone())?;
        Ok(pool)
    }

    /// Renames a pool; its id and byte tree are untouched.
    ///
    /// # Errors
    ///
    /// Returns `Invalid` for a reserved name, `NotFound`/`Exists` from the
    /// pools store.
    pub async fn rename_pool(&self, id: PoolId, new_name: &str) -> Result<()> {
        if new_name.is_empty() || new_name == branches::RESERVED {
            return Err(Error::invalid(format!(
                "pool cannot be named {new_name:?}"
            )));
        }
        self.pools.rename(id, new_name).await?;
        Ok(())
    }

    /// Deletes a pool: config entry first, then a best-effort removal of
    /// its byte tree. Handles cached elsewhere go inert as their next
    /// operation fails against the missing config.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown id.
    pub async fn remove_pool(&self, id: PoolId) -> Result<()> {
        let config = self.pools.lookup_by_id(id).await?;
        self.pools.remove(&config).await?;
        {
            let mut cache = self
                .cache
                .lock()
                .map_err(|_| Error::io("pool cache poisoned"))?;
            cache.pop(&id);
        }
        remove_pool_bytes(&self.backend, id).await;
        tracing::info!(pool = %id, name = config.name, "removed pool");
        Ok(())
    }

    /// Creates a branch on a pool at the given commit.
    ///
    /// # Errors
    ///
    /// See [`Pool::create_branch`].
    pub async fn create_branch(
        &self,
        pool_id: PoolId,
        name: &str,
        at: Option<CommitId>,
    ) -> Result<branches::Config> {
        self.open_pool(pool_id).await?.create_branch(name, at).await
    }

    /// Removes a branch from a pool.
    ///
    /// # Errors
    ///
    /// See [`Pool::remove_branch`].
    pub async fn remove_branch(&self, pool_id: PoolId, name: &str) -> Result<()> {
        self.open_pool(pool_id).await?.remove_branch(name).await
    }

    /// Returns the commit a branch points at (`None` at the root
    /// sentinel).
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown pool or branch.
    pub async fn commit_object(
        &self,
        pool_id: PoolId,
        branch_name: &str,
    ) -> Result<Option<CommitId>> {
        let pool = self.open_pool(pool_id).await?;
        let branch = pool.open_branch(branch_name).await?;
        branch.tip().await
    }

    /// Merges `child_branch` into `parent_branch`, returning the new
    /// commit on the parent.
    ///
    /// # Errors
    ///
    /// See [`crate::branch::Branch::merge_into`].
    pub async fn merge_branch(
        &self,
        pool_id: PoolId,
        child_branch: &str,
        parent_branch: &str,
        author: &str,
        message: &str,
    ) -> Result<CommitId> {
        let pool = self.open_pool(pool_id).await?;
        let child = pool.open_branch(child_branch).await?;
        let parent = pool.open_branch(parent_branch).await?;
        child.merge_into(&parent, author, message).await
    }

    /// Publishes the inverse of `commit_id` on `branch_name`.
    ///
    /// # Errors
    ///
    /// See [`crate::branch::Branch::revert`].
    pub async fn revert(
        &self,
        pool_id: PoolId,
        branch_name: &str,
        commit_id: CommitId,
        author: &str,
        message: &str,
    ) -> Result<CommitId> {
        let pool = self.open_pool(pool_id).await?;
        let branch = pool.open_branch(branch_name).await?;
        branch.revert(commit_id, author, message).await
    }

    /// Lists (and, unless `dry_run`, removes) the bytes of objects
    /// unreachable from any branch of the pool.
    ///
    /// # Errors
    ///
    /// See [`Pool::vacuum`].
    pub async fn vacuum(
        &self,
        pool_id: PoolId,
        before: Option<CommitId>,
        dry_run: bool,
    ) -> Result<Vec<tarn_core::ObjectId>> {
        self.open_pool(pool_id).await?.vacuum(before, dry_run).await
    }

    /// Adds index rules.
    ///
    /// # Errors
    ///
    /// Returns `Exists` on the first duplicate name; earlier rules in the
    /// batch stay added.
    pub async fn add_index_rules(&self, rules: &[Rule]) -> Result<()> {
        for rule in rules {
            self.rules.add(rule).await?;
        }
        Ok(())
    }

    /// Deletes index rules by id, returning the removed rules.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` on the first unknown id; earlier deletions
    /// stand.
    pub async fn delete_index_rules(&self, ids: &[RuleId]) -> Result<Vec<Rule>> {
        let mut deleted = Vec::with_capacity(ids.len());
        for id in ids {
            deleted.push(self.rules.delete_by_id(*id).await?);
        }
        Ok(deleted)
    }

    /// Looks up index rules by name.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for any unknown name.
    pub async fn lookup_index_rules(&self, names: &[&str]) -> Result<Vec<Rule>> {
        let mut rules = Vec::with_capacity(names.len());
        for name in names {
            rules.push(
                self.rules
                    .lookup_by_name(name)
                    .await?
                    .ok_or_else(|| Error::not_found("index rule", *name))?,
            );
        }
        Ok(rules)
    }

    /// Returns all index rules in name order.
    pub async fn all_index_rules(&self) -> Result<Vec<Rule>> {
        self.rules.all().await
    }

    fn cache_put(&self, id: PoolId, pool: Pool) -> Result<()> {
        let mut cache = self
            .cache
            .lock()
            .map_err(|_| Error::io("pool cache poisoned"))?;
        cache.put(id, pool);
        Ok(())
    }
}

/// Best-effort removal of a pool's byte tree; failures are logged, not
/// surfaced, because the config entry is already gone.
async fn remove_pool_bytes(backend: &Arc<dyn StorageBackend>, id: PoolId) {
    let prefix = format!("{id}/");
    match backend.list(&prefix).await {
        Ok(objects) => {
            for meta in objects {
                if let Err(err) = backend.delete(&meta.path).await {
                    tracing::warn!(pool = %id, path = meta.path, error = %err, "pool cleanup failed");
                }
            }
        }
        Err(err) => {
            tracing::warn!(pool = %id, error = %err, "pool cleanup listing failed");
        }
    }
}
