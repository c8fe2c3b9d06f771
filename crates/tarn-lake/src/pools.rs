//! Pool configuration records and the root-level pools store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use tarn_core::{Error, PoolId, Result, SortKey, StorageBackend};

use crate::store::{Store, StoreRecord};

/// Default target byte size of one data object.
pub const DEFAULT_THRESHOLD: u64 = 500 << 20;

/// Default seek-index density: one index row per this many bytes.
pub const DEFAULT_SEEK_STRIDE: u64 = 64 << 10;

/// Configuration of one data pool.
///
/// `name` is unique within a root and may change; `id` is the permanent
/// handle and names the pool's byte tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Creation timestamp.
    pub ts: DateTime<Utc>,
    /// Unique pool name.
    pub name: String,
    /// Permanent pool identifier.
    pub id: PoolId,
    /// The sort key ordering records within the pool.
    pub sort_key: SortKey,
    /// Seek-index density in bytes.
    pub seek_stride: u64,
    /// Target byte size of one data object.
    pub threshold: u64,
}

impl Config {
    /// Creates a pool config, applying defaults for a nil sort key and
    /// zero threshold/stride.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        sort_key: Option<SortKey>,
        threshold: u64,
        seek_stride: u64,
    ) -> Self {
        Self {
            ts: Utc::now(),
            name: name.into(),
            id: PoolId::generate(),
            sort_key: sort_key.unwrap_or_default(),
            seek_stride: if seek_stride == 0 {
                DEFAULT_SEEK_STRIDE
            } else {
                seek_stride
            },
            threshold: if threshold == 0 {
                DEFAULT_THRESHOLD
            } else {
                threshold
            },
        }
    }

    /// Returns the pool's storage prefix under the lake root.
    #[must_use]
    pub fn path(&self) -> String {
        self.id.to_string()
    }
}

impl StoreRecord for Config {
    const KIND: &'static str = "pool";

    fn key(&self) -> String {
        self.name.clone()
    }
}

/// The root-level store enumerating pools, keyed by pool name.
pub struct PoolStore {
    store: Store<Config>,
}

impl PoolStore {
    /// Opens the pools store at `path`.
    #[must_use]
    pub fn new(backend: Arc<dyn StorageBackend>, path: impl Into<String>) -> Self {
        Self {
            store: Store::new(backend, path),
        }
    }

    /// Adds a pool config.
    ///
    /// # Errors
    ///
    /// Returns `Exists` if the name is taken.
    pub async fn add(&self, config: &Config) -> Result<()> {
        self.store.add(config).await
    }

    /// Removes a pool config.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the pool is gone already.
    pub async fn remove(&self, config: &Config) -> Result<()> {
        self.store.delete(&config.name).await.map(|_| ())
    }

    /// Looks up a pool by name.
    pub async fn lookup_by_name(&self, name: &str) -> Result<Option<Config>> {
        self.store.lookup(name).await
    }

    /// Looks up a pool by its permanent id.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if no live pool carries the id.
    pub async fn lookup_by_id(&self, id: PoolId) -> Result<Config> {
        self.store
            .all()
            .await?
            .into_iter()
            .find(|config| config.id == id)
            .ok_or_else(|| Error::not_found("pool", id))
    }

    /// Returns all pool configs in name order.
    pub async fn all(&self) -> Result<Vec<Config>> {
        self.store.all().await
    }

    /// Renames the pool with the given id.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the id is absent, `Exists` if the new name is
    /// taken.
    pub async fn rename(&self, id: PoolId, new_name: &str) -> Result<Config> {
        let current = self.lookup_by_id(id).await?;
        let renamed = Config {
            name: new_name.to_string(),
            ..current.clone()
        };
        self.store.rename(&current.name, &renamed).await?;
        Ok(renamed)
    }
}
