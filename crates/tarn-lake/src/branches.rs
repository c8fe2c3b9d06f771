//! Branch configuration records and the per-pool branch store.
//!
//! A branch is a named cursor onto the pool's commit log. The branch store
//! is the sole place where optimistic concurrency against a tip is
//! enforced: [`BranchStore::update_tip`] compares the live tip against the
//! one the publisher observed and fails with `Conflict` when it moved.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use tarn_core::{CommitId, Error, Result, StorageBackend};

use crate::store::{Store, StoreRecord};

/// The branch every pool is born with.
pub const MAIN: &str = "main";

/// Reserved name: refers to "the current branch" in higher layers and can
/// never name a branch or pool.
pub const RESERVED: &str = "HEAD";

/// Configuration of one branch: a name and the commit it points at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Creation timestamp.
    pub ts: DateTime<Utc>,
    /// Branch name, unique within the pool.
    pub name: String,
    /// The branch tip, or `None` for the root sentinel (no commits yet).
    pub commit: Option<CommitId>,
}

impl Config {
    /// Creates a branch config pointing at `commit`.
    #[must_use]
    pub fn new(name: impl Into<String>, commit: Option<CommitId>) -> Self {
        Self {
            ts: Utc::now(),
            name: name.into(),
            commit,
        }
    }
}

impl StoreRecord for Config {
    const KIND: &'static str = "branch";

    fn key(&self) -> String {
        self.name.clone()
    }
}

/// Validates a branch name.
///
/// # Errors
///
/// Returns `Invalid` for an empty name, the reserved `HEAD`, or a name
/// containing separators, whitespace, or control characters.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::invalid("branch name must not be empty"));
    }
    if name == RESERVED {
        return Err(Error::invalid(format!("branch cannot be named \"{RESERVED}\"")));
    }
    if name
        .chars()
        .any(|c| c == '/' || c == '\\' || c.is_whitespace() || c.is_control())
    {
        return Err(Error::invalid(format!("bad branch name \"{name}\"")));
    }
    Ok(())
}

/// The per-pool store of branch configs, keyed by branch name.
pub struct BranchStore {
    store: Store<Config>,
}

impl BranchStore {
    /// Opens the branch store at `path`.
    #[must_use]
    pub fn new(backend: Arc<dyn StorageBackend>, path: impl Into<String>) -> Self {
        Self {
            store: Store::new(backend, path),
        }
    }

    /// Creates a branch pointing at `commit`.
    ///
    /// # Errors
    ///
    /// Returns `Invalid` for a bad name, `Exists` if the name is taken.
    pub async fn create(&self, name: &str, commit: Option<CommitId>) -> Result<Config> {
        validate_name(name)?;
        let config = Config::new(name, commit);
        self.store.add(&config).await?;
        Ok(config)
    }

    /// Looks up a branch.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the branch is absent.
    pub async fn lookup(&self, name: &str) -> Result<Config> {
        self.store
            .lookup(name)
            .await?
            .ok_or_else(|| Error::not_found("branch", name))
    }

    /// Returns all branches in name order.
    pub async fn all(&self) -> Result<Vec<Config>> {
        self.store.all().await
    }

    /// Removes a branch.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the branch is absent.
    pub async fn remove(&self, name: &str) -> Result<Config> {
        self.store.delete(name).await
    }

    /// Advances the branch tip from `old` to `new`.
    ///
    /// This is the lake's optimistic-concurrency primitive: the update
    /// commits only if the live tip still equals `old`.
    ///
    /// # Errors
    ///
    /// Returns `Conflict` if the tip moved, `NotFound` if the branch is
    /// gone.
    pub async fn update_tip(
        &self,
        name: &str,
        old: Option<CommitId>,
        new: CommitId,
    ) -> Result<Config> {
        self.store
            .update(name, |current| {
                if current.commit == old {
                    Ok(Config {
                        commit: Some(new),
                        ..current.clone()
                    })
                } else {
                    Err(Error::conflict(format!(
                        "branch {name} tip moved: expected {}, found {}",
                        fmt_tip(old),
                        fmt_tip(current.commit),
                    )))
                }
            })
            .await
    }
}

fn fmt_tip(tip: Option<CommitId>) -> String {
    tip.map_or_else(|| "root".to_string(), |id| id.to_string())
}
