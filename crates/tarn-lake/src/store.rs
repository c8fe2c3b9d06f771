//! Journal-backed key/value stores over typed config records.
//!
//! The current state is obtained by replaying `Add`/`Update`/`Delete`/
//! `Rename` entries from the underlying journal. Every mutation validates
//! its precondition against the state at the observed head and then claims
//! the next entry slot; losing the slot race means another writer committed
//! first, so the precondition is re-checked against the new state before
//! trying again. The journal append is thereby the linearization point for
//! all config mutations — including the branch-tip compare-and-swap built
//! on [`Store::update`].

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use tarn_core::{Error, Result, StorageBackend};

use crate::journal::{decode, encode, Journal};

/// A typed record held by a [`Store`], replayed from journal entries.
pub trait StoreRecord: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Entity kind used in error messages (`"pool"`, `"branch"`, ...).
    const KIND: &'static str;

    /// The unique key this record lives under.
    fn key(&self) -> String;
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Entry<T> {
    Add { record: T },
    Update { record: T },
    Delete { key: String },
    Rename { from: String, record: T },
}

impl<T: StoreRecord> Entry<T> {
    fn apply(self, state: &mut BTreeMap<String, T>) {
        match self {
            Self::Add { record } | Self::Update { record } => {
                state.insert(record.key(), record);
            }
            Self::Delete { key } => {
                state.remove(&key);
            }
            Self::Rename { from, record } => {
                state.remove(&from);
                state.insert(record.key(), record);
            }
        }
    }
}

struct CachedState<T> {
    head: u64,
    state: Arc<BTreeMap<String, T>>,
}

/// A journal-backed key/value store of typed config records.
pub struct Store<T> {
    journal: Journal,
    cache: Mutex<Option<CachedState<T>>>,
}

impl<T: StoreRecord> Store<T> {
    /// Opens the store over the journal at `path`.
    #[must_use]
    pub fn new(backend: Arc<dyn StorageBackend>, path: impl Into<String>) -> Self {
        Self {
            journal: Journal::new(backend, path),
            cache: Mutex::new(None),
        }
    }

    /// Returns the underlying journal.
    #[must_use]
    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    /// Replays the journal to its current head, reusing the cached state
    /// for the already-seen prefix.
    async fn state(&self) -> Result<(u64, Arc<BTreeMap<String, T>>)> {
        let head = self.journal.head_or_zero().await?;

        let (base_head, mut state) = {
            let cache = self
                .cache
                .lock()
                .map_err(|_| Error::io("store cache poisoned"))?;
            match cache.as_ref() {
                Some(cached) if cached.head == head => {
                    return Ok((head, cached.state.clone()));
                }
                Some(cached) if cached.head < head => {
                    (cached.head, (*cached.state).clone())
                }
                _ => (0, BTreeMap::new()),
            }
        };

        for raw in self.journal.load_range(base_head + 1, head).await? {
            decode::<Entry<T>>(&raw)?.apply(&mut state);
        }

        let state = Arc::new(state);
        let mut cache = self
            .cache
            .lock()
            .map_err(|_| Error::io("store cache poisoned"))?;
        // Keep whichever view is newer; a racing refresh may have advanced.
        if cache.as_ref().is_none_or(|cached| cached.head < head) {
            *cache = Some(CachedState {
                head,
                state: state.clone(),
            });
        }
        drop(cache);
        Ok((head, state))
    }

    /// Adds a record.
    ///
    /// # Errors
    ///
    /// Returns `Exists` if the key already resolves to a live record.
    pub async fn add(&self, record: &T) -> Result<()> {
        let key = record.key();
        loop {
            let (head, state) = self.state().await?;
            if state.contains_key(&key) {
                return Err(Error::exists(T::KIND, &key));
            }
            let payload = encode(&Entry::Add {
                record: record.clone(),
            })?;
            if self.journal.try_append_at(head + 1, payload).await? {
                return Ok(());
            }
        }
    }

    /// Updates the record at `key` through `apply`, which receives the
    /// current live record, validates any caller precondition, and returns
    /// the replacement.
    ///
    /// `apply` runs again whenever a concurrent writer invalidates the
    /// observed state, so it must be pure; returning an error (typically
    /// `Conflict`) aborts the update.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the key is absent, `Invalid` if `apply`
    /// changes the key, or whatever `apply` returns.
    pub async fn update<F>(&self, key: &str, apply: F) -> Result<T>
    where
        F: Fn(&T) -> Result<T>,
    {
        loop {
            let (head, state) = self.state().await?;
            let current = state.get(key).ok_or_else(|| Error::not_found(T::KIND, key))?;
            let updated = apply(current)?;
            if updated.key() != key {
                return Err(Error::invalid(format!(
                    "update cannot change {} key '{key}'; use rename",
                    T::KIND
                )));
            }
            let payload = encode(&Entry::Update {
                record: updated.clone(),
            })?;
            if self.journal.try_append_at(head + 1, payload).await? {
                return Ok(updated);
            }
        }
    }

    /// Deletes and returns the record at `key`.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the key is absent.
    pub async fn delete(&self, key: &str) -> Result<T> {
        loop {
            let (head, state) = self.state().await?;
            let current = state
                .get(key)
                .cloned()
                .ok_or_else(|| Error::not_found(T::KIND, key))?;
            let payload = encode(&Entry::<T>::Delete {
                key: key.to_string(),
            })?;
            if self.journal.try_append_at(head + 1, payload).await? {
                return Ok(current);
            }
        }
    }

    /// Moves the record at `from` to `record` (whose key differs) in one
    /// entry.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if `from` is absent, `Exists` if the new key is
    /// taken.
    pub async fn rename(&self, from: &str, record: &T) -> Result<()> {
        let to = record.key();
        loop {
            let (head, state) = self.state().await?;
            if !state.contains_key(from) {
                return Err(Error::not_found(T::KIND, from));
            }
            if to != from && state.contains_key(&to) {
                return Err(Error::exists(T::KIND, &to));
            }
            let payload = encode(&Entry::Rename {
                from: from.to_string(),
                record: record.clone(),
            })?;
            if self.journal.try_append_at(head + 1, payload).await? {
                return Ok(());
            }
        }
    }

    /// Looks up a record by key.
    pub async fn lookup(&self, key: &str) -> Result<Option<T>> {
        let (_, state) = self.state().await?;
        Ok(state.get(key).cloned())
    }

    /// Returns all live records in key order.
    pub async fn all(&self) -> Result<Vec<T>> {
        let (_, state) = self.state().await?;
        Ok(state.values().cloned().collect())
    }
}
