//! Append-only, totally-ordered log of entries over the object store.
//!
//! Each entry is an individual immutable object named by its zero-padded
//! monotonically increasing 64-bit id; a `HEAD` object caches the current
//! maximum id. The write of the entry at `head + 1` with a does-not-exist
//! precondition is the linearization point: of any number of concurrent
//! appenders, exactly one claims the slot and the rest observe the failed
//! precondition and retry from a fresh head read.
//!
//! The `HEAD` object is only a hint. It is refreshed best-effort after a
//! successful append and may lag (or, between two racing refreshes, briefly
//! regress); readers repair it by probing forward until the next entry slot
//! is vacant. The logical head — the largest id with an entry — is monotone
//! non-decreasing no matter what the hint says.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use tarn_core::{Error, Result, StorageBackend, WritePrecondition, WriteResult};

/// Name of the head-hint object within a journal prefix.
const HEAD_NAME: &str = "HEAD";

#[derive(Debug, Serialize, Deserialize)]
struct HeadHint {
    head: u64,
}

/// An append-only log identified by a storage prefix.
#[derive(Clone)]
pub struct Journal {
    backend: Arc<dyn StorageBackend>,
    path: String,
}

impl Journal {
    /// Opens the journal at `path`. No I/O is performed; an empty journal
    /// simply has no entries yet.
    #[must_use]
    pub fn new(backend: Arc<dyn StorageBackend>, path: impl Into<String>) -> Self {
        Self {
            backend,
            path: path.into(),
        }
    }

    /// Returns the journal's storage prefix.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    fn entry_path(&self, id: u64) -> String {
        format!("{}/{id:020}.json", self.path)
    }

    fn head_path(&self) -> String {
        format!("{}/{HEAD_NAME}", self.path)
    }

    /// Returns the current head entry id.
    ///
    /// # Errors
    ///
    /// Returns `Empty` if the journal holds no entries.
    pub async fn head(&self) -> Result<u64> {
        match self.head_or_zero().await? {
            0 => Err(Error::empty(format!("journal {} has no entries", self.path))),
            head => Ok(head),
        }
    }

    /// Returns the head id, or zero for an empty journal.
    pub(crate) async fn head_or_zero(&self) -> Result<u64> {
        let mut head = match self.backend.get(&self.head_path()).await {
            Ok(bytes) => {
                let hint: HeadHint = serde_json::from_slice(&bytes).map_err(|e| {
                    Error::corrupt(format!("journal {} head hint: {e}", self.path))
                })?;
                hint.head
            }
            Err(err) if err.is_not_found() => 0,
            Err(err) => return Err(err),
        };
        // The hint may lag appends from other writers (or regress between
        // two racing refreshes). Probe forward to the true head.
        while self.backend.exists(&self.entry_path(head + 1)).await? {
            head += 1;
        }
        Ok(head)
    }

    /// Attempts to claim entry slot `id`.
    ///
    /// Returns `false` when another appender won the slot.
    pub(crate) async fn try_append_at(&self, id: u64, payload: Bytes) -> Result<bool> {
        match self
            .backend
            .put(&self.entry_path(id), payload, WritePrecondition::DoesNotExist)
            .await?
        {
            WriteResult::Success { .. } => {
                self.refresh_head_hint(id).await;
                Ok(true)
            }
            WriteResult::PreconditionFailed { .. } => Ok(false),
            WriteResult::Unsupported => Err(Error::invalid(format!(
                "journal {} requires a backend with conditional put",
                self.path
            ))),
        }
    }

    async fn refresh_head_hint(&self, id: u64) {
        let hint = match serde_json::to_vec(&HeadHint { head: id }) {
            Ok(bytes) => Bytes::from(bytes),
            Err(_) => return,
        };
        // Best effort: a failed or lost refresh is repaired by forward
        // probing on the next read.
        if let Err(err) = self
            .backend
            .put(&self.head_path(), hint, WritePrecondition::None)
            .await
        {
            tracing::debug!(journal = %self.path, id, error = %err, "head hint refresh failed");
        }
    }

    /// Appends an entry, retrying lost races, and returns its id.
    ///
    /// # Errors
    ///
    /// Propagates storage failures; never returns `Conflict` (losing the
    /// slot race is retried internally and each retry observes the entry
    /// that beat it, so the loop makes progress).
    pub async fn append(&self, payload: Bytes) -> Result<u64> {
        loop {
            let id = self.head_or_zero().await? + 1;
            if self.try_append_at(id, payload.clone()).await? {
                return Ok(id);
            }
        }
    }

    /// Appends a typed entry serialized as one JSON record.
    ///
    /// # Errors
    ///
    /// Propagates storage and serialization failures.
    pub async fn append_record<T: Serialize>(&self, entry: &T) -> Result<u64> {
        self.append(encode(entry)?).await
    }

    /// Reads the raw entry at `id`.
    ///
    /// # Errors
    ///
    /// Returns `Corrupt` if the id is at or below the head but the entry is
    /// missing (entries are contiguous).
    pub async fn entry(&self, id: u64) -> Result<Bytes> {
        match self.backend.get(&self.entry_path(id)).await {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.is_not_found() => Err(Error::corrupt(format!(
                "journal {} is missing entry {id}",
                self.path
            ))),
            Err(err) => Err(err),
        }
    }

    /// Loads entries `from..=to` in id order.
    pub(crate) async fn load_range(&self, from: u64, to: u64) -> Result<Vec<Bytes>> {
        let mut entries = Vec::new();
        for id in from..=to {
            entries.push(self.entry(id).await?);
        }
        Ok(entries)
    }

    /// Loads all entries up to `at` (or to the current head), in id order.
    ///
    /// # Errors
    ///
    /// Returns `Empty` for an empty journal.
    pub async fn load(&self, at: Option<u64>) -> Result<Vec<Bytes>> {
        let head = self.head().await?;
        let to = at.map_or(head, |at| at.min(head));
        self.load_range(1, to).await
    }

    /// Loads entries appended after `after`, for pull-based observers.
    ///
    /// Returns an empty vec when nothing new has been appended.
    pub async fn tail(&self, after: u64) -> Result<Vec<Bytes>> {
        let head = self.head_or_zero().await?;
        if head <= after {
            return Ok(Vec::new());
        }
        self.load_range(after + 1, head).await
    }
}

/// Serializes a typed journal entry as one JSON record.
pub(crate) fn encode<T: Serialize>(entry: &T) -> Result<Bytes> {
    serde_json::to_vec(entry)
        .map(Bytes::from)
        .map_err(|e| Error::io(format!("serialize journal entry: {e}")))
}

/// Parses a typed journal entry from its raw bytes.
pub(crate) fn decode<T: DeserializeOwned>(bytes: &Bytes) -> Result<T> {
    serde_json::from_slice(bytes).map_err(|e| Error::corrupt(format!("journal entry: {e}")))
}
