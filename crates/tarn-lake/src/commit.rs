//! The per-pool commit log.
//!
//! One journal holds every commit of a pool, across all branches. A commit
//! is a set of actions made atomically visible under a parent commit id;
//! the parent may belong to any branch, so the log is a tree rooted at the
//! sentinel (`parent: None`) and branches are just named pointers into it.
//! Commits in the journal that no branch can reach are garbage and are
//! collected by vacuum, never reused.

use chrono::{DateTime, Utc};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use tarn_core::{CommitId, Error, ObjectId, Result, StorageBackend};

use crate::data::DataObject;
use crate::journal::{decode, Journal};
use crate::snapshot::Snapshot;

/// Bounded size of the per-pool snapshot cache.
const SNAPSHOT_CACHE: usize = 256;

/// One atomic action within a commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Action {
    /// Makes a persisted data object live.
    AddObject {
        /// The object's recorded metadata.
        object: DataObject,
    },
    /// Removes an object from the live set.
    DeleteObject {
        /// The object being deleted.
        id: ObjectId,
        /// The commit performing the deletion.
        cause: CommitId,
    },
    /// Attaches a vector companion to a live object.
    AddVector {
        /// The owning object.
        id: ObjectId,
    },
    /// Detaches an object's vector companion.
    DeleteVector {
        /// The owning object.
        id: ObjectId,
    },
    /// Attaches opaque metadata to the commit itself.
    AddCommitMeta {
        /// Metadata key.
        key: String,
        /// One self-describing record.
        value: serde_json::Value,
    },
}

/// A commit: a parent-linked, atomically visible set of actions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Commit {
    /// Unique commit identifier.
    pub id: CommitId,
    /// The previous commit, or `None` for a child of the root sentinel.
    pub parent: Option<CommitId>,
    /// Opaque author string.
    pub author: String,
    /// Publication timestamp.
    pub date: DateTime<Utc>,
    /// Opaque commit message.
    pub message: String,
    /// The actions, applied in order during replay.
    pub actions: Vec<Action>,
}

impl Commit {
    /// Creates a commit with a fresh id.
    #[must_use]
    pub fn new(
        parent: Option<CommitId>,
        author: impl Into<String>,
        message: impl Into<String>,
        actions: Vec<Action>,
    ) -> Self {
        Self {
            id: CommitId::generate(),
            parent,
            author: author.into(),
            date: Utc::now(),
            message: message.into(),
            actions,
        }
    }

    /// Returns the commit-metadata entries carried by this commit.
    pub fn metadata(&self) -> impl Iterator<Item = (&str, &serde_json::Value)> {
        self.actions.iter().filter_map(|action| match action {
            Action::AddCommitMeta { key, value } => Some((key.as_str(), value)),
            _ => None,
        })
    }
}

struct CommitCache {
    head: u64,
    map: Arc<HashMap<CommitId, Arc<Commit>>>,
}

/// The commit journal of one pool, with bounded commit and snapshot caches.
pub struct CommitStore {
    journal: Journal,
    commits: Mutex<Option<CommitCache>>,
    snapshots: Mutex<LruCache<CommitId, Arc<Snapshot>>>,
}

impl CommitStore {
    /// Opens the commit store over the journal at `path`.
    #[must_use]
    pub fn new(backend: Arc<dyn StorageBackend>, path: impl Into<String>) -> Self {
        let capacity = NonZeroUsize::new(SNAPSHOT_CACHE).unwrap_or(NonZeroUsize::MIN);
        Self {
            journal: Journal::new(backend, path),
            commits: Mutex::new(None),
            snapshots: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Returns the underlying journal.
    #[must_use]
    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    /// Appends a commit entry, returning its journal id.
    ///
    /// # Errors
    ///
    /// Returns `Empty` for a commit with no actions; propagates storage
    /// failures.
    pub async fn put(&self, commit: &Commit) -> Result<u64> {
        if commit.actions.is_empty() {
            return Err(Error::empty(format!("commit {} has no actions", commit.id)));
        }
        self.journal.append_record(commit).await
    }

    /// Replays the journal into the id → commit map, reusing the cached
    /// prefix.
    async fn commits(&self) -> Result<Arc<HashMap<CommitId, Arc<Commit>>>> {
        let head = self.journal.head_or_zero().await?;

        let (base_head, mut map) = {
            let cache = self
                .commits
                .lock()
                .map_err(|_| Error::io("commit cache poisoned"))?;
            match cache.as_ref() {
                Some(cached) if cached.head == head => return Ok(cached.map.clone()),
                Some(cached) if cached.head < head => (cached.head, (*cached.map).clone()),
                _ => (0, HashMap::new()),
            }
        };

        for raw in self.journal.load_range(base_head + 1, head).await? {
            let commit: Commit = decode(&raw)?;
            map.insert(commit.id, Arc::new(commit));
        }

        let map = Arc::new(map);
        let mut cache = self
            .commits
            .lock()
            .map_err(|_| Error::io("commit cache poisoned"))?;
        if cache.as_ref().is_none_or(|cached| cached.head < head) {
            *cache = Some(CommitCache {
                head,
                map: map.clone(),
            });
        }
        drop(cache);
        Ok(map)
    }

    /// Looks up a commit by id.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the pool's journal holds no such commit.
    pub async fn get(&self, id: CommitId) -> Result<Arc<Commit>> {
        self.commits()
            .await?
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::not_found("commit", id))
    }

    /// Walks parent pointers from `tip` back to the root sentinel,
    /// returning commits tip-first.
    ///
    /// # Errors
    ///
    /// Returns `Corrupt` if the chain references a missing commit.
    pub async fn ancestors(&self, tip: CommitId) -> Result<Vec<Arc<Commit>>> {
        let commits = self.commits().await?;
        let mut chain = Vec::new();
        let mut cursor = Some(tip);
        while let Some(id) = cursor {
            let commit = commits.get(&id).ok_or_else(|| {
                Error::corrupt(format!("commit chain references missing commit {id}"))
            })?;
            cursor = commit.parent;
            chain.push(commit.clone());
        }
        Ok(chain)
    }

    /// Materializes the snapshot at `tip`.
    ///
    /// Snapshots are cached per commit id and reused as bases: the walk
    /// from `tip` stops at the nearest cached ancestor and replays only the
    /// suffix.
    ///
    /// # Errors
    ///
    /// Returns `Corrupt` on a broken chain or a chain whose replay fails
    /// its own preconditions.
    pub async fn snapshot(&self, tip: Option<CommitId>) -> Result<Arc<Snapshot>> {
        let Some(tip) = tip else {
            return Ok(Arc::new(Snapshot::empty()));
        };

        let commits = self.commits().await?;
        let mut suffix: Vec<Arc<Commit>> = Vec::new();
        let mut base = Arc::new(Snapshot::empty());
        let mut cursor = Some(tip);
        while let Some(id) = cursor {
            if let Some(cached) = self.cached_snapshot(id)? {
                if suffix.is_empty() {
                    return Ok(cached);
                }
                base = cached;
                break;
            }
            let commit = commits.get(&id).ok_or_else(|| {
                Error::corrupt(format!("commit chain references missing commit {id}"))
            })?;
            cursor = commit.parent;
            suffix.push(commit.clone());
        }

        let mut snapshot = (*base).clone();
        for commit in suffix.iter().rev() {
            snapshot.apply(commit).map_err(|e| {
                Error::corrupt(format!("replay of commit {} failed: {e}", commit.id))
            })?;
        }

        let snapshot = Arc::new(snapshot);
        let mut cache = self
            .snapshots
            .lock()
            .map_err(|_| Error::io("snapshot cache poisoned"))?;
        cache.put(tip, snapshot.clone());
        drop(cache);
        Ok(snapshot)
    }

    fn cached_snapshot(&self, id: CommitId) -> Result<Option<Arc<Snapshot>>> {
        let mut cache = self
            .snapshots
            .lock()
            .map_err(|_| Error::io("snapshot cache poisoned"))?;
        Ok(cache.get(&id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tarn_core::{KeyValue, MemoryBackend};

    fn store() -> CommitStore {
        CommitStore::new(Arc::new(MemoryBackend::new()), "p/commits")
    }

    fn object(n: i64) -> DataObject {
        DataObject {
            id: ObjectId::generate(),
            format: crate::data::FORMAT.to_string(),
            count: 1,
            size: 10,
            min: KeyValue::Int(n),
            max: KeyValue::Int(n),
        }
    }

    #[tokio::test]
    async fn put_then_get() {
        let store = store();
        let commit = Commit::new(
            None,
            "tester",
            "add one",
            vec![Action::AddObject { object: object(1) }],
        );
        store.put(&commit).await.unwrap();
        assert_eq!(*store.get(commit.id).await.unwrap(), commit);
        assert!(store
            .get(CommitId::generate())
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn empty_commit_is_rejected() {
        let store = store();
        let commit = Commit::new(None, "tester", "nothing", vec![]);
        assert!(store.put(&commit).await.unwrap_err().is_empty());
    }

    #[tokio::test]
    async fn snapshot_folds_the_chain() {
        let store = store();
        let (a, b) = (object(1), object(2));

        let first = Commit::new(
            None,
            "t",
            "",
            vec![Action::AddObject { object: a.clone() }],
        );
        store.put(&first).await.unwrap();

        let second = Commit::new(
            Some(first.id),
            "t",
            "",
            vec![
                Action::AddObject { object: b.clone() },
                Action::DeleteObject {
                    id: a.id,
                    cause: CommitId::generate(),
                },
            ],
        );
        store.put(&second).await.unwrap();

        let at_first = store.snapshot(Some(first.id)).await.unwrap();
        assert!(at_first.has(a.id) && !at_first.has(b.id));

        let at_second = store.snapshot(Some(second.id)).await.unwrap();
        assert!(!at_second.has(a.id) && at_second.has(b.id));

        // snapshot(C) == snapshot(parent(C)) + C.actions
        let mut derived = (*at_first).clone();
        derived.apply(&second).unwrap();
        assert_eq!(derived, *at_second);
    }

    #[tokio::test]
    async fn snapshot_of_root_sentinel_is_empty() {
        let store = store();
        assert!(store.snapshot(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn snapshots_are_cached_and_shared() {
        let store = store();
        let commit = Commit::new(
            None,
            "t",
            "",
            vec![Action::AddObject { object: object(1) }],
        );
        store.put(&commit).await.unwrap();

        let one = store.snapshot(Some(commit.id)).await.unwrap();
        let two = store.snapshot(Some(commit.id)).await.unwrap();
        assert!(Arc::ptr_eq(&one, &two));
    }

    #[tokio::test]
    async fn ancestors_walk_tip_first() {
        let store = store();
        let first = Commit::new(None, "t", "", vec![Action::AddObject { object: object(1) }]);
        store.put(&first).await.unwrap();
        let second = Commit::new(
            Some(first.id),
            "t",
            "",
            vec![Action::AddObject { object: object(2) }],
        );
        store.put(&second).await.unwrap();

        let chain = store.ancestors(second.id).await.unwrap();
        let ids: Vec<CommitId> = chain.iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![second.id, first.id]);
    }

    #[tokio::test]
    async fn commit_metadata_is_attached_to_the_commit() {
        let store = store();
        let commit = Commit::new(
            None,
            "t",
            "",
            vec![
                Action::AddObject { object: object(1) },
                Action::AddCommitMeta {
                    key: "origin".into(),
                    value: serde_json::json!({"source": "s3://bucket"}),
                },
            ],
        );
        store.put(&commit).await.unwrap();

        let fetched = store.get(commit.id).await.unwrap();
        let metas: Vec<_> = fetched.metadata().collect();
        assert_eq!(metas.len(), 1);
        assert_eq!(metas[0].0, "origin");

        // Metadata does not affect liveness.
        let snap = store.snapshot(Some(commit.id)).await.unwrap();
        assert_eq!(snap.len(), 1);
    }
}
