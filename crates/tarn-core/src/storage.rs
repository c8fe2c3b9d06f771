//! Storage backend abstraction for object storage (local filesystem, S3,
//! GCS).
//!
//! This module defines the storage contract the entire lake relies on:
//!
//! - Whole-object reads and writes of immutable byte sequences
//! - Conditional writes with preconditions — the **only** atomicity
//!   primitive the lake uses; every cross-object mutation is funneled
//!   through one conditional put on a well-known path
//! - Prefix listing and metadata without reading content
//!
//! The version token is an opaque `String` so that different backends can
//! supply whatever CAS token they natively have (numeric generation, `ETag`,
//! inode stamp). Backends that cannot honor a requested precondition report
//! [`WriteResult::Unsupported`] rather than guessing; the lake permits a
//! best-effort fallback for exactly one write (the lake magic file).

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::ops::Range;
use std::sync::{Arc, RwLock};

use crate::error::{Error, Result};

/// Precondition for conditional writes.
#[derive(Debug, Clone)]
pub enum WritePrecondition {
    /// Write only if no object exists at the path.
    DoesNotExist,
    /// Write only if the object's version matches the given token.
    MatchesVersion(String),
    /// Write unconditionally.
    None,
}

/// Result of a conditional write.
///
/// Precondition failure is a normal result, never an error: callers decide
/// whether losing the race is a retry (journal append) or a conflict
/// (branch tip).
#[derive(Debug, Clone)]
pub enum WriteResult {
    /// Write succeeded; returns the new version token.
    Success {
        /// The version token after the write.
        version: String,
    },
    /// The precondition did not hold.
    PreconditionFailed {
        /// The version that caused the precondition to fail.
        current_version: String,
    },
    /// The backend cannot evaluate the requested precondition.
    Unsupported,
}

/// Metadata about a stored object.
#[derive(Debug, Clone)]
pub struct ObjectMeta {
    /// Object path (key).
    pub path: String,
    /// Object size in bytes.
    pub size: u64,
    /// Opaque version token for conditional writes.
    pub version: String,
    /// Last modification timestamp, when the backend tracks one.
    pub last_modified: Option<DateTime<Utc>>,
}

/// Object storage trait implemented by every backend.
///
/// All methods may block arbitrarily on I/O; cancelling the future aborts
/// the operation. Implementations must be safe for concurrent callers and
/// must make `put` with [`WritePrecondition::DoesNotExist`] atomic against
/// concurrent writers on the same path.
#[async_trait]
pub trait StorageBackend: Send + Sync + 'static {
    /// Reads an entire object.
    ///
    /// Returns `NotFound` if no object exists at the path.
    async fn get(&self, path: &str) -> Result<Bytes>;

    /// Reads a byte range from an object.
    ///
    /// The end is clamped to the object length; a start beyond the length
    /// or an end before the start is `Invalid`.
    async fn get_range(&self, path: &str, range: Range<u64>) -> Result<Bytes>;

    /// Writes an object, honoring the precondition.
    async fn put(
        &self,
        path: &str,
        data: Bytes,
        precondition: WritePrecondition,
    ) -> Result<WriteResult>;

    /// Deletes an object. Idempotent: absent objects succeed.
    async fn delete(&self, path: &str) -> Result<()>;

    /// Lists objects under a prefix, in unspecified order.
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>>;

    /// Returns object metadata without reading content, or `None` when
    /// absent.
    async fn head(&self, path: &str) -> Result<Option<ObjectMeta>>;

    /// Returns whether an object exists at the path.
    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.head(path).await?.is_some())
    }

    /// Returns the object's size in bytes.
    ///
    /// Returns `NotFound` when absent.
    async fn size(&self, path: &str) -> Result<u64> {
        self.head(path)
            .await?
            .map(|meta| meta.size)
            .ok_or_else(|| Error::not_found("object", path))
    }
}

/// Convenience: writes unconditionally, discarding the version token.
///
/// # Errors
///
/// Propagates backend errors; a `PreconditionFailed` cannot occur.
pub async fn put_unchecked(
    backend: &dyn StorageBackend,
    path: &str,
    data: Bytes,
) -> Result<()> {
    match backend.put(path, data, WritePrecondition::None).await? {
        WriteResult::Success { .. } => Ok(()),
        WriteResult::PreconditionFailed { .. } | WriteResult::Unsupported => Err(Error::io(
            format!("unconditional put refused at {path}"),
        )),
    }
}

/// In-memory storage backend.
///
/// Thread-safe via `RwLock`; numeric version tokens simulate a
/// generation-tracking cloud store. Used by tests and as the reference
/// implementation of the conditional-put contract.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    objects: Arc<RwLock<HashMap<String, StoredObject>>>,
}

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    version: i64,
    last_modified: DateTime<Utc>,
}

impl MemoryBackend {
    /// Creates a new empty memory backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl StoredObject {
    fn meta(&self, path: &str) -> ObjectMeta {
        ObjectMeta {
            path: path.to_string(),
            size: self.data.len() as u64,
            version: self.version.to_string(),
            last_modified: Some(self.last_modified),
        }
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn get(&self, path: &str) -> Result<Bytes> {
        let objects = self
            .objects
            .read()
            .map_err(|_| Error::io("storage lock poisoned"))?;
        objects
            .get(path)
            .map(|o| o.data.clone())
            .ok_or_else(|| Error::not_found("object", path))
    }

    async fn get_range(&self, path: &str, range: Range<u64>) -> Result<Bytes> {
        let data = self.get(path).await?;
        let len = data.len();
        let start = usize::try_from(range.start).unwrap_or(usize::MAX);
        if start > len {
            return Err(Error::invalid(format!(
                "range start {start} exceeds object length {len}"
            )));
        }
        let end = usize::try_from(range.end).unwrap_or(usize::MAX).min(len);
        if end < start {
            return Err(Error::invalid(format!(
                "range end {end} is before start {start}"
            )));
        }
        Ok(data.slice(start..end))
    }

    async fn put(
        &self,
        path: &str,
        data: Bytes,
        precondition: WritePrecondition,
    ) -> Result<WriteResult> {
        let mut objects = self
            .objects
            .write()
            .map_err(|_| Error::io("storage lock poisoned"))?;
        let current = objects.get(path);

        match precondition {
            WritePrecondition::DoesNotExist => {
                if let Some(obj) = current {
                    return Ok(WriteResult::PreconditionFailed {
                        current_version: obj.version.to_string(),
                    });
                }
            }
            WritePrecondition::MatchesVersion(expected) => match current {
                Some(obj) if obj.version.to_string() != expected => {
                    return Ok(WriteResult::PreconditionFailed {
                        current_version: obj.version.to_string(),
                    });
                }
                None => {
                    return Ok(WriteResult::PreconditionFailed {
                        current_version: "0".to_string(),
                    });
                }
                _ => {}
            },
            WritePrecondition::None => {}
        }

        let new_version = current.map_or(1, |o| o.version + 1);
        objects.insert(
            path.to_string(),
            StoredObject {
                data,
                version: new_version,
                last_modified: Utc::now(),
            },
        );
        drop(objects);

        Ok(WriteResult::Success {
            version: new_version.to_string(),
        })
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.objects
            .write()
            .map_err(|_| Error::io("storage lock poisoned"))?
            .remove(path);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        let objects = self
            .objects
            .read()
            .map_err(|_| Error::io("storage lock poisoned"))?;
        Ok(objects
            .iter()
            .filter(|(path, _)| path.starts_with(prefix))
            .map(|(path, obj)| obj.meta(path))
            .collect())
    }

    async fn head(&self, path: &str) -> Result<Option<ObjectMeta>> {
        let objects = self
            .objects
            .read()
            .map_err(|_| Error::io("storage lock poisoned"))?;
        Ok(objects.get(path).map(|obj| obj.meta(path)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn roundtrip() {
        let backend = MemoryBackend::new();
        let data = Bytes::from("hello world");

        let result = backend
            .put("pool/data/x.jsonl", data.clone(), WritePrecondition::None)
            .await
            .unwrap();
        assert!(matches!(result, WriteResult::Success { ref version } if version == "1"));

        assert_eq!(backend.get("pool/data/x.jsonl").await.unwrap(), data);
        assert_eq!(backend.size("pool/data/x.jsonl").await.unwrap(), 11);
    }

    #[tokio::test]
    async fn get_missing_is_not_found() {
        let backend = MemoryBackend::new();
        let err = backend.get("nope").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn does_not_exist_precondition_races_to_one_winner() {
        let backend = MemoryBackend::new();

        let first = backend
            .put("lake.json", Bytes::from("a"), WritePrecondition::DoesNotExist)
            .await
            .unwrap();
        assert!(matches!(first, WriteResult::Success { .. }));

        let second = backend
            .put("lake.json", Bytes::from("b"), WritePrecondition::DoesNotExist)
            .await
            .unwrap();
        assert!(matches!(second, WriteResult::PreconditionFailed { .. }));

        // The winner's bytes survive.
        assert_eq!(backend.get("lake.json").await.unwrap(), Bytes::from("a"));
    }

    #[tokio::test]
    async fn matches_version_precondition() {
        let backend = MemoryBackend::new();
        let WriteResult::Success { version } = backend
            .put("head", Bytes::from("1"), WritePrecondition::None)
            .await
            .unwrap()
        else {
            panic!("expected success");
        };

        let ok = backend
            .put(
                "head",
                Bytes::from("2"),
                WritePrecondition::MatchesVersion(version.clone()),
            )
            .await
            .unwrap();
        assert!(matches!(ok, WriteResult::Success { .. }));

        let stale = backend
            .put(
                "head",
                Bytes::from("3"),
                WritePrecondition::MatchesVersion(version),
            )
            .await
            .unwrap();
        assert!(matches!(stale, WriteResult::PreconditionFailed { .. }));
    }

    #[tokio::test]
    async fn range_reads_clamp_and_validate() {
        let backend = MemoryBackend::new();
        backend
            .put("obj", Bytes::from("hello"), WritePrecondition::None)
            .await
            .unwrap();

        assert_eq!(
            backend.get_range("obj", 0..100).await.unwrap(),
            Bytes::from("hello")
        );
        assert!(backend.get_range("obj", 100..200).await.is_err());
        assert!(backend.get_range("obj", 4..2).await.is_err());
    }

    #[tokio::test]
    async fn list_by_prefix() {
        let backend = MemoryBackend::new();
        for path in ["p1/data/a", "p1/data/b", "p2/data/c"] {
            backend
                .put(path, Bytes::from("x"), WritePrecondition::None)
                .await
                .unwrap();
        }
        assert_eq!(backend.list("p1/data/").await.unwrap().len(), 2);
        assert_eq!(backend.list("p2/").await.unwrap().len(), 1);
        assert!(backend.list("p3/").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let backend = MemoryBackend::new();
        backend
            .put("obj", Bytes::from("x"), WritePrecondition::None)
            .await
            .unwrap();
        backend.delete("obj").await.unwrap();
        backend.delete("obj").await.unwrap();
        assert!(!backend.exists("obj").await.unwrap());
    }
}
