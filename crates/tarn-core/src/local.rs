//! Local filesystem storage backend.
//!
//! Objects live under a root directory; storage paths map to relative file
//! paths. Writes go through a temp file in the target directory so that a
//! reader never observes a partially-written object:
//!
//! - unconditional puts `rename(2)` the temp file over the target
//! - `DoesNotExist` puts `link(2)` the temp file to the target, which fails
//!   with `EEXIST` exactly when a concurrent writer won the race
//!
//! `MatchesVersion` is reported as [`WriteResult::Unsupported`]: a plain
//! filesystem has no CAS token, and the lake core never requires one.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::io::ErrorKind;
use std::ops::Range;
use std::path::{Component, Path, PathBuf};
use ulid::Ulid;

use crate::error::{Error, Result};
use crate::storage::{ObjectMeta, StorageBackend, WritePrecondition, WriteResult};

/// Storage backend over a local directory tree.
#[derive(Debug, Clone)]
pub struct LocalBackend {
    root: PathBuf,
}

impl LocalBackend {
    /// Creates a backend rooted at `root`, creating the directory if
    /// needed.
    ///
    /// # Errors
    ///
    /// Returns `Io` if the root cannot be created.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .map_err(|e| Error::io_with_source(format!("create {}: {e}", root.display()), e))?;
        Ok(Self { root })
    }

    /// Returns the root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<PathBuf> {
        if path.is_empty() {
            return Err(Error::invalid("empty storage path"));
        }
        let rel = Path::new(path);
        let traversal = rel
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if traversal {
            return Err(Error::invalid(format!("bad storage path '{path}'")));
        }
        Ok(self.root.join(rel))
    }

    async fn write_temp(&self, target: &Path, data: &Bytes) -> Result<PathBuf> {
        let parent = target
            .parent()
            .ok_or_else(|| Error::invalid(format!("bad target {}", target.display())))?;
        tokio::fs::create_dir_all(parent).await?;
        let mut name = target
            .file_name()
            .map(|n| n.to_os_string())
            .ok_or_else(|| Error::invalid(format!("bad target {}", target.display())))?;
        name.push(format!(".tmp-{}", Ulid::new()));
        let tmp = parent.join(name);
        tokio::fs::write(&tmp, data).await?;
        Ok(tmp)
    }
}

fn version_of(meta: &std::fs::Metadata) -> String {
    let nanos = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map_or(0, |d| d.as_nanos());
    format!("{}-{nanos}", meta.len())
}

fn object_meta(path: &str, meta: &std::fs::Metadata) -> ObjectMeta {
    ObjectMeta {
        path: path.to_string(),
        size: meta.len(),
        version: version_of(meta),
        last_modified: meta.modified().ok().map(DateTime::<Utc>::from),
    }
}

#[async_trait]
impl StorageBackend for LocalBackend {
    async fn get(&self, path: &str) -> Result<Bytes> {
        let file = self.resolve(path)?;
        match tokio::fs::read(&file).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(Error::not_found("object", path)),
            Err(e) => Err(e.into()),
        }
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
        let target = self.resolve(path)?;
        match precondition {
            WritePrecondition::None => {
                let tmp = self.write_temp(&target, &data).await?;
                tokio::fs::rename(&tmp, &target).await?;
                let meta = tokio::fs::metadata(&target).await?;
                Ok(WriteResult::Success {
                    version: version_of(&meta),
                })
            }
            WritePrecondition::DoesNotExist => {
                let tmp = self.write_temp(&target, &data).await?;
                let linked = tokio::fs::hard_link(&tmp, &target).await;
                let _ = tokio::fs::remove_file(&tmp).await;
                match linked {
                    Ok(()) => {
                        let meta = tokio::fs::metadata(&target).await?;
                        Ok(WriteResult::Success {
                            version: version_of(&meta),
                        })
                    }
                    Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                        let current = tokio::fs::metadata(&target)
                            .await
                            .map(|m| version_of(&m))
                            .unwrap_or_default();
                        Ok(WriteResult::PreconditionFailed {
                            current_version: current,
                        })
                    }
                    Err(e) => Err(e.into()),
                }
            }
            WritePrecondition::MatchesVersion(_) => Ok(WriteResult::Unsupported),
        }
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let target = self.resolve(path)?;
        match tokio::fs::remove_file(&target).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        let mut found = Vec::new();
        let mut pending = vec![self.root.clone()];
        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    pending.push(path);
                    continue;
                }
                let rel = path
                    .strip_prefix(&self.root)
                    .map_err(|e| Error::io(format!("list: {e}")))?;
                let rel = rel.to_string_lossy().replace('\\', "/");
                if rel.starts_with(prefix) {
                    let meta = entry.metadata().await?;
                    found.push(object_meta(&rel, &meta));
                }
            }
        }
        Ok(found)
    }

    async fn head(&self, path: &str) -> Result<Option<ObjectMeta>> {
        let target = self.resolve(path)?;
        match tokio::fs::metadata(&target).await {
            Ok(meta) => Ok(Some(object_meta(path, &meta))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
