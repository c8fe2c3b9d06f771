//! Immutable, sort-ordered data objects and their seek-index sidecars.
//!
//! A data object is a JSON-lines record file whose records are ordered by
//! the pool's sort key, written exactly once. Its companion sidecar maps
//! sort-key values to byte offsets so that range scans can start mid-file.
//! Object paths are derived from the pool id and object id; there is no
//! central name registry.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::sync::Arc;

use tarn_core::{
    Error, FieldPath, KeyValue, ObjectId, PoolId, Record, Result, SortKey, StorageBackend,
    WritePrecondition, WriteResult,
};

use crate::pools;

/// The record-file format tag carried in object metadata.
pub const FORMAT: &str = "jsonl";

/// Returns the storage path of an object's record file.
#[must_use]
pub fn object_path(pool: PoolId, id: ObjectId) -> String {
    format!("{pool}/data/{id}.{FORMAT}")
}

/// Returns the storage path of an object's seek-index sidecar.
#[must_use]
pub fn seek_path(pool: PoolId, id: ObjectId) -> String {
    format!("{pool}/data/{id}-seek.json")
}

/// Returns the storage path of an object's optional vector companion.
#[must_use]
pub fn vector_path(pool: PoolId, id: ObjectId) -> String {
    format!("{pool}/vectors/{id}.{FORMAT}")
}

/// Metadata describing one immutable data object.
///
/// `min` is the sort-key value of the first record in stored order and
/// `max` that of the last; for a descending pool `min` is therefore the
/// largest key. The values are recorded in the commit that introduces the
/// object and must match the file on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataObject {
    /// Unique object identifier; derives the object's paths.
    pub id: ObjectId,
    /// Record-file format tag.
    pub format: String,
    /// Number of records.
    pub count: u64,
    /// Record-file size in bytes.
    pub size: u64,
    /// Sort-key value at the first record.
    pub min: KeyValue,
    /// Sort-key value at the last record.
    pub max: KeyValue,
}

/// One row of the seek-index sidecar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeekEntry {
    /// Sort-key value of the record starting at `offset`.
    pub key: KeyValue,
    /// Byte offset of that record within the record file.
    pub offset: u64,
    /// Number of records preceding `offset`.
    pub count: u64,
}

/// The seek-index sidecar: one entry roughly every `stride` bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeekIndex {
    /// The stride the index was built with.
    pub stride: u64,
    /// Index rows in file order.
    pub entries: Vec<SeekEntry>,
}

/// A lazy source of records already ordered by the consumer's sort key.
///
/// This is the interface the lake consumes during `load`; the lake sorts
/// what it reads anyway, so an unsorted reader costs only the sort.
pub trait RecordReader: Send {
    /// Returns the next record, or `None` at end of stream.
    ///
    /// # Errors
    ///
    /// Implementations surface their own decode or transport failures.
    fn read(&mut self) -> Result<Option<Record>>;
}

/// A [`RecordReader`] over an in-memory vector.
pub struct VecReader {
    records: std::vec::IntoIter<Record>,
}

impl VecReader {
    /// Creates a reader over the given records.
    #[must_use]
    pub fn new(records: Vec<Record>) -> Self {
        Self {
            records: records.into_iter(),
        }
    }

    /// Creates a reader over raw JSON values.
    #[must_use]
    pub fn from_values(values: Vec<serde_json::Value>) -> Self {
        Self::new(values.into_iter().map(Record::new).collect())
    }
}

impl RecordReader for VecReader {
    fn read(&mut self) -> Result<Option<Record>> {
        Ok(self.records.next())
    }
}

/// A predicate over records, with a range test for pruning whole objects.
pub trait Predicate: Send + Sync {
    /// Could any record whose sort key lies between the object's extremes
    /// satisfy the predicate? `min`/`max` are in stored order.
    fn overlaps(&self, min: &KeyValue, max: &KeyValue) -> bool;

    /// Does this record satisfy the predicate?
    fn matches(&self, record: &Record) -> bool;
}

/// A predicate from a plain record closure; prunes nothing.
pub struct RecordMatch<F>(
    /// The record closure.
    pub F,
);

impl<F> Predicate for RecordMatch<F>
where
    F: Fn(&Record) -> bool + Send + Sync,
{
    fn overlaps(&self, _min: &KeyValue, _max: &KeyValue) -> bool {
        true
    }

    fn matches(&self, record: &Record) -> bool {
        (self.0)(record)
    }
}

/// A predicate selecting records whose field value lies in `[lo, hi]`.
pub struct KeyRangeMatch {
    /// The field the range applies to.
    pub path: FieldPath,
    /// Inclusive lower bound.
    pub lo: KeyValue,
    /// Inclusive upper bound.
    pub hi: KeyValue,
}

impl Predicate for KeyRangeMatch {
    fn overlaps(&self, min: &KeyValue, max: &KeyValue) -> bool {
        // Normalize stored order (descending pools store max first).
        let (lo, hi) = if min <= max { (min, max) } else { (max, min) };
        self.lo <= *hi && *lo <= self.hi
    }

    fn matches(&self, record: &Record) -> bool {
        let value = record.key(&self.path);
        self.lo <= value && value <= self.hi
    }
}

/// Accumulates sorted records into one object's byte form.
pub struct Writer {
    sort_key: SortKey,
    seek_stride: u64,
    id: ObjectId,
    buf: Vec<u8>,
    count: u64,
    last_mark: u64,
    min: Option<KeyValue>,
    max: Option<KeyValue>,
    seek: Vec<SeekEntry>,
}

impl Writer {
    /// Creates a writer for one object.
    #[must_use]
    pub fn new(sort_key: SortKey, seek_stride: u64) -> Self {
        Self {
            sort_key,
            seek_stride,
            id: ObjectId::generate(),
            buf: Vec::new(),
            count: 0,
            last_mark: 0,
            min: None,
            max: None,
            seek: Vec::new(),
        }
    }

    /// Returns the accumulated byte size.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.buf.len() as u64
    }

    /// Returns the accumulated record count.
    #[must_use]
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Appends a record, which must not sort before the previous one.
    ///
    /// # Errors
    ///
    /// Returns `Io` on serialization failure.
    pub fn push(&mut self, record: &Record) -> Result<()> {
        let line = record.to_line()?;
        self.push_line(line, self.sort_key.key_of(record));
        Ok(())
    }

    /// Appends a pre-serialized record line with its projected key.
    pub(crate) fn push_line(&mut self, line: Vec<u8>, key: KeyValue) {
        let offset = self.buf.len() as u64;
        if self.count == 0 || offset.saturating_sub(self.last_mark) >= self.seek_stride {
            self.seek.push(SeekEntry {
                key: key.clone(),
                offset,
                count: self.count,
            });
            self.last_mark = offset;
        }
        self.buf.extend_from_slice(&line);
        self.buf.push(b'\n');
        self.count += 1;
        if self.min.is_none() {
            self.min = Some(key.clone());
        }
        self.max = Some(key);
    }

    /// Persists the record file and its sidecar, returning the object
    /// metadata.
    ///
    /// Writes use the does-not-exist precondition on id-derived paths, so a
    /// retried finish of the same writer is idempotent.
    ///
    /// # Errors
    ///
    /// Returns `Empty` if no records were pushed; propagates storage
    /// failures.
    pub async fn finish(self, backend: &Arc<dyn StorageBackend>, pool: PoolId) -> Result<DataObject> {
        let (Some(min), Some(max)) = (self.min, self.max) else {
            return Err(Error::empty("object writer received no records"));
        };
        let object = DataObject {
            id: self.id,
            format: FORMAT.to_string(),
            count: self.count,
            size: self.buf.len() as u64,
            min,
            max,
        };

        put_new(backend, &object_path(pool, self.id), Bytes::from(self.buf)).await?;
        let sidecar = SeekIndex {
            stride: self.seek_stride,
            entries: self.seek,
        };
        let sidecar = serde_json::to_vec(&sidecar)
            .map_err(|e| Error::io(format!("serialize seek index: {e}")))?;
        put_new(backend, &seek_path(pool, self.id), Bytes::from(sidecar)).await?;

        tracing::debug!(
            pool = %pool,
            object = %object.id,
            count = object.count,
            size = object.size,
            "wrote data object"
        );
        Ok(object)
    }
}

async fn put_new(backend: &Arc<dyn StorageBackend>, path: &str, data: Bytes) -> Result<()> {
    match backend
        .put(path, data, WritePrecondition::DoesNotExist)
        .await?
    {
        // An existing object at an id-derived path can only be a replay of
        // the same write.
        WriteResult::Success { .. } | WriteResult::PreconditionFailed { .. } => Ok(()),
        WriteResult::Unsupported => Err(Error::invalid(format!(
            "data objects require a backend with conditional put: {path}"
        ))),
    }
}

/// Sorts `records` by the pool's key and writes them as one or more objects
/// of at most `threshold` bytes each.
///
/// # Errors
///
/// Propagates storage and serialization failures. An empty input produces
/// no objects.
pub async fn write_sorted(
    backend: &Arc<dyn StorageBackend>,
    config: &pools::Config,
    mut records: Vec<Record>,
) -> Result<Vec<DataObject>> {
    records.sort_by(|a, b| config.sort_key.compare(a, b));

    let mut objects = Vec::new();
    let mut writer: Option<Writer> = None;
    for record in &records {
        let line = record.to_line()?;
        let needed = line.len() as u64 + 1;
        let full = writer
            .as_ref()
            .is_some_and(|w| w.size() > 0 && w.size() + needed > config.threshold);
        if full {
            if let Some(w) = writer.take() {
                objects.push(w.finish(backend, config.id).await?);
            }
        }
        writer
            .get_or_insert_with(|| Writer::new(config.sort_key.clone(), config.seek_stride))
            .push_line(line, config.sort_key.key_of(record));
    }
    if let Some(w) = writer {
        objects.push(w.finish(backend, config.id).await?);
    }
    Ok(objects)
}

/// Reads every record of an object, in stored order.
///
/// # Errors
///
/// Returns `NotFound` if the object's bytes are gone, `Corrupt` on a
/// malformed record file.
pub async fn read_all(
    backend: &Arc<dyn StorageBackend>,
    pool: PoolId,
    id: ObjectId,
) -> Result<Vec<Record>> {
    let bytes = backend.get(&object_path(pool, id)).await?;
    records_from_bytes(&bytes)
}

/// Reads an object's seek-index sidecar.
///
/// # Errors
///
/// Returns `NotFound` if the sidecar is gone, `Corrupt` if it fails to
/// parse.
pub async fn read_seek_index(
    backend: &Arc<dyn StorageBackend>,
    pool: PoolId,
    id: ObjectId,
) -> Result<SeekIndex> {
    let bytes = backend.get(&seek_path(pool, id)).await?;
    serde_json::from_slice(&bytes).map_err(|e| Error::corrupt(format!("seek index {id}: {e}")))
}

/// Scans an object's records starting at the first record whose key is not
/// before `from` in stored order, seeking past the prefix via the sidecar.
///
/// # Errors
///
/// Propagates storage failures and `Corrupt` record files.
pub async fn scan_from(
    backend: &Arc<dyn StorageBackend>,
    pool: PoolId,
    object: &DataObject,
    sort_key: &SortKey,
    from: &KeyValue,
) -> Result<Vec<Record>> {
    let index = read_seek_index(backend, pool, object.id).await?;
    let mut offset = 0;
    for entry in &index.entries {
        if sort_key.compare_values(&entry.key, from) == Ordering::Greater {
            break;
        }
        offset = entry.offset;
    }

    let bytes = backend
        .get_range(&object_path(pool, object.id), offset..object.size)
        .await?;
    let records = records_from_bytes(&bytes)?;
    Ok(records
        .into_iter()
        .skip_while(|record| {
            sort_key.compare_values(&sort_key.key_of(record), from) == Ordering::Less
        })
        .collect())
}

/// Deletes an object's bytes: record file, sidecar, and vector companion.
/// Idempotent.
///
/// # Errors
///
/// Propagates storage failures other than absence.
pub async fn delete_bytes(
    backend: &Arc<dyn StorageBackend>,
    pool: PoolId,
    id: ObjectId,
) -> Result<()> {
    backend.delete(&object_path(pool, id)).await?;
    backend.delete(&seek_path(pool, id)).await?;
    backend.delete(&vector_path(pool, id)).await?;
    Ok(())
}

fn records_from_bytes(bytes: &Bytes) -> Result<Vec<Record>> {
    bytes
        .split(|b| *b == b'\n')
        .filter(|line| !line.is_empty())
        .map(Record::from_line)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tarn_core::MemoryBackend;

    fn backend() -> Arc<dyn StorageBackend> {
        Arc::new(MemoryBackend::new())
    }

    fn pool_config(threshold: u64) -> pools::Config {
        pools::Config::new(
            "logs",
            Some(SortKey::parse("ts:desc").unwrap()),
            threshold,
            0,
        )
    }

    fn records(values: &[serde_json::Value]) -> Vec<Record> {
        values.iter().cloned().map(Record::new).collect()
    }

    #[tokio::test]
    async fn writer_records_extremes_in_stored_order() {
        let backend = backend();
        let config = pool_config(0);
        let objects = write_sorted(
            &backend,
            &config,
            records(&[
                json!({"ts": 3, "v": "a"}),
                json!({"ts": 1, "v": "b"}),
                json!({"ts": 2, "v": "c"}),
            ]),
        )
        .await
        .unwrap();

        assert_eq!(objects.len(), 1);
        let object = &objects[0];
        assert_eq!(object.count, 3);
        assert_eq!(object.min, KeyValue::Int(3));
        assert_eq!(object.max, KeyValue::Int(1));

        let back = read_all(&backend, config.id, object.id).await.unwrap();
        let ts: Vec<i64> = back
            .iter()
            .map(|r| r.as_value()["ts"].as_i64().unwrap())
            .collect();
        assert_eq!(ts, vec![3, 2, 1]);
    }

    #[tokio::test]
    async fn threshold_partitions_into_runs() {
        let backend = backend();
        // Tiny threshold: every record gets its own object.
        let config = pool_config(4);
        let objects = write_sorted(
            &backend,
            &config,
            records(&[json!({"ts": 1}), json!({"ts": 2}), json!({"ts": 3})]),
        )
        .await
        .unwrap();

        assert_eq!(objects.len(), 3);
        // Descending: runs cover the key range in stored order.
        assert_eq!(objects[0].min, KeyValue::Int(3));
        assert_eq!(objects[2].max, KeyValue::Int(1));
        for object in &objects {
            assert_eq!(object.count, 1);
        }
    }

    #[tokio::test]
    async fn finish_writes_sidecar() {
        let backend = backend();
        let config = pools::Config::new(
            "logs",
            Some(SortKey::parse("ts:asc").unwrap()),
            0,
            // One seek row per 16 bytes.
            16,
        );
        let values: Vec<serde_json::Value> = (0..20).map(|ts| json!({"ts": ts})).collect();
        let objects = write_sorted(&backend, &config, records(&values)).await.unwrap();
        assert_eq!(objects.len(), 1);

        let index = read_seek_index(&backend, config.id, objects[0].id)
            .await
            .unwrap();
        assert!(index.entries.len() > 1, "expected multiple seek rows");
        assert_eq!(index.entries[0].offset, 0);
        assert_eq!(index.entries[0].count, 0);
        // Offsets and counts increase monotonically.
        for pair in index.entries.windows(2) {
            assert!(pair[1].offset > pair[0].offset);
            assert!(pair[1].count > pair[0].count);
        }
    }

    #[tokio::test]
    async fn scan_from_skips_the_prefix() {
        let backend = backend();
        let config = pools::Config::new("logs", Some(SortKey::parse("ts:asc").unwrap()), 0, 16);
        let values: Vec<serde_json::Value> = (0..20).map(|ts| json!({"ts": ts})).collect();
        let objects = write_sorted(&backend, &config, records(&values)).await.unwrap();

        let from = KeyValue::Int(15);
        let tail = scan_from(&backend, config.id, &objects[0], &config.sort_key, &from)
            .await
            .unwrap();
        let ts: Vec<i64> = tail
            .iter()
            .map(|r| r.as_value()["ts"].as_i64().unwrap())
            .collect();
        assert_eq!(ts, vec![15, 16, 17, 18, 19]);
    }

    #[tokio::test]
    async fn key_range_predicate_prunes_disjoint_objects() {
        let pred = KeyRangeMatch {
            path: FieldPath::parse("ts").unwrap(),
            lo: KeyValue::Int(5),
            hi: KeyValue::Int(9),
        };
        // Stored order is descending: min=20, max=10.
        assert!(!pred.overlaps(&KeyValue::Int(20), &KeyValue::Int(10)));
        assert!(pred.overlaps(&KeyValue::Int(7), &KeyValue::Int(1)));
        assert!(pred.matches(&Record::new(json!({"ts": 6}))));
        assert!(!pred.matches(&Record::new(json!({"ts": 4}))));
    }

    #[tokio::test]
    async fn delete_bytes_is_idempotent() {
        let backend = backend();
        let config = pool_config(0);
        let objects = write_sorted(&backend, &config, records(&[json!({"ts": 1})]))
            .await
            .unwrap();
        let id = objects[0].id;

        delete_bytes(&backend, config.id, id).await.unwrap();
        delete_bytes(&backend, config.id, id).await.unwrap();
        assert!(read_all(&backend, config.id, id).await.unwrap_err().is_not_found());
    }
}
