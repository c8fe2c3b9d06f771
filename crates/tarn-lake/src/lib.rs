//! # tarn-lake
//!
//! The Tarn lake storage core: a data lake for richly typed,
//! self-describing records. Heterogeneous record streams are persisted as
//! immutable, sort-ordered objects and exposed under a git-like
//! commit/branch model, on top of an object store whose only
//! synchronization primitive is a conditional put.
//!
//! ## Architecture
//!
//! ```text
//! Root                      lake.json + pools/ + index_rules/
//!  └─ Pool                  <pool_id>/
//!      ├─ commit journal    <pool_id>/commits/   (all branches)
//!      ├─ branch store      <pool_id>/branches/  (named tips)
//!      └─ data objects      <pool_id>/data/      (immutable, sorted)
//! ```
//!
//! Every mutation is decomposed into idempotent object writes followed by
//! exactly one conditional put on a journal entry slot; all cross-object
//! atomicity is obtained by making that slot the linearization point.
//! Branch tips are the only racy state: publishers that observe a moved tip
//! receive a `Conflict` and retry against the new tip.
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use serde_json::json;
//! use tarn_core::{MemoryBackend, SortKey};
//! use tarn_lake::{data::VecReader, Root};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> tarn_core::Result<()> {
//! let backend = Arc::new(MemoryBackend::new());
//! let root = Root::create(backend).await?;
//!
//! let pool = root
//!     .create_pool("logs", Some(SortKey::parse("ts:desc")?), 0, 0)
//!     .await?;
//! let main = pool.open_branch("main").await?;
//!
//! let mut reader = VecReader::from_values(vec![json!({"ts": 1, "v": "a"})]);
//! let commit = main.load(&mut reader, "tester", "first load").await?;
//! assert_eq!(main.tip().await?, Some(commit));
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod branch;
pub mod branches;
pub mod commit;
pub mod data;
pub mod index;
pub mod journal;
pub mod pool;
pub mod pools;
pub mod root;
pub mod snapshot;
pub mod store;
pub mod vacuum;

pub use branch::Branch;
pub use commit::{Action, Commit, CommitStore};
pub use data::{DataObject, Predicate, RecordMatch, RecordReader, VecReader};
pub use journal::Journal;
pub use pool::Pool;
pub use root::Root;
pub use snapshot::Snapshot;
