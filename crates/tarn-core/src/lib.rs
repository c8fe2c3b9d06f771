//! # tarn-core
//!
//! Core abstractions for the Tarn data lake.
//!
//! This crate provides the foundational types used across all Tarn components:
//!
//! - **Storage Backends**: A uniform async abstraction over local and remote
//!   object stores, whose only synchronization primitive is a conditional put
//! - **Identifiers**: Strongly-typed, time-ordered ids for pools, branches,
//!   commits, data objects, and index rules
//! - **Records**: Self-describing typed records and the sort-key machinery
//!   that orders them within a pool
//! - **Error Types**: The shared error taxonomy and result alias
//!
//! ## Crate Boundary
//!
//! `tarn-core` is the only crate allowed to define shared primitives. The
//! lake storage engine (`tarn-lake`) and all other components build on the
//! contracts defined here.
//!
//! ## Example
//!
//! ```rust
//! use tarn_core::prelude::*;
//!
//! // Generate a time-ordered pool identifier
//! let pool = PoolId::generate();
//!
//! // Pools order records by a sort key; the default is `ts` descending
//! let key = SortKey::default();
//! assert_eq!(key.to_string(), "ts:desc");
//! # let _ = pool;
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod id;
pub mod local;
pub mod observability;
pub mod record;
pub mod storage;

/// Prelude module for convenient imports.
///
/// # Example
///
/// ```rust
/// use tarn_core::prelude::*;
/// ```
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::id::{CommitId, ObjectId, PoolId, RuleId};
    pub use crate::local::LocalBackend;
    pub use crate::record::{FieldPath, KeyValue, Order, Record, SortKey};
    pub use crate::storage::{
        MemoryBackend, ObjectMeta, StorageBackend, WritePrecondition, WriteResult,
    };
}

// Re-export key types at crate root for ergonomics
pub use error::{Error, Result};
pub use id::{CommitId, ObjectId, PoolId, RuleId};
pub use local::LocalBackend;
pub use observability::{init_logging, lake_span, LogFormat};
pub use record::{FieldPath, KeyValue, Order, Record, SortKey};
pub use storage::{MemoryBackend, ObjectMeta, StorageBackend, WritePrecondition, WriteResult};
