//! Strongly-typed identifiers for lake entities.
//!
//! All identifiers in Tarn are:
//! - **Strongly typed**: a `CommitId` cannot be passed where an `ObjectId`
//!   is expected
//! - **Time-ordered**: ULIDs encode creation time and sort
//!   lexicographically by it
//! - **Collision-resistant**: globally unique without coordination, and
//!   never reused
//!
//! The embedded timestamp is load-bearing: vacuum uses it to bound its
//! candidate set so that objects persisted by in-flight loads are never
//! collected before their commit publishes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

use crate::error::{Error, Result};

/// A unique identifier for a data pool.
///
/// The pool id is the permanent handle: a pool may be renamed, but its id
/// never changes and names its byte tree in the object store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PoolId(Ulid);

impl PoolId {
    /// Generates a new unique pool id.
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new())
    }

    /// Creates a pool id from a raw ULID.
    #[must_use]
    pub const fn from_ulid(ulid: Ulid) -> Self {
        Self(ulid)
    }

    /// Returns the underlying ULID.
    #[must_use]
    pub const fn as_ulid(&self) -> Ulid {
        self.0
    }

    /// Returns the creation timestamp encoded in the id.
    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        created_at(self.0)
    }
}

impl fmt::Display for PoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for PoolId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        parse(s, "pool id").map(Self)
    }
}

/// A unique identifier for a commit in a pool's commit log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommitId(Ulid);

impl CommitId {
    /// Generates a new unique commit id.
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new())
    }

    /// Creates a commit id from a raw ULID.
    #[must_use]
    pub const fn from_ulid(ulid: Ulid) -> Self {
        Self(ulid)
    }

    /// Returns the underlying ULID.
    #[must_use]
    pub const fn as_ulid(&self) -> Ulid {
        self.0
    }

    /// Returns the creation timestamp encoded in the id.
    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        created_at(self.0)
    }
}

impl fmt::Display for CommitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for CommitId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        parse(s, "commit id").map(Self)
    }
}

/// A unique identifier for an immutable data object.
///
/// Object paths are derived from the pool id and object id; there is no
/// central name registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectId(Ulid);

impl ObjectId {
    /// Generates a new unique object id.
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new())
    }

    /// Creates an object id from a raw ULID.
    #[must_use]
    pub const fn from_ulid(ulid: Ulid) -> Self {
        Self(ulid)
    }

    /// Returns the underlying ULID.
    #[must_use]
    pub const fn as_ulid(&self) -> Ulid {
        self.0
    }

    /// Returns the creation timestamp encoded in the id.
    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        created_at(self.0)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ObjectId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        parse(s, "object id").map(Self)
    }
}

/// A unique identifier for a secondary-index rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RuleId(Ulid);

impl RuleId {
    /// Generates a new unique rule id.
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new())
    }

    /// Creates a rule id from a raw ULID.
    #[must_use]
    pub const fn from_ulid(ulid: Ulid) -> Self {
        Self(ulid)
    }

    /// Returns the underlying ULID.
    #[must_use]
    pub const fn as_ulid(&self) -> Ulid {
        self.0
    }

    /// Returns the creation timestamp encoded in the id.
    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        created_at(self.0)
    }
}

impl fmt::Display for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RuleId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        parse(s, "rule id").map(Self)
    }
}

fn parse(s: &str, what: &'static str) -> Result<Ulid> {
    Ulid::from_string(s).map_err(|e| Error::invalid(format!("bad {what} '{s}': {e}")))
}

#[allow(clippy::cast_possible_wrap)]
fn created_at(ulid: Ulid) -> DateTime<Utc> {
    let ms = ulid.timestamp_ms();
    DateTime::from_timestamp_millis(ms as i64).unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_through_string() {
        let id = CommitId::generate();
        let parsed: CommitId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn ids_are_unique() {
        assert_ne!(ObjectId::generate(), ObjectId::generate());
        assert_ne!(PoolId::generate(), PoolId::generate());
    }

    #[test]
    fn invalid_id_is_rejected() {
        let result: Result<PoolId> = "not-a-valid-ulid".parse();
        assert!(matches!(result, Err(Error::Invalid(_))));
    }

    #[test]
    fn ids_are_time_ordered() {
        let a = ObjectId::generate();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = ObjectId::generate();
        assert!(a < b);
        assert!(a.created_at() <= b.created_at());
    }

    #[test]
    fn serde_is_transparent() {
        let id = RuleId::generate();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{id}\""));
        let back: RuleId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, back);
    }
}
