//! Secondary-index rules and the root-level rules store.
//!
//! Rules live in the root; applying a rule to a pool's objects is recorded
//! as a commit on that pool (see [`crate::branch::Branch::apply_index_rules`]).
//! Building and querying the index artifacts themselves is the business of
//! an external collaborator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use tarn_core::{Error, Result, RuleId, StorageBackend};

use crate::store::{Store, StoreRecord};

/// What a rule indexes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    /// Index the values of a named field.
    Field,
    /// Index records by their type signature.
    Type,
}

/// One secondary-index rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    /// Permanent rule identifier.
    pub id: RuleId,
    /// Unique rule name.
    pub name: String,
    /// Creation timestamp.
    pub ts: DateTime<Utc>,
    /// What the rule indexes.
    pub kind: RuleKind,
    /// Kind-specific parameters (e.g. the field path for a field rule).
    pub params: serde_json::Value,
}

impl Rule {
    /// Creates a rule.
    #[must_use]
    pub fn new(name: impl Into<String>, kind: RuleKind, params: serde_json::Value) -> Self {
        Self {
            id: RuleId::generate(),
            name: name.into(),
            ts: Utc::now(),
            kind,
            params,
        }
    }
}

impl StoreRecord for Rule {
    const KIND: &'static str = "index rule";

    fn key(&self) -> String {
        self.name.clone()
    }
}

/// The root-level store enumerating index rules, keyed by rule name.
pub struct RuleStore {
    store: Store<Rule>,
}

impl RuleStore {
    /// Opens the rules store at `path`.
    #[must_use]
    pub fn new(backend: Arc<dyn StorageBackend>, path: impl Into<String>) -> Self {
        Self {
            store: Store::new(backend, path),
        }
    }

    /// Adds a rule.
    ///
    /// # Errors
    ///
    /// Returns `Exists` if the name is taken.
    pub async fn add(&self, rule: &Rule) -> Result<()> {
        self.store.add(rule).await
    }

    /// Deletes a rule by id, returning it.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if no live rule carries the id.
    pub async fn delete_by_id(&self, id: RuleId) -> Result<Rule> {
        let rule = self.lookup_by_id(id).await?;
        self.store.delete(&rule.name).await
    }

    /// Looks up a rule by name.
    pub async fn lookup_by_name(&self, name: &str) -> Result<Option<Rule>> {
        self.store.lookup(name).await
    }

    /// Looks up a rule by id.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if no live rule carries the id.
    pub async fn lookup_by_id(&self, id: RuleId) -> Result<Rule> {
        self.store
            .all()
            .await?
            .into_iter()
            .find(|rule| rule.id == id)
            .ok_or_else(|| Error::not_found("index rule", id))
    }

    /// Returns all rules in name order.
    pub async fn all(&self) -> Result<Vec<Rule>> {
        self.store.all().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tarn_core::MemoryBackend;

    fn store() -> RuleStore {
        RuleStore::new(Arc::new(MemoryBackend::new()), "index_rules")
    }

    #[tokio::test]
    async fn add_lookup_delete() {
        let store = store();
        let rule = Rule::new("by-ip", RuleKind::Field, json!({"field": "src.ip"}));
        store.add(&rule).await.unwrap();

        assert_eq!(
            store.lookup_by_name("by-ip").await.unwrap(),
            Some(rule.clone())
        );
        assert_eq!(store.lookup_by_id(rule.id).await.unwrap(), rule);

        let removed = store.delete_by_id(rule.id).await.unwrap();
        assert_eq!(removed.id, rule.id);
        assert!(store.delete_by_id(rule.id).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn duplicate_name_fails_exists() {
        let store = store();
        store
            .add(&Rule::new("by-ip", RuleKind::Field, json!({})))
            .await
            .unwrap();
        let err = store
            .add(&Rule::new("by-ip", RuleKind::Type, json!({})))
            .await
            .unwrap_err();
        assert!(err.is_exists());
    }
}
