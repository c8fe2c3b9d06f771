//! In-memory materialization of the live object set at a commit.
//!
//! A snapshot is derived by replaying the commit chain from the root
//! sentinel to a tip. It never mutates after construction and is shared by
//! reference; later commits clone their parent's snapshot and apply their
//! own actions, so concurrent readers of the parent are undisturbed.

use std::collections::{HashMap, HashSet};

use tarn_core::{Error, ObjectId, Result, SortKey};

use crate::commit::{Action, Commit};
use crate::data::DataObject;

/// The set of live objects (and vector companions) at a commit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    objects: HashMap<ObjectId, DataObject>,
    vectors: HashSet<ObjectId>,
}

impl Snapshot {
    /// The empty snapshot at the root sentinel.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Applies one commit's actions, in the order given.
    ///
    /// # Errors
    ///
    /// Returns `Conflict` when an add collides with a live id, `NotFound`
    /// when a delete names a dead one. A failed apply leaves the snapshot
    /// in an unspecified state; callers apply onto a scratch clone.
    pub fn apply(&mut self, commit: &Commit) -> Result<()> {
        for action in &commit.actions {
            self.apply_action(action)?;
        }
        Ok(())
    }

    fn apply_action(&mut self, action: &Action) -> Result<()> {
        match action {
            Action::AddObject { object } => {
                if self.objects.contains_key(&object.id) {
                    return Err(Error::conflict(format!(
                        "object {} is already live",
                        object.id
                    )));
                }
                self.objects.insert(object.id, object.clone());
            }
            Action::DeleteObject { id, .. } => {
                if self.objects.remove(id).is_none() {
                    return Err(Error::not_found("object", *id));
                }
                // The companion goes with the object.
                self.vectors.remove(id);
            }
            Action::AddVector { id } => {
                if !self.objects.contains_key(id) {
                    return Err(Error::not_found("object", *id));
                }
                if !self.vectors.insert(*id) {
                    return Err(Error::conflict(format!("object {id} already has a vector")));
                }
            }
            Action::DeleteVector { id } => {
                if !self.vectors.remove(id) {
                    return Err(Error::not_found("vector", *id));
                }
            }
            // Commit metadata rides on the commit itself and does not
            // affect object liveness.
            Action::AddCommitMeta { .. } => {}
        }
        Ok(())
    }

    /// Looks up a live object.
    #[must_use]
    pub fn lookup(&self, id: ObjectId) -> Option<&DataObject> {
        self.objects.get(&id)
    }

    /// Returns whether `id` is live.
    #[must_use]
    pub fn has(&self, id: ObjectId) -> bool {
        self.objects.contains_key(&id)
    }

    /// Returns whether `id` currently owns a vector companion.
    #[must_use]
    pub fn has_vector(&self, id: ObjectId) -> bool {
        self.vectors.contains(&id)
    }

    /// Iterates over the live objects in unspecified order.
    pub fn objects(&self) -> impl Iterator<Item = &DataObject> {
        self.objects.values()
    }

    /// Iterates over the live object ids in unspecified order.
    pub fn object_ids(&self) -> impl Iterator<Item = ObjectId> + '_ {
        self.objects.keys().copied()
    }

    /// Iterates over the ids owning a vector companion.
    pub fn vector_ids(&self) -> impl Iterator<Item = ObjectId> + '_ {
        self.vectors.iter().copied()
    }

    /// Returns the live objects ordered by their first key in stored
    /// order, the order a full scan visits them.
    #[must_use]
    pub fn sorted_objects(&self, sort_key: &SortKey) -> Vec<&DataObject> {
        let mut objects: Vec<&DataObject> = self.objects.values().collect();
        objects.sort_by(|a, b| {
            sort_key
                .compare_values(&a.min, &b.min)
                .then_with(|| a.id.cmp(&b.id))
        });
        objects
    }

    /// Number of live objects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Returns true when no object is live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Total record count across live objects.
    #[must_use]
    pub fn record_count(&self) -> u64 {
        self.objects.values().map(|o| o.count).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use proptest::prelude::*;
    use tarn_core::{CommitId, KeyValue};

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

    fn commit(actions: Vec<Action>) -> Commit {
        Commit {
            id: CommitId::generate(),
            parent: None,
            author: "test".into(),
            date: Utc::now(),
            message: String::new(),
            actions,
        }
    }

    #[test]
    fn add_then_delete_roundtrips_to_empty() {
        let o = object(1);
        let mut snap = Snapshot::empty();
        snap.apply(&commit(vec![Action::AddObject { object: o.clone() }]))
            .unwrap();
        assert!(snap.has(o.id));

        snap.apply(&commit(vec![Action::DeleteObject {
            id: o.id,
            cause: CommitId::generate(),
        }]))
        .unwrap();
        assert!(snap.is_empty());
    }

    #[test]
    fn double_add_conflicts() {
        let o = object(1);
        let mut snap = Snapshot::empty();
        snap.apply(&commit(vec![Action::AddObject { object: o.clone() }]))
            .unwrap();
        let err = snap
            .apply(&commit(vec![Action::AddObject { object: o }]))
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[test]
    fn delete_of_dead_object_is_not_found() {
        let mut snap = Snapshot::empty();
        let err = snap
            .apply(&commit(vec![Action::DeleteObject {
                id: ObjectId::generate(),
                cause: CommitId::generate(),
            }]))
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn vectors_follow_their_object() {
        let o = object(1);
        let mut snap = Snapshot::empty();
        snap.apply(&commit(vec![
            Action::AddObject { object: o.clone() },
            Action::AddVector { id: o.id },
        ]))
        .unwrap();
        assert!(snap.has_vector(o.id));

        // Deleting the object drops its companion.
        snap.apply(&commit(vec![Action::DeleteObject {
            id: o.id,
            cause: CommitId::generate(),
        }]))
        .unwrap();
        assert!(!snap.has_vector(o.id));
    }

    #[test]
    fn vector_on_dead_object_is_not_found() {
        let mut snap = Snapshot::empty();
        let err = snap
            .apply(&commit(vec![Action::AddVector {
                id: ObjectId::generate(),
            }]))
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn sorted_objects_follow_stored_order() {
        let sort_key = tarn_core::SortKey::parse("ts:desc").unwrap();
        let mut snap = Snapshot::empty();
        let (a, b, c) = (object(1), object(9), object(5));
        snap.apply(&commit(vec![
            Action::AddObject { object: a.clone() },
            Action::AddObject { object: b.clone() },
            Action::AddObject { object: c.clone() },
        ]))
        .unwrap();

        let ordered: Vec<ObjectId> = snap
            .sorted_objects(&sort_key)
            .into_iter()
            .map(|o| o.id)
            .collect();
        assert_eq!(ordered, vec![b.id, c.id, a.id]);
    }

    proptest! {
        /// Replaying the same action sequence is deterministic.
        #[test]
        fn replay_is_deterministic(adds in prop::collection::vec(1..100i64, 1..16)) {
            let objects: Vec<DataObject> = adds.iter().map(|n| object(*n)).collect();
            let mut actions = Vec::new();
            for o in &objects {
                actions.push(Action::AddObject { object: o.clone() });
            }
            // Delete every other object afterwards.
            for o in objects.iter().step_by(2) {
                actions.push(Action::DeleteObject { id: o.id, cause: CommitId::generate() });
            }

            let c = commit(actions);
            let mut first = Snapshot::empty();
            first.apply(&c).unwrap();
            let mut second = Snapshot::empty();
            second.apply(&c).unwrap();
            prop_assert_eq!(first, second);
        }
    }
}
