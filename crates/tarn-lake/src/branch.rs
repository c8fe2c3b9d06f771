//! Branch transactions: the draft → validate → persist → append → advance
//! publication protocol.
//!
//! A branch operation observes the tip `P`, drafts a commit whose parent is
//! `P`, validates its actions against `snapshot(P)`, persists any new
//! object payloads (idempotently, on id-derived paths), appends the commit
//! entry to the pool's commit journal, and finally advances the branch tip
//! from `P` to the new commit. Only the tip advance can conflict; a loser
//! re-drafts against the new tip under exponential backoff. Orphaned commit
//! entries and object payloads left behind by lost races are vacuum
//! garbage.

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use tarn_core::{CommitId, Error, ObjectId, Result, StorageBackend};

use crate::branches::BranchStore;
use crate::commit::{Action, Commit, CommitStore};
use crate::data::{self, Predicate, RecordReader};
use crate::index::Rule;
use crate::pools;
use crate::snapshot::Snapshot;

const INITIAL_BACKOFF: Duration = Duration::from_millis(10);
const MAX_BACKOFF: Duration = Duration::from_secs(1);

/// Exponential backoff between publish retries.
struct Backoff {
    delay: Duration,
}

impl Backoff {
    fn new() -> Self {
        Self {
            delay: INITIAL_BACKOFF,
        }
    }

    async fn wait(&mut self) {
        tokio::time::sleep(self.delay).await;
        self.delay = (self.delay * 2).min(MAX_BACKOFF);
    }
}

/// A named cursor onto a pool's commit log, and the only interface that
/// mutates it.
#[derive(Clone)]
pub struct Branch {
    config: pools::Config,
    name: String,
    backend: Arc<dyn StorageBackend>,
    commits: Arc<CommitStore>,
    branches: Arc<BranchStore>,
}

impl std::fmt::Debug for Branch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Branch")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl Branch {
    pub(crate) fn new(
        config: pools::Config,
        name: impl Into<String>,
        backend: Arc<dyn StorageBackend>,
        commits: Arc<CommitStore>,
        branches: Arc<BranchStore>,
    ) -> Self {
        Self {
            config,
            name: name.into(),
            backend,
            commits,
            branches,
        }
    }

    /// Returns the branch name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the owning pool's config.
    #[must_use]
    pub fn pool(&self) -> &pools::Config {
        &self.config
    }

    /// Returns the current branch tip (`None` at the root sentinel).
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the branch was deleted.
    pub async fn tip(&self) -> Result<Option<CommitId>> {
        Ok(self.branches.lookup(&self.name).await?.commit)
    }

    /// Materializes the snapshot at the current tip.
    pub async fn snapshot(&self) -> Result<Arc<Snapshot>> {
        self.commits.snapshot(self.tip().await?).await
    }

    /// Reads every record reachable from the tip, in scan order: objects
    /// ordered by their first key, records in stored order within each.
    ///
    /// # Errors
    ///
    /// Propagates storage failures and `Corrupt` record files.
    pub async fn scan(&self) -> Result<Vec<tarn_core::Record>> {
        let snapshot = self.snapshot().await?;
        let mut records = Vec::new();
        for object in snapshot.sorted_objects(&self.config.sort_key) {
            records.extend(data::read_all(&self.backend, self.config.id, object.id).await?);
        }
        Ok(records)
    }

    /// Returns the commit history from the tip back to the root sentinel.
    pub async fn log(&self) -> Result<Vec<Arc<Commit>>> {
        match self.tip().await? {
            Some(tip) => self.commits.ancestors(tip).await,
            None => Ok(Vec::new()),
        }
    }

    /// Validates `commit` against the snapshot at `tip`, appends it, and
    /// advances the tip.
    ///
    /// Returns `Ok(None)` when the tip moved under the publisher — the one
    /// recoverable outcome, distinct from a validation `Conflict`, which
    /// surfaces. The appended entry of a lost race is unreachable and left
    /// for vacuum.
    async fn try_commit(&self, tip: Option<CommitId>, commit: Commit) -> Result<Option<CommitId>> {
        let snapshot = self.commits.snapshot(tip).await?;
        let mut probe = (*snapshot).clone();
        probe.apply(&commit)?;
        drop(probe);

        self.commits.put(&commit).await?;
        match self.branches.update_tip(&self.name, tip, commit.id).await {
            Ok(_) => {
                tracing::info!(
                    pool = %self.config.id,
                    branch = %self.name,
                    commit = %commit.id,
                    actions = commit.actions.len(),
                    "published commit"
                );
                Ok(Some(commit.id))
            }
            Err(err) if err.is_conflict() => {
                tracing::debug!(
                    pool = %self.config.id,
                    branch = %self.name,
                    commit = %commit.id,
                    "tip moved under publisher; rebasing"
                );
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    /// Consumes a record stream and commits it as new data objects.
    ///
    /// Records are partitioned into sort-ordered runs of at most
    /// `threshold` bytes; one commit makes all resulting objects visible.
    /// On any failure before the tip advance, the branch is unchanged and
    /// the persisted objects are vacuum candidates.
    ///
    /// # Errors
    ///
    /// Returns `Empty` for an empty stream, with no side effects.
    pub async fn load(
        &self,
        reader: &mut dyn RecordReader,
        author: &str,
        message: &str,
    ) -> Result<CommitId> {
        let mut records = Vec::new();
        while let Some(record) = reader.read()? {
            records.push(record);
        }
        if records.is_empty() {
            return Err(Error::empty("cannot load an empty stream"));
        }

        let objects = data::write_sorted(&self.backend, &self.config, records).await?;
        let mut backoff = Backoff::new();
        loop {
            let tip = self.tip().await?;
            let actions = objects
                .iter()
                .map(|object| Action::AddObject {
                    object: object.clone(),
                })
                .collect();
            match self.try_commit(tip, Commit::new(tip, author, message, actions)).await? {
                Some(id) => return Ok(id),
                None => backoff.wait().await,
            }
        }
    }

    /// Deletes the given objects from the live set.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if any id is not live at the tip, `Empty` for an
    /// empty id list.
    pub async fn delete(
        &self,
        ids: &[ObjectId],
        author: &str,
        message: &str,
    ) -> Result<CommitId> {
        if ids.is_empty() {
            return Err(Error::empty("no objects to delete"));
        }
        let mut backoff = Backoff::new();
        loop {
            let tip = self.tip().await?;
            let snapshot = self.commits.snapshot(tip).await?;
            let commit_id = CommitId::generate();
            let mut actions = Vec::with_capacity(ids.len());
            for id in ids {
                if !snapshot.has(*id) {
                    return Err(Error::not_found("object", *id));
                }
                actions.push(Action::DeleteObject {
                    id: *id,
                    cause: commit_id,
                });
            }
            match self
                .try_commit(tip, draft(commit_id, tip, author, message, actions))
                .await?
            {
                Some(id) => return Ok(id),
                None => backoff.wait().await,
            }
        }
    }

    /// Deletes every record matching `predicate`.
    ///
    /// Objects whose key range cannot match are pruned; fully-matching
    /// objects are deleted outright; partially-matching objects are deleted
    /// and replaced by new objects holding the surviving records.
    ///
    /// # Errors
    ///
    /// Returns `Empty` if no record matched.
    pub async fn delete_where(
        &self,
        predicate: &dyn Predicate,
        author: &str,
        message: &str,
    ) -> Result<CommitId> {
        let mut backoff = Backoff::new();
        loop {
            let tip = self.tip().await?;
            let snapshot = self.commits.snapshot(tip).await?;
            let commit_id = CommitId::generate();
            let mut actions = Vec::new();

            for object in snapshot.sorted_objects(&self.config.sort_key) {
                if !predicate.overlaps(&object.min, &object.max) {
                    continue;
                }
                let records = data::read_all(&self.backend, self.config.id, object.id).await?;
                let surviving: Vec<_> = records
                    .iter()
                    .filter(|record| !predicate.matches(record))
                    .cloned()
                    .collect();
                if surviving.len() == records.len() {
                    continue;
                }
                actions.push(Action::DeleteObject {
                    id: object.id,
                    cause: commit_id,
                });
                for replacement in
                    data::write_sorted(&self.backend, &self.config, surviving).await?
                {
                    actions.push(Action::AddObject {
                        object: replacement,
                    });
                }
            }
            if actions.is_empty() {
                return Err(Error::empty("predicate matched no records"));
            }

            match self
                .try_commit(tip, draft(commit_id, tip, author, message, actions))
                .await?
            {
                Some(id) => return Ok(id),
                None => backoff.wait().await,
            }
        }
    }

    /// Rewrites the given live objects into fresh sort-ordered runs.
    ///
    /// The commit adds the replacement objects and deletes the inputs;
    /// `with_vectors` re-attaches vector companions on the outputs.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if any input is not live, `Empty` for an empty
    /// input list.
    pub async fn compact(
        &self,
        ids: &[ObjectId],
        with_vectors: bool,
        author: &str,
        message: &str,
    ) -> Result<CommitId> {
        if ids.is_empty() {
            return Err(Error::empty("no objects to compact"));
        }
        let mut backoff = Backoff::new();
        loop {
            let tip = self.tip().await?;
            let snapshot = self.commits.snapshot(tip).await?;
            let commit_id = CommitId::generate();

            let mut records = Vec::new();
            for id in ids {
                if !snapshot.has(*id) {
                    return Err(Error::not_found("object", *id));
                }
                records.extend(data::read_all(&self.backend, self.config.id, *id).await?);
            }
            let outputs = data::write_sorted(&self.backend, &self.config, records).await?;

            let mut actions = Vec::new();
            for object in &outputs {
                actions.push(Action::AddObject {
                    object: object.clone(),
                });
            }
            if with_vectors {
                for object in &outputs {
                    actions.push(Action::AddVector { id: object.id });
                }
            }
            for id in ids {
                actions.push(Action::DeleteObject {
                    id: *id,
                    cause: commit_id,
                });
            }

            match self
                .try_commit(tip, draft(commit_id, tip, author, message, actions))
                .await?
            {
                Some(id) => return Ok(id),
                None => backoff.wait().await,
            }
        }
    }

    /// Attaches vector companions to the given live objects.
    ///
    /// The companion bytes are produced by an external collaborator at the
    /// id-derived vector path; this records their existence in the commit
    /// log.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for a dead object, `Conflict` for an object that
    /// already owns a vector, `Empty` for an empty list.
    pub async fn add_vectors(
        &self,
        ids: &[ObjectId],
        author: &str,
        message: &str,
    ) -> Result<CommitId> {
        self.vector_commit(ids, true, author, message).await
    }

    /// Detaches vector companions from the given objects.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an object without a vector, `Empty` for an
    /// empty list.
    pub async fn delete_vectors(
        &self,
        ids: &[ObjectId],
        author: &str,
        message: &str,
    ) -> Result<CommitId> {
        self.vector_commit(ids, false, author, message).await
    }

    async fn vector_commit(
        &self,
        ids: &[ObjectId],
        add: bool,
        author: &str,
        message: &str,
    ) -> Result<CommitId> {
        if ids.is_empty() {
            return Err(Error::empty("no objects given"));
        }
        let mut backoff = Backoff::new();
        loop {
            let tip = self.tip().await?;
            let actions = ids
                .iter()
                .map(|id| {
                    if add {
                        Action::AddVector { id: *id }
                    } else {
                        Action::DeleteVector { id: *id }
                    }
                })
                .collect();
            match self.try_commit(tip, Commit::new(tip, author, message, actions)).await? {
                Some(id) => return Ok(id),
                None => backoff.wait().await,
            }
        }
    }

    /// Merges this branch into `parent` as one commit on the parent.
    ///
    /// The commit carries the object-granularity delta between the two
    /// tips: objects live here but not in the parent become adds, objects
    /// live in the parent but not here become deletes, and vector
    /// membership is reconciled the same way. This branch's tip is
    /// untouched.
    ///
    /// # Errors
    ///
    /// Returns `Invalid` when the parent's sort key differs or the
    /// branches share no common ancestor (i.e. belong to different pools),
    /// `Empty` when the tips already agree.
    pub async fn merge_into(
        &self,
        parent: &Branch,
        author: &str,
        message: &str,
    ) -> Result<CommitId> {
        if self.config.sort_key != parent.config.sort_key {
            return Err(Error::invalid(format!(
                "cannot merge {} into {}: sort key {} differs from {}",
                self.name, parent.name, self.config.sort_key, parent.config.sort_key
            )));
        }
        if self.config.id != parent.config.id {
            return Err(Error::invalid(format!(
                "cannot merge {} into {}: branches share no common ancestor",
                self.name, parent.name
            )));
        }

        let child_snap = self.snapshot().await?;
        let mut backoff = Backoff::new();
        loop {
            let parent_tip = parent.tip().await?;
            let parent_snap = parent.commits.snapshot(parent_tip).await?;
            let commit_id = CommitId::generate();
            let mut actions = Vec::new();

            for object in child_snap.sorted_objects(&self.config.sort_key) {
                if !parent_snap.has(object.id) {
                    actions.push(Action::AddObject {
                        object: object.clone(),
                    });
                }
            }
            let mut deletes: Vec<ObjectId> = parent_snap
                .object_ids()
                .filter(|id| !child_snap.has(*id))
                .collect();
            deletes.sort_unstable();
            for id in deletes {
                actions.push(Action::DeleteObject {
                    id,
                    cause: commit_id,
                });
            }
            let mut vector_adds: Vec<ObjectId> = child_snap
                .vector_ids()
                .filter(|id| !parent_snap.has_vector(*id))
                .collect();
            vector_adds.sort_unstable();
            for id in vector_adds {
                actions.push(Action::AddVector { id });
            }
            let mut vector_deletes: Vec<ObjectId> = parent_snap
                .vector_ids()
                .filter(|id| child_snap.has(*id) && !child_snap.has_vector(*id))
                .collect();
            vector_deletes.sort_unstable();
            for id in vector_deletes {
                actions.push(Action::DeleteVector { id });
            }

            if actions.is_empty() {
                return Err(Error::empty(format!(
                    "merge of {} into {}: branches already agree",
                    self.name, parent.name
                )));
            }

            match parent
                .try_commit(
                    parent_tip,
                    draft(commit_id, parent_tip, author, message, actions),
                )
                .await?
            {
                Some(id) => return Ok(id),
                None => backoff.wait().await,
            }
        }
    }

    /// Publishes the inverse of commit `commit_id` on the current tip.
    ///
    /// Adds become deletes and vice versa; commit metadata is dropped. An
    /// inverse delete of an object no longer live is dropped silently; an
    /// inverse add of an object still live fails with `Conflict`.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown commit, `Empty` when the inverse
    /// is a no-op.
    pub async fn revert(
        &self,
        commit_id: CommitId,
        author: &str,
        message: &str,
    ) -> Result<CommitId> {
        let target = self.commits.get(commit_id).await?;
        let before_target = self.commits.snapshot(target.parent).await?;

        let mut backoff = Backoff::new();
        loop {
            let tip = self.tip().await?;
            let snapshot = self.commits.snapshot(tip).await?;
            let new_id = CommitId::generate();
            let mut actions = Vec::new();

            for action in target.actions.iter().rev() {
                match action {
                    Action::AddObject { object } => {
                        if snapshot.has(object.id) {
                            actions.push(Action::DeleteObject {
                                id: object.id,
                                cause: new_id,
                            });
                        }
                    }
                    Action::DeleteObject { id, .. } => {
                        let object = before_target.lookup(*id).cloned().ok_or_else(|| {
                            Error::corrupt(format!(
                                "commit {} deleted object {id} unknown to its parent",
                                target.id
                            ))
                        })?;
                        let had_vector = before_target.has_vector(*id);
                        actions.push(Action::AddObject { object });
                        if had_vector {
                            actions.push(Action::AddVector { id: *id });
                        }
                    }
                    Action::AddVector { id } => {
                        if snapshot.has_vector(*id) {
                            actions.push(Action::DeleteVector { id: *id });
                        }
                    }
                    Action::DeleteVector { id } => {
                        if snapshot.has(*id) {
                            actions.push(Action::AddVector { id: *id });
                        }
                    }
                    Action::AddCommitMeta { .. } => {}
                }
            }

            if actions.is_empty() {
                return Err(Error::empty(format!("revert of {commit_id} is a no-op")));
            }

            let message = if message.is_empty() {
                format!("revert {commit_id}")
            } else {
                message.to_string()
            };
            match self
                .try_commit(tip, draft(new_id, tip, author, &message, actions))
                .await?
            {
                Some(id) => return Ok(id),
                None => backoff.wait().await,
            }
        }
    }

    /// Records the application of index rules to the given objects as a
    /// commit of metadata actions.
    ///
    /// An empty `ids` list applies the rules to every live object.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if a named object is dead, `Empty` for an empty
    /// rule list or an empty pool.
    pub async fn apply_index_rules(
        &self,
        rules: &[Rule],
        ids: &[ObjectId],
        author: &str,
        message: &str,
    ) -> Result<CommitId> {
        if rules.is_empty() {
            return Err(Error::empty("no index rules given"));
        }
        let mut backoff = Backoff::new();
        loop {
            let tip = self.tip().await?;
            let snapshot = self.commits.snapshot(tip).await?;

            let targets: Vec<ObjectId> = if ids.is_empty() {
                let mut all: Vec<ObjectId> = snapshot.object_ids().collect();
                all.sort_unstable();
                all
            } else {
                for id in ids {
                    if !snapshot.has(*id) {
                        return Err(Error::not_found("object", *id));
                    }
                }
                ids.to_vec()
            };
            if targets.is_empty() {
                return Err(Error::empty("no live objects to index"));
            }

            let mut actions = Vec::with_capacity(rules.len());
            for rule in rules {
                let rule_value = serde_json::to_value(rule)
                    .map_err(|e| Error::io(format!("serialize index rule: {e}")))?;
                actions.push(Action::AddCommitMeta {
                    key: format!("index.rule.{}", rule.id),
                    value: json!({ "rule": rule_value, "objects": &targets }),
                });
            }

            match self.try_commit(tip, Commit::new(tip, author, message, actions)).await? {
                Some(id) => return Ok(id),
                None => backoff.wait().await,
            }
        }
    }
}

/// Builds a commit under a pre-generated id (needed when actions embed the
/// id as their delete cause).
fn draft(
    id: CommitId,
    parent: Option<CommitId>,
    author: &str,
    message: &str,
    actions: Vec<Action>,
) -> Commit {
    Commit {
        id,
        parent,
        author: author.to_string(),
        date: chrono::Utc::now(),
        message: message.to_string(),
        actions,
    }
}
