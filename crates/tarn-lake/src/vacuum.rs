//! Removal of object bytes unreachable from any branch tip.
//!
//! Reachability is the union, over all branches, of the tip snapshot's
//! live objects and vector holders. Candidates are the object ids actually
//! present under the pool's data prefix, optionally bounded by a commit id
//! whose embedded timestamp serves as a creation-time cutoff — objects
//! persisted by in-flight loads are newer than any published commit and so
//! survive until their own commit either publishes or ages past a later
//! vacuum's bound.

use std::collections::{BTreeSet, HashSet};

use tarn_core::{CommitId, ObjectId, Result};

use crate::data;
use crate::pool::Pool;

/// Lists the object ids unreachable from every branch tip of `pool` whose
/// id-embedded creation time is at or before `before`'s (no bound when
/// `None`), and removes their bytes unless `dry_run`.
///
/// [`Pool::vacuum`] is the usual entry point.
///
/// # Errors
///
/// Returns `NotFound` for an unknown `before` commit; propagates storage
/// failures.
pub async fn vacuum(
    pool: &Pool,
    before: Option<CommitId>,
    dry_run: bool,
) -> Result<Vec<ObjectId>> {
    let cutoff = match before {
        Some(commit) => Some(pool.commit_store().get(commit).await?.id.created_at()),
        None => None,
    };

    let mut live_objects: HashSet<ObjectId> = HashSet::new();
    let mut live_vectors: HashSet<ObjectId> = HashSet::new();
    for branch in pool.branch_store().all().await? {
        let snapshot = pool.commit_store().snapshot(branch.commit).await?;
        live_objects.extend(snapshot.object_ids());
        live_vectors.extend(snapshot.vector_ids());
    }

    let data_prefix = format!("{}/data/", pool.id());
    let mut stored: BTreeSet<ObjectId> = BTreeSet::new();
    for meta in pool.storage().list(&data_prefix).await? {
        if let Some(id) = object_id_of(&meta.path) {
            stored.insert(id);
        }
    }

    let unreachable: Vec<ObjectId> = stored
        .into_iter()
        .filter(|id| !live_objects.contains(id))
        .filter(|id| cutoff.is_none_or(|t| id.created_at() <= t))
        .collect();

    if dry_run {
        tracing::debug!(
            pool = %pool.id(),
            candidates = unreachable.len(),
            "vacuum dry run"
        );
        return Ok(unreachable);
    }

    for id in &unreachable {
        data::delete_bytes(pool.storage(), pool.id(), *id).await?;
    }

    // Vector companions whose object survived but whose membership was
    // deleted are orphaned bytes too.
    let vector_prefix = format!("{}/vectors/", pool.id());
    for meta in pool.storage().list(&vector_prefix).await? {
        let Some(id) = vector_id_of(&meta.path) else {
            continue;
        };
        if !live_vectors.contains(&id) && cutoff.is_none_or(|t| id.created_at() <= t) {
            pool.storage().delete(&meta.path).await?;
        }
    }

    tracing::info!(
        pool = %pool.id(),
        removed = unreachable.len(),
        "vacuum removed unreachable objects"
    );
    Ok(unreachable)
}

/// Parses `<pool>/data/<object_id>.jsonl`; sidecars and foreign files
/// return `None`.
fn object_id_of(path: &str) -> Option<ObjectId> {
    let name = path.rsplit('/').next()?;
    let stem = name.strip_suffix(&format!(".{}", data::FORMAT))?;
    stem.parse().ok()
}

/// Parses `<pool>/vectors/<object_id>.jsonl`.
fn vector_id_of(path: &str) -> Option<ObjectId> {
    object_id_of(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_file_names_parse() {
        let id = ObjectId::generate();
        assert_eq!(object_id_of(&format!("p/data/{id}.jsonl")), Some(id));
        assert_eq!(object_id_of(&format!("p/data/{id}-seek.json")), None);
        assert_eq!(object_id_of("p/data/garbage.txt"), None);
    }
}
