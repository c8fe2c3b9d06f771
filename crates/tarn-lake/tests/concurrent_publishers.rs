//! Concurrency safety of the publication protocol: racing publishers on
//! one branch tip, racing pool creators, and the journal's total order,
//! all over a shared in-memory backend.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use serde_json::json;
use tarn_core::{MemoryBackend, StorageBackend};
use tarn_lake::data::VecReader;
use tarn_lake::Root;

#[tokio::test]
async fn racing_loads_serialize_onto_one_chain() {
    let backend: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
    let root = Arc::new(Root::create(backend).await.unwrap());
    let pool = root.create_pool("p", None, 0, 0).await.unwrap();

    // Both publishers observe the same (root) tip and race the advance.
    let handles: Vec<_> = (0..2)
        .map(|n| {
            let pool = pool.clone();
            tokio::spawn(async move {
                let branch = pool.open_branch("main").await.unwrap();
                let mut reader = VecReader::from_values(vec![json!({"ts": n, "w": n})]);
                branch
                    .load(&mut reader, "racer", &format!("load {n}"))
                    .await
                    .unwrap()
            })
        })
        .collect();

    let mut commits = Vec::new();
    for handle in handles {
        commits.push(handle.await.unwrap());
    }

    let branch = pool.open_branch("main").await.unwrap();
    // Both loads landed: two live objects, on one parent-linked chain.
    let snapshot = branch.snapshot().await.unwrap();
    assert_eq!(snapshot.len(), 2);

    let log = branch.log().await.unwrap();
    assert_eq!(log.len(), 2);
    // Tip-first: the second commit's parent is the first commit.
    assert_eq!(log[0].parent, Some(log[1].id));
    assert_eq!(log[1].parent, None);
    // The published chain is exactly the two racers' commits.
    let mut chain: Vec<_> = log.iter().map(|c| c.id).collect();
    chain.sort();
    commits.sort();
    assert_eq!(chain, commits);

    // A loser's abandoned entry (if the race materialized) is unreachable
    // and therefore not in the log; every historical tip is an ancestor of
    // the current tip.
    assert_eq!(branch.tip().await.unwrap(), Some(log[0].id));
}

#[tokio::test]
async fn many_publishers_all_land() {
    let backend: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
    let root = Arc::new(Root::create(backend).await.unwrap());
    let pool = root.create_pool("p", None, 0, 0).await.unwrap();

    let landed = Arc::new(AtomicU32::new(0));
    let publishers = 8_u32;
    let handles: Vec<_> = (0..publishers)
        .map(|n| {
            let pool = pool.clone();
            let landed = landed.clone();
            tokio::spawn(async move {
                let branch = pool.open_branch("main").await.unwrap();
                let mut reader = VecReader::from_values(vec![json!({"ts": n})]);
                branch.load(&mut reader, "racer", "load").await.unwrap();
                landed.fetch_add(1, Ordering::SeqCst);
            })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(landed.load(Ordering::SeqCst), publishers);
    let branch = pool.open_branch("main").await.unwrap();
    assert_eq!(branch.snapshot().await.unwrap().len(), publishers as usize);
    assert_eq!(branch.log().await.unwrap().len(), publishers as usize);
}

#[tokio::test]
async fn racing_pool_creators_resolve_to_one_winner() {
    let backend: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
    let root = Arc::new(Root::create(backend).await.unwrap());

    let wins = Arc::new(AtomicU32::new(0));
    let losses = Arc::new(AtomicU32::new(0));
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let root = root.clone();
            let wins = wins.clone();
            let losses = losses.clone();
            tokio::spawn(async move {
                match root.create_pool("logs", None, 0, 0).await {
                    Ok(_) => wins.fetch_add(1, Ordering::SeqCst),
                    Err(err) if err.is_exists() => losses.fetch_add(1, Ordering::SeqCst),
                    Err(err) => panic!("unexpected error: {err}"),
                };
            })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(wins.load(Ordering::SeqCst), 1, "exactly one creator wins");
    assert_eq!(wins.load(Ordering::SeqCst) + losses.load(Ordering::SeqCst), 4);
    assert_eq!(root.list_pools().await.unwrap().len(), 1);
}

#[tokio::test]
async fn racing_lake_creators_resolve_to_one_lake() {
    let backend: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());

    let wins = Arc::new(AtomicU32::new(0));
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let backend = backend.clone();
            let wins = wins.clone();
            tokio::spawn(async move {
                match Root::create(backend).await {
                    Ok(_) => {
                        wins.fetch_add(1, Ordering::SeqCst);
                    }
                    Err(err) => assert!(err.is_exists(), "unexpected error: {err}"),
                }
            })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(wins.load(Ordering::SeqCst), 1, "exactly one creator wins");
    Root::open(backend).await.unwrap();
}
