//! A full lake lifecycle on the local filesystem backend: everything the
//! in-memory tests cover derives its atomicity from conditional put, so
//! this suite proves the filesystem backend supplies it — and that a lake
//! survives being reopened from disk.

use std::sync::Arc;

use serde_json::json;
use tarn_core::{LocalBackend, Record, SortKey, StorageBackend};
use tarn_lake::data::{RecordMatch, VecReader};
use tarn_lake::Root;

fn local_backend(dir: &tempfile::TempDir) -> Arc<dyn StorageBackend> {
    Arc::new(LocalBackend::new(dir.path()).unwrap())
}

#[tokio::test]
async fn lake_round_trips_through_the_filesystem() {
    let dir = tempfile::tempdir().unwrap();

    let pool_id = {
        let root = Root::create(local_backend(&dir)).await.unwrap();
        let pool = root
            .create_pool("logs", Some(SortKey::parse("ts:desc").unwrap()), 0, 0)
            .await
            .unwrap();
        let main = pool.open_branch("main").await.unwrap();

        let mut reader = VecReader::from_values(vec![
            json!({"ts": 2, "v": "b"}),
            json!({"ts": 1, "v": "a"}),
            json!({"ts": 3, "v": "c"}),
        ]);
        main.load(&mut reader, "tester", "first load").await.unwrap();
        pool.id()
    };

    // A fresh process opens the same directory and sees the same state.
    let root = Root::open(local_backend(&dir)).await.unwrap();
    let pool = root.open_pool(pool_id).await.unwrap();
    let main = pool.open_branch("main").await.unwrap();

    let records = main.scan().await.unwrap();
    let ts: Vec<i64> = records
        .iter()
        .map(|r| r.as_value()["ts"].as_i64().unwrap())
        .collect();
    assert_eq!(ts, vec![3, 2, 1]);
}

#[tokio::test]
async fn delete_and_vacuum_reclaim_disk_bytes() {
    let dir = tempfile::tempdir().unwrap();
    let root = Root::create(local_backend(&dir)).await.unwrap();
    let pool = root.create_pool("logs", None, 0, 0).await.unwrap();
    let main = pool.open_branch("main").await.unwrap();

    let mut reader = VecReader::from_values(vec![json!({"ts": 1}), json!({"ts": 2})]);
    main.load(&mut reader, "tester", "load").await.unwrap();

    let predicate = RecordMatch(|_: &Record| true);
    main.delete_where(&predicate, "tester", "drop all").await.unwrap();

    let removed = pool.vacuum(None, false).await.unwrap();
    assert_eq!(removed.len(), 1);

    // The data directory holds no record files any more.
    let data_files = pool
        .storage()
        .list(&format!("{}/data/", pool.id()))
        .await
        .unwrap();
    assert!(data_files.is_empty(), "stale files: {data_files:?}");
}

#[tokio::test]
async fn double_create_on_disk_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    Root::create(local_backend(&dir)).await.unwrap();
    let err = Root::create(local_backend(&dir)).await.unwrap_err();
    assert!(err.is_exists());
}
