//! Circular log store behavior end to end: boot, append/read windows,
//! wraparound and reopen.

mod common;

use common::record;
use pumpgate::store::{RingStore, StoreError};
use tempfile::TempDir;

#[tokio::test]
async fn boot_append_read_scenario() {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("txnlog.bin");

    // Boot with an empty store.
    let (store, boot_id) = RingStore::open(&path, 5000).await.expect("open");
    assert_eq!(boot_id, 0);

    // Append 3 records.
    for seq in 1..=3u32 {
        store.append(&record(seq)).await.expect("append");
    }
    assert_eq!(store.current_id().await.expect("current id"), 3);

    // read(1) returns the second appended record.
    let second = store.read(1).await.expect("read id 1");
    assert_eq!(second, record(2));

    // read(5) is unwritten.
    assert!(matches!(
        store.read(5).await,
        Err(StoreError::OutOfRange { id: 5, .. })
    ));
}

#[tokio::test]
async fn reads_fail_once_capacity_laps_the_id() {
    let dir = TempDir::new().expect("tempdir");
    let capacity = 16u64;
    let (store, _) = RingStore::open(dir.path().join("txnlog.bin"), capacity)
        .await
        .expect("open");

    let first = store.append(&record(1)).await.expect("append");
    assert_eq!(store.read(first).await.expect("fresh read"), record(1));

    // CAPACITY further appends push the first id out of the window.
    for seq in 0..capacity as u32 {
        store.append(&record(seq + 2)).await.expect("append");
    }
    assert!(matches!(
        store.read(first).await,
        Err(StoreError::OutOfRange { .. })
    ));
}

#[tokio::test]
async fn round_trip_in_id_order_below_capacity() {
    let dir = TempDir::new().expect("tempdir");
    let (store, _) = RingStore::open(dir.path().join("txnlog.bin"), 64)
        .await
        .expect("open");
    let n = 20u32;
    for seq in 1..=n {
        let id = store.append(&record(seq)).await.expect("append");
        assert_eq!(id, (seq - 1) as u64);
    }
    for seq in 1..=n {
        let got = store.read((seq - 1) as u64).await.expect("read back");
        assert_eq!(got, record(seq));
    }
}

#[tokio::test]
async fn reopen_resumes_id_from_file_size() {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("txnlog.bin");
    {
        let (store, _) = RingStore::open(&path, 64).await.expect("open");
        for seq in 1..=5u32 {
            store.append(&record(seq)).await.expect("append");
        }
    }
    let (store, boot_id) = RingStore::open(&path, 64).await.expect("reopen");
    assert_eq!(boot_id, 5);
    assert_eq!(store.read(4).await.expect("read"), record(5));
    let id = store.append(&record(6)).await.expect("append after reopen");
    assert_eq!(id, 5);
}

#[tokio::test]
async fn clear_resets_then_store_reusable() {
    let dir = TempDir::new().expect("tempdir");
    let (store, _) = RingStore::open(dir.path().join("txnlog.bin"), 64)
        .await
        .expect("open");
    store.append(&record(1)).await.expect("append");
    store.clear().await.expect("clear");
    assert_eq!(store.current_id().await.expect("current id"), 0);
    let id = store.append(&record(2)).await.expect("append after clear");
    assert_eq!(id, 0);
    assert_eq!(store.read(0).await.expect("read"), record(2));
}
