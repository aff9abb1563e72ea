//! Pipeline counters. Cheap atomics bumped from the workers; `snapshot()`
//! feeds the gateway's periodic stats log line.

use std::sync::atomic::{AtomicU64, Ordering};

static RECORDS_INGESTED: AtomicU64 = AtomicU64::new(0);
static FRAMES_REJECTED: AtomicU64 = AtomicU64::new(0);
static RECORDS_DROPPED_QUEUE_FULL: AtomicU64 = AtomicU64::new(0);
static STORE_APPEND_ERRORS: AtomicU64 = AtomicU64::new(0);
static RECORDS_PUBLISHED: AtomicU64 = AtomicU64::new(0);
static PUBLISH_RETRIES: AtomicU64 = AtomicU64::new(0);
static RECORDS_DROPPED_PUBLISH: AtomicU64 = AtomicU64::new(0);
static RECORDS_REPLAYED: AtomicU64 = AtomicU64::new(0);
static LOSS_QUERIES: AtomicU64 = AtomicU64::new(0);
static LOSS_ENTRIES_ENQUEUED: AtomicU64 = AtomicU64::new(0);
static KEEPALIVES_SENT: AtomicU64 = AtomicU64::new(0);

pub fn inc_records_ingested() {
    RECORDS_INGESTED.fetch_add(1, Ordering::Relaxed);
}
pub fn add_frames_rejected(n: u64) {
    FRAMES_REJECTED.fetch_add(n, Ordering::Relaxed);
}
pub fn inc_records_dropped_queue_full() {
    RECORDS_DROPPED_QUEUE_FULL.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_store_append_errors() {
    STORE_APPEND_ERRORS.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_records_published() {
    RECORDS_PUBLISHED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_publish_retries() {
    PUBLISH_RETRIES.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_records_dropped_publish() {
    RECORDS_DROPPED_PUBLISH.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_records_replayed() {
    RECORDS_REPLAYED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_loss_queries() {
    LOSS_QUERIES.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_loss_entries_enqueued() {
    LOSS_ENTRIES_ENQUEUED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_keepalives_sent() {
    KEEPALIVES_SENT.fetch_add(1, Ordering::Relaxed);
}

/// Point-in-time copy of every counter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub records_ingested: u64,
    pub frames_rejected: u64,
    pub records_dropped_queue_full: u64,
    pub store_append_errors: u64,
    pub records_published: u64,
    pub publish_retries: u64,
    pub records_dropped_publish: u64,
    pub records_replayed: u64,
    pub loss_queries: u64,
    pub loss_entries_enqueued: u64,
    pub keepalives_sent: u64,
}

pub fn snapshot() -> Snapshot {
    Snapshot {
        records_ingested: RECORDS_INGESTED.load(Ordering::Relaxed),
        frames_rejected: FRAMES_REJECTED.load(Ordering::Relaxed),
        records_dropped_queue_full: RECORDS_DROPPED_QUEUE_FULL.load(Ordering::Relaxed),
        store_append_errors: STORE_APPEND_ERRORS.load(Ordering::Relaxed),
        records_published: RECORDS_PUBLISHED.load(Ordering::Relaxed),
        publish_retries: PUBLISH_RETRIES.load(Ordering::Relaxed),
        records_dropped_publish: RECORDS_DROPPED_PUBLISH.load(Ordering::Relaxed),
        records_replayed: RECORDS_REPLAYED.load(Ordering::Relaxed),
        loss_queries: LOSS_QUERIES.load(Ordering::Relaxed),
        loss_entries_enqueued: LOSS_ENTRIES_ENQUEUED.load(Ordering::Relaxed),
        keepalives_sent: KEEPALIVES_SENT.load(Ordering::Relaxed),
    }
}
