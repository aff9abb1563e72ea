//! # Transaction Log Store - Persistence Layer
//!
//! Flash-style persistence for transaction records. The store is a fixed
//! capacity ring over one backing file: record `id` lives at byte offset
//! `(id % capacity) * RECORD_SIZE`, and `current_id` (the next id to write)
//! is recomputed at boot from the file length. Ids are monotonic; only an
//! explicit [`RingStore::clear`] resets them.
//!
//! ## Readable window
//!
//! A stored entry with id `i` is readable only while
//! `i >= current_id - capacity` — anything older has been lapped by the ring
//! and reads back as [`StoreError::OutOfRange`]. The store makes no attempt
//! to protect unread entries from overwrite; bounded capacity, oldest wins.
//!
//! ## Locking
//!
//! All access is serialized through a single async mutex with a bounded
//! acquisition wait. Concurrent readers are not permitted; at single-digit
//! millisecond record rates the simplicity is worth more than the
//! throughput.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use pumpgate::store::RingStore;
//! use pumpgate::protocol::TransactionRecord;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let (store, boot_id) = RingStore::open("./data/txnlog.bin", 5000).await?;
//!     let frame = TransactionRecord::encode(1, 1, 5000, 1899, 2633, 1);
//!     let rec = TransactionRecord::decode(&frame)?;
//!     let id = store.append(&rec).await?;
//!     assert_eq!(id, boot_id);
//!     Ok(())
//! }
//! ```

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{info, warn};
use thiserror::Error;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::time::timeout;

use crate::protocol::{TransactionRecord, RECORD_SIZE};

/// How long `append`/`read` wait for the store mutex before giving up.
const LOCK_WAIT: Duration = Duration::from_millis(250);

/// Errors surfaced by the log store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Backing file could not be mounted, even after one reformat attempt.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    /// Store mutex was not acquired within the bounded wait.
    #[error("store busy: lock not acquired within {LOCK_WAIT:?}")]
    Busy,

    /// Requested id is unwritten, or older than one ring cycle.
    #[error("id {id} out of readable window [{low}, {high})")]
    OutOfRange { id: u64, low: u64, high: u64 },

    /// Fewer than RECORD_SIZE bytes came back from the backing file.
    #[error("incomplete read: got {got} of {RECORD_SIZE} bytes")]
    ReadIncomplete { got: usize },

    /// A frame read back from storage failed marker/checksum validation.
    #[error("stored frame corrupt at id {id}")]
    Corrupt { id: u64 },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

struct StoreInner {
    file: File,
    current_id: u64,
}

/// Fixed-capacity circular record log over a single backing file.
pub struct RingStore {
    path: PathBuf,
    capacity: u64,
    inner: Mutex<StoreInner>,
}

impl RingStore {
    /// Open or create the backing file and recompute `current_id` from its
    /// length. On a mount failure the file is reformatted (deleted and
    /// recreated) once; a second failure is [`StoreError::StorageUnavailable`].
    ///
    /// Returns the store and the id computed at boot.
    pub async fn open(path: impl AsRef<Path>, capacity: u64) -> Result<(Self, u64), StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.ok();
        }
        let (file, current_id) = match Self::mount(&path).await {
            Ok(mounted) => mounted,
            Err(e) => {
                warn!(
                    "Transaction log mount failed ({}); reformatting {}",
                    e,
                    path.display()
                );
                let _ = fs::remove_file(&path).await;
                Self::mount(&path)
                    .await
                    .map_err(|e| StoreError::StorageUnavailable(e.to_string()))?
            }
        };
        info!(
            "Transaction log mounted at {} (capacity={}, current_id={})",
            path.display(),
            capacity,
            current_id
        );
        Ok((
            Self {
                path,
                capacity,
                inner: Mutex::new(StoreInner { file, current_id }),
            },
            current_id,
        ))
    }

    async fn mount(path: &Path) -> std::io::Result<(File, u64)> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .await?;
        let len = file.metadata().await?.len();
        // A torn tail write leaves a partial slot; ignore it rather than
        // serving a short record later.
        let current_id = len / RECORD_SIZE as u64;
        Ok((file, current_id))
    }

    /// Next id that will be assigned by `append`.
    pub async fn current_id(&self) -> Result<u64, StoreError> {
        let inner = self.lock().await?;
        Ok(inner.current_id)
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Persist one record at the ring offset for the next id.
    ///
    /// Returns the assigned id. Fails with [`StoreError::Busy`] when the
    /// store mutex is contended past the bounded wait.
    pub async fn append(&self, record: &TransactionRecord) -> Result<u64, StoreError> {
        let mut inner = self.lock().await?;
        let id = inner.current_id;
        let offset = (id % self.capacity) * RECORD_SIZE as u64;
        inner.file.seek(SeekFrom::Start(offset)).await?;
        inner.file.write_all(&record.frame).await?;
        inner.file.flush().await?;
        inner.current_id += 1;
        Ok(id)
    }

    /// Read back the record stored under `id`.
    ///
    /// Fails with [`StoreError::OutOfRange`] when `id` is unwritten or has
    /// been lapped by the ring, [`StoreError::ReadIncomplete`] on a short
    /// read.
    pub async fn read(&self, id: u64) -> Result<TransactionRecord, StoreError> {
        let mut inner = self.lock().await?;
        let high = inner.current_id;
        let low = high.saturating_sub(self.capacity);
        if id >= high || id < low {
            return Err(StoreError::OutOfRange { id, low, high });
        }
        let offset = (id % self.capacity) * RECORD_SIZE as u64;
        inner.file.seek(SeekFrom::Start(offset)).await?;
        let mut frame = [0u8; RECORD_SIZE];
        let mut got = 0usize;
        while got < RECORD_SIZE {
            let n = inner.file.read(&mut frame[got..]).await?;
            if n == 0 {
                return Err(StoreError::ReadIncomplete { got });
            }
            got += n;
        }
        TransactionRecord::decode(&frame).map_err(|_| StoreError::Corrupt { id })
    }

    /// Delete the backing region and reset `current_id` to 0.
    pub async fn clear(&self) -> Result<(), StoreError> {
        let mut inner = self.lock().await?;
        inner.file.set_len(0).await?;
        inner.file.seek(SeekFrom::Start(0)).await?;
        inner.current_id = 0;
        info!("Transaction log cleared at {}", self.path.display());
        Ok(())
    }

    async fn lock(&self) -> Result<tokio::sync::MutexGuard<'_, StoreInner>, StoreError> {
        timeout(LOCK_WAIT, self.inner.lock())
            .await
            .map_err(|_| StoreError::Busy)
    }
}

/// Small persisted counter tracking device restarts across reboots.
///
/// Stored as a decimal string in its own file next to the transaction log;
/// corrupt or missing content restarts the count at zero.
pub struct RestartCounter {
    path: PathBuf,
}

impl RestartCounter {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub async fn load(&self) -> u32 {
        match fs::read_to_string(&self.path).await {
            Ok(s) => s.trim().parse().unwrap_or(0),
            Err(_) => 0,
        }
    }

    /// Increment and persist; returns the new count.
    pub async fn increment(&self) -> u32 {
        let next = self.load().await + 1;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await.ok();
        }
        if let Err(e) = fs::write(&self.path, next.to_string()).await {
            warn!("Failed to persist restart counter: {}", e);
        }
        next
    }
}
