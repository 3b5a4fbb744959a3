//! Document store adapter for corral.
//!
//! Entities live as JSON documents grouped in collections. Every write goes
//! through [`DocumentStore::run_batch`]: a list of [`Op`]s whose assertions are
//! checked against one consistent snapshot and whose mutations apply
//! all-or-nothing. Two backends are provided: [`MemoryStore`] for tests and
//! embedding, and [`FileStore`], which persists documents under a
//! [`StoreLayout`] with a write-ahead log, an exclusive store lock, and
//! blake3 checksums.

pub mod apply;
pub mod document;
pub mod file;
pub mod integrity;
pub mod layout;
pub mod lock;
pub mod memory;
pub mod wal;

pub use apply::{plan_batch, BatchPlan, PlannedWrite};
pub use document::{Assert, BatchOutcome, Condition, Document, Mutation, Op, Update};
pub use file::FileStore;
pub use integrity::{verify_store_integrity, IntegrityFailure, IntegrityReport};
pub use layout::{StoreLayout, STORE_FORMAT_VERSION};
pub use lock::StoreLock;
pub use memory::MemoryStore;
pub use wal::{RollbackStep, WalEntry, WriteAheadLog};

use corral_schema::StoreSection;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

/// Fsync a directory so that a preceding `rename()` is durable.
pub(crate) fn fsync_dir(dir: &Path) -> Result<(), std::io::Error> {
    let f = std::fs::File::open(dir)?;
    f.sync_all()
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("integrity check failed for document '{id}': expected {expected}, got {actual}")]
    IntegrityFailure {
        id: String,
        expected: String,
        actual: String,
    },
    #[error("lock acquisition failed: {0}")]
    LockFailed(String),
    #[error("store format version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("cannot apply update to '{collection}/{id}': {reason}")]
    InvalidUpdate {
        collection: String,
        id: String,
        reason: String,
    },
    #[error("invalid store configuration: {0}")]
    InvalidConfig(String),
}

/// Access to collections of documents and the atomic batch primitive.
///
/// Implementations must evaluate every assertion of a batch against a single
/// snapshot and apply either all mutations or none.
pub trait DocumentStore: Send + Sync {
    /// Short backend name used in logs.
    fn name(&self) -> &'static str;

    fn find_one(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError>;

    /// All documents in `collection` matching every condition, ordered by id.
    fn find_many(
        &self,
        collection: &str,
        conditions: &[Condition],
    ) -> Result<Vec<Document>, StoreError>;

    fn run_batch(&self, ops: &[Op]) -> Result<BatchOutcome, StoreError>;

    /// Atomically return the current value of the named sequence and advance
    /// it. Sequences start at 0 and are not rolled back by aborted batches.
    fn next_sequence(&self, name: &str) -> Result<u64, StoreError>;
}

/// Open the backend selected by the `[store]` configuration section.
pub fn open_store(section: &StoreSection) -> Result<Arc<dyn DocumentStore>, StoreError> {
    match section.backend.as_str() {
        "memory" => Ok(Arc::new(MemoryStore::new())),
        "file" => {
            let path = section.path.as_ref().ok_or_else(|| {
                StoreError::InvalidConfig("file backend requires a path".to_owned())
            })?;
            Ok(Arc::new(FileStore::open(path)?))
        }
        other => Err(StoreError::InvalidConfig(format!(
            "unknown backend '{other}'"
        ))),
    }
}
