//! The persistence boundary.
//!
//! The coordinator talks to storage through the [`SnapshotStore`] trait
//! and nothing else; backends can be swapped without touching the core.
//! Vector clocks are persisted separably from full snapshots so the
//! frequent clock updates stay cheap.

mod local_file;
mod memory;

pub use local_file::LocalFileStore;
pub use memory::MemoryStore;

use async_trait::async_trait;
use thiserror::Error;

use crate::convergent::{DocumentId, DocumentSnapshot, VectorClock};

#[derive(Debug, Error)]
pub enum StorageError {
    /// The backend could not be reached or refused the operation. The
    /// coordinator keeps serving from memory and retries later.
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("stored document is unreadable: {0}")]
    Corrupt(String),
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::Unavailable(err.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Corrupt(err.to_string())
    }
}

/// Abstract load/save of document snapshots and vector clocks.
///
/// `put` is an atomic replace. `clock_merge` must take the per-replica
/// max against whatever clock is already stored, never overwrite it
/// wholesale.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn get(&self, doc_id: &str) -> Result<Option<DocumentSnapshot>, StorageError>;

    async fn put(&self, snapshot: &DocumentSnapshot) -> Result<(), StorageError>;

    /// Every stored document id. Admin and recovery only.
    async fn list(&self) -> Result<Vec<DocumentId>, StorageError>;

    /// Administrative removal. Absent documents are not an error.
    async fn delete(&self, doc_id: &str) -> Result<(), StorageError>;

    /// The stored clock for a document (empty if none).
    async fn clock_get(&self, doc_id: &str) -> Result<VectorClock, StorageError>;

    /// Merge `clock` into the stored clock, taking the per-replica max.
    async fn clock_merge(&self, doc_id: &str, clock: &VectorClock) -> Result<(), StorageError>;
}
