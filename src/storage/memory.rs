//! In-memory snapshot store for tests and single-process deployments.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::convergent::{DocumentId, DocumentSnapshot, VectorClock};

use super::{SnapshotStore, StorageError};

/// Keeps snapshots and clocks in two maps behind an async lock. Nothing
/// survives the process; useful as the default store and in tests.
#[derive(Default)]
pub struct MemoryStore {
    snapshots: RwLock<HashMap<DocumentId, DocumentSnapshot>>,
    clocks: RwLock<HashMap<DocumentId, VectorClock>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SnapshotStore for MemoryStore {
    async fn get(&self, doc_id: &str) -> Result<Option<DocumentSnapshot>, StorageError> {
        Ok(self.snapshots.read().await.get(doc_id).cloned())
    }

    async fn put(&self, snapshot: &DocumentSnapshot) -> Result<(), StorageError> {
        self.snapshots
            .write()
            .await
            .insert(snapshot.id.clone(), snapshot.clone());
        // Keep the separable clock in step with the snapshot.
        self.clock_merge(&snapshot.id, &snapshot.clock).await
    }

    async fn list(&self) -> Result<Vec<DocumentId>, StorageError> {
        Ok(self.snapshots.read().await.keys().cloned().collect())
    }

    async fn delete(&self, doc_id: &str) -> Result<(), StorageError> {
        self.snapshots.write().await.remove(doc_id);
        self.clocks.write().await.remove(doc_id);
        Ok(())
    }

    async fn clock_get(&self, doc_id: &str) -> Result<VectorClock, StorageError> {
        Ok(self.clocks.read().await.get(doc_id).cloned().unwrap_or_default())
    }

    async fn clock_merge(&self, doc_id: &str, clock: &VectorClock) -> Result<(), StorageError> {
        self.clocks
            .write()
            .await
            .entry(doc_id.to_string())
            .or_default()
            .merge(clock);
        Ok(())
    }
}
