//! Snapshot store backed by the local filesystem.
//!
//! One JSON file per document under a base directory, with the vector
//! clock in a sibling file so clock updates never rewrite the full
//! snapshot. Replacement is atomic: write a temp file, then rename over
//! the target.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;

use crate::convergent::{DocumentId, DocumentSnapshot, VectorClock};

use super::{SnapshotStore, StorageError};

const SNAPSHOT_EXT: &str = "json";
const CLOCK_EXT: &str = "clock.json";

/// Persists documents as `{base_dir}/{id}.json` and clocks as
/// `{base_dir}/{id}.clock.json`. Document ids are used as file names
/// verbatim, so hosts that allow arbitrary ids should keep them
/// filesystem-safe.
pub struct LocalFileStore {
    base_dir: PathBuf,
}

impl LocalFileStore {
    /// Open a store rooted at `base_dir`, creating the directory if
    /// needed.
    pub async fn new(base_dir: impl AsRef<Path>) -> Result<Self, StorageError> {
        let base_dir = base_dir.as_ref().to_path_buf();
        fs::create_dir_all(&base_dir).await?;
        Ok(Self { base_dir })
    }

    fn snapshot_path(&self, doc_id: &str) -> PathBuf {
        self.base_dir.join(format!("{doc_id}.{SNAPSHOT_EXT}"))
    }

    fn clock_path(&self, doc_id: &str) -> PathBuf {
        self.base_dir.join(format!("{doc_id}.{CLOCK_EXT}"))
    }

    async fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, bytes).await?;
        fs::rename(&tmp, path).await?;
        Ok(())
    }
}

#[async_trait]
impl SnapshotStore for LocalFileStore {
    async fn get(&self, doc_id: &str) -> Result<Option<DocumentSnapshot>, StorageError> {
        match fs::read(self.snapshot_path(doc_id)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, snapshot: &DocumentSnapshot) -> Result<(), StorageError> {
        let bytes = serde_json::to_vec(snapshot)?;
        self.write_atomic(&self.snapshot_path(&snapshot.id), &bytes)
            .await?;
        self.clock_merge(&snapshot.id, &snapshot.clock).await
    }

    async fn list(&self) -> Result<Vec<DocumentId>, StorageError> {
        let mut ids = Vec::new();
        let mut entries = fs::read_dir(&self.base_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(id) = name.strip_suffix(&format!(".{SNAPSHOT_EXT}")) {
                if !id.ends_with(".clock") {
                    ids.push(id.to_string());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    async fn delete(&self, doc_id: &str) -> Result<(), StorageError> {
        for path in [self.snapshot_path(doc_id), self.clock_path(doc_id)] {
            match fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    async fn clock_get(&self, doc_id: &str) -> Result<VectorClock, StorageError> {
        match fs::read(self.clock_path(doc_id)).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(VectorClock::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn clock_merge(&self, doc_id: &str, clock: &VectorClock) -> Result<(), StorageError> {
        let mut stored = self.clock_get(doc_id).await?;
        stored.merge(clock);
        let bytes = serde_json::to_vec(&stored)?;
        self.write_atomic(&self.clock_path(doc_id), &bytes).await
    }
}
