//! Durable storage for accepted payloads.

use crate::error::PullError;
use crate::types::{MediaKind, StorageRef};
use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

/// Persists validated payloads and hands back a stable reference.
#[async_trait]
pub trait StorageSink: Send + Sync {
    async fn persist(&self, payload: Bytes, kind: MediaKind) -> Result<StorageRef, PullError>;
}

/// Flat directory of `<uuid>.<ext>` files.
#[derive(Debug, Clone)]
pub struct FsStorage {
    root: PathBuf,
}

impl FsStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute location of a stored blob.
    pub fn resolve(&self, storage_ref: &StorageRef) -> PathBuf {
        self.root.join(&storage_ref.0)
    }

    /// Size on disk, or `None` when the blob is gone.
    pub async fn size_of(&self, storage_ref: &StorageRef) -> Option<u64> {
        tokio::fs::metadata(self.resolve(storage_ref))
            .await
            .ok()
            .map(|m| m.len())
    }

    /// Deletes a blob. Missing files are not an error.
    pub async fn remove(&self, storage_ref: &StorageRef) -> Result<(), PullError> {
        match tokio::fs::remove_file(self.resolve(storage_ref)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl StorageSink for FsStorage {
    async fn persist(&self, payload: Bytes, kind: MediaKind) -> Result<StorageRef, PullError> {
        tokio::fs::create_dir_all(&self.root).await?;

        let filename = format!("{}.{}", Uuid::new_v4(), kind.extension());
        let final_path = self.root.join(&filename);
        let part_path = self.root.join(format!(".{}.part", filename));

        // Write beside the target then rename, so a reader never sees half a file
        let write = async {
            let mut file = tokio::fs::File::create(&part_path).await?;
            file.write_all(&payload).await?;
            file.sync_all().await?;
            tokio::fs::rename(&part_path, &final_path).await
        };
        if let Err(e) = write.await {
            let _ = tokio::fs::remove_file(&part_path).await;
            return Err(PullError::Storage(format!(
                "Failed to write {}: {}",
                final_path.display(),
                e
            )));
        }

        debug!("Stored {} bytes as {}", payload.len(), filename);
        Ok(StorageRef(filename))
    }
}
