//! Durable index of accepted media.
//!
//! The library is the session side of the pipeline: it receives finished runs,
//! owns the vault flag and keeps track of how much disk the collection uses.

use crate::error::PullError;
use crate::storage::FsStorage;
use crate::types::{AcceptedMedia, MediaKind};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use uuid::Uuid;

/// Smallest believable photo file.
const MIN_PHOTO_BYTES: u64 = 1000;
/// Broken videos are almost always under 1 KiB; anything under 4 KiB is suspect.
const MIN_VIDEO_BYTES: u64 = 4096;

fn min_bytes(kind: MediaKind) -> u64 {
    match kind {
        MediaKind::Photo => MIN_PHOTO_BYTES,
        MediaKind::Video => MIN_VIDEO_BYTES,
    }
}

/// JSON-backed collection of [`AcceptedMedia`].
#[derive(Debug)]
pub struct MediaLibrary {
    index_path: PathBuf,
    storage: FsStorage,
    items: Vec<AcceptedMedia>,
}

impl MediaLibrary {
    /// Loads the index at `index_path`. A missing index is an empty library.
    pub async fn open(index_path: impl Into<PathBuf>, storage: FsStorage) -> Result<Self, PullError> {
        let index_path = index_path.into();
        let items = match tokio::fs::read(&index_path).await {
            Ok(raw) => serde_json::from_slice(&raw)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            index_path,
            storage,
            items,
        })
    }

    pub fn items(&self) -> &[AcceptedMedia] {
        &self.items
    }

    pub fn index_path(&self) -> &Path {
        &self.index_path
    }

    /// Items shown in the default view.
    pub fn visible(&self) -> impl Iterator<Item = &AcceptedMedia> {
        self.items.iter().filter(|m| !m.is_archived)
    }

    /// Items moved to the vault.
    pub fn archived(&self) -> impl Iterator<Item = &AcceptedMedia> {
        self.items.iter().filter(|m| m.is_archived)
    }

    /// Appends the accepted items of a finished run and saves.
    pub async fn merge(&mut self, accepted: Vec<AcceptedMedia>) -> Result<(), PullError> {
        if accepted.is_empty() {
            return Ok(());
        }
        info!("Adding {} items to the library", accepted.len());
        self.items.extend(accepted);
        self.save().await
    }

    /// Moves items into (`true`) or out of (`false`) the vault. Returns how many changed.
    pub async fn set_archived(&mut self, ids: &[Uuid], archived: bool) -> Result<usize, PullError> {
        let ids: HashSet<_> = ids.iter().collect();
        let mut changed = 0;
        for item in self.items.iter_mut().filter(|m| ids.contains(&m.id)) {
            if item.is_archived != archived {
                item.is_archived = archived;
                changed += 1;
            }
        }
        if changed > 0 {
            self.save().await?;
        }
        Ok(changed)
    }

    /// Deletes items and their files. Returns how many records were dropped.
    pub async fn remove(&mut self, ids: &[Uuid]) -> Result<usize, PullError> {
        let ids: HashSet<_> = ids.iter().collect();
        for item in self.items.iter().filter(|m| ids.contains(&m.id)) {
            self.storage.remove(&item.storage_ref).await?;
        }
        let before = self.items.len();
        self.items.retain(|m| !ids.contains(&m.id));
        let removed = before - self.items.len();
        if removed > 0 {
            self.save().await?;
        }
        Ok(removed)
    }

    /// Total bytes on disk for every file the library references.
    pub async fn used_storage(&self) -> u64 {
        let mut total = 0;
        for item in &self.items {
            total += self.storage.size_of(&item.storage_ref).await.unwrap_or(0);
        }
        total
    }

    /// Drops items whose file vanished or shrank below the minimum for its kind.
    ///
    /// Leftover undersized files are deleted. Returns the removed records.
    pub async fn sweep_broken(&mut self) -> Result<Vec<AcceptedMedia>, PullError> {
        let mut broken = Vec::new();
        for item in &self.items {
            match self.storage.size_of(&item.storage_ref).await {
                None => broken.push(item.id),
                Some(size) if size < min_bytes(item.media_kind) => {
                    warn!("{} is only {} bytes, removing", item.storage_ref, size);
                    self.storage.remove(&item.storage_ref).await?;
                    broken.push(item.id);
                }
                Some(_) => {}
            }
        }

        if broken.is_empty() {
            return Ok(Vec::new());
        }

        let (removed, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.items)
            .into_iter()
            .partition(|m| broken.contains(&m.id));
        self.items = kept;
        self.save().await?;
        info!("Swept {} broken items", broken.len());
        Ok(removed)
    }

    async fn save(&self) -> Result<(), PullError> {
        if let Some(parent) = self.index_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_vec_pretty(&self.items)?;
        let tmp = self.index_path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.index_path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::StorageRef;
    use chrono::Utc;

    fn media(name: &str, kind: MediaKind) -> AcceptedMedia {
        AcceptedMedia {
            id: Uuid::new_v4(),
            captured_at: Utc::now(),
            media_kind: kind,
            location_label: String::new(),
            source_url: format!("https://cdn.example.com/{}", name),
            storage_ref: StorageRef(name.to_string()),
            is_archived: false,
        }
    }

    async fn library(dir: &Path) -> MediaLibrary {
        let storage = FsStorage::new(dir.join("media"));
        MediaLibrary::open(dir.join("library.json"), storage).await.unwrap()
    }

    fn write_blob(dir: &Path, name: &str, len: usize) {
        std::fs::create_dir_all(dir.join("media")).unwrap();
        std::fs::write(dir.join("media").join(name), vec![0u8; len]).unwrap();
    }

    #[tokio::test]
    async fn test_merge_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let mut lib = library(dir.path()).await;
        assert!(lib.items().is_empty());

        let item = media("a.jpg", MediaKind::Photo);
        lib.merge(vec![item.clone()]).await.unwrap();

        let reopened = library(dir.path()).await;
        assert_eq!(reopened.items(), &[item]);
    }

    #[tokio::test]
    async fn test_archive_toggles_visibility() {
        let dir = tempfile::tempdir().unwrap();
        let mut lib = library(dir.path()).await;
        let a = media("a.jpg", MediaKind::Photo);
        let b = media("b.mp4", MediaKind::Video);
        lib.merge(vec![a.clone(), b.clone()]).await.unwrap();

        assert_eq!(lib.set_archived(&[a.id], true).await.unwrap(), 1);
        assert_eq!(lib.set_archived(&[a.id], true).await.unwrap(), 0);
        assert_eq!(lib.visible().count(), 1);
        assert_eq!(lib.archived().next().unwrap().id, a.id);

        let reopened = library(dir.path()).await;
        assert_eq!(reopened.archived().count(), 1);
    }

    #[tokio::test]
    async fn test_remove_deletes_files() {
        let dir = tempfile::tempdir().unwrap();
        write_blob(dir.path(), "a.jpg", 2000);
        let mut lib = library(dir.path()).await;
        let a = media("a.jpg", MediaKind::Photo);
        lib.merge(vec![a.clone()]).await.unwrap();

        assert_eq!(lib.remove(&[a.id]).await.unwrap(), 1);
        assert!(lib.items().is_empty());
        assert!(!dir.path().join("media/a.jpg").exists());
    }

    #[tokio::test]
    async fn test_used_storage_sums_existing_files() {
        let dir = tempfile::tempdir().unwrap();
        write_blob(dir.path(), "a.jpg", 2000);
        write_blob(dir.path(), "b.mp4", 5000);
        let mut lib = library(dir.path()).await;
        lib.merge(vec![
            media("a.jpg", MediaKind::Photo),
            media("b.mp4", MediaKind::Video),
            media("missing.jpg", MediaKind::Photo),
        ])
        .await
        .unwrap();

        assert_eq!(lib.used_storage().await, 7000);
    }

    #[tokio::test]
    async fn test_sweep_removes_missing_and_undersized() {
        let dir = tempfile::tempdir().unwrap();
        write_blob(dir.path(), "ok.jpg", 2000);
        write_blob(dir.path(), "ok.mp4", 8192);
        write_blob(dir.path(), "tiny.mp4", 800);
        let mut lib = library(dir.path()).await;
        lib.merge(vec![
            media("ok.jpg", MediaKind::Photo),
            media("ok.mp4", MediaKind::Video),
            media("tiny.mp4", MediaKind::Video),
            media("gone.jpg", MediaKind::Photo),
        ])
        .await
        .unwrap();

        let removed = lib.sweep_broken().await.unwrap();
        let mut names: Vec<_> = removed.iter().map(|m| m.storage_ref.0.as_str()).collect();
        names.sort();
        assert_eq!(names, vec!["gone.jpg", "tiny.mp4"]);
        assert_eq!(lib.items().len(), 2);
        assert!(!dir.path().join("media/tiny.mp4").exists());

        assert!(lib.sweep_broken().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_index_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("library.json"), b"{ nope").unwrap();
        let storage = FsStorage::new(dir.path().join("media"));
        assert!(MediaLibrary::open(dir.path().join("library.json"), storage).await.is_err());
    }
}
