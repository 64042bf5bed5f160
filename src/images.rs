use crate::{
    config::StorageConfig,
    error::{EdgesyncError, Result},
};
use chrono::Utc;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// On-disk store for event snapshot images.
///
/// Images are sharded by event type and capture date so a directory never
/// accumulates unbounded entries:
/// `<base>/<event_type>/<YYYY-MM-DD>/<timestamp>_<id>.jpg`.
/// Uploads are best-effort; eviction is by count, oldest first.
pub struct ImageStore {
    base_path: PathBuf,
    max_stored_images: u32,
}

impl ImageStore {
    pub fn new(storage: &StorageConfig) -> Self {
        Self {
            base_path: PathBuf::from(&storage.image_path),
            max_stored_images: storage.max_stored_images,
        }
    }

    /// Write a snapshot to its sharded location and return the stored path
    pub async fn save_image(&self, event_type: &str, data: &[u8]) -> Result<PathBuf> {
        if data.is_empty() {
            return Err(EdgesyncError::validation("Refusing to store empty image"));
        }

        let now = Utc::now();
        let dir = self
            .base_path
            .join(sanitize_component(event_type))
            .join(now.format("%Y-%m-%d").to_string());
        tokio::fs::create_dir_all(&dir).await?;

        let file_name = format!(
            "{}_{}.jpg",
            now.timestamp(),
            &Uuid::new_v4().simple().to_string()[..8]
        );
        let path = dir.join(file_name);
        tokio::fs::write(&path, data).await?;

        debug!(path = %path.display(), bytes = data.len(), "Snapshot image stored");
        Ok(path)
    }

    /// Read back a stored snapshot for upload. Rejects paths outside the
    /// image base directory.
    pub async fn load_image(&self, path: &Path) -> Result<Vec<u8>> {
        if !self.is_managed_path(path) {
            return Err(EdgesyncError::validation(format!(
                "Image path escapes the store: {}",
                path.display()
            )));
        }
        Ok(tokio::fs::read(path).await?)
    }

    /// Remove a single snapshot. Missing files are not an error.
    pub async fn delete_image(&self, path: &Path) -> Result<()> {
        if !self.is_managed_path(path) {
            return Err(EdgesyncError::validation(format!(
                "Image path escapes the store: {}",
                path.display()
            )));
        }
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Number of snapshots currently on disk
    pub async fn count_images(&self) -> Result<u64> {
        Ok(self.list_images().await?.len() as u64)
    }

    /// Evict snapshots beyond the configured cap, oldest first by modification
    /// time. Returns the number removed. Empty shard directories are swept
    /// afterwards.
    pub async fn cleanup_old_images(&self) -> Result<u64> {
        let mut images = self.list_images().await?;
        let max = self.max_stored_images as usize;
        if images.len() <= max {
            return Ok(0);
        }

        images.sort_by_key(|(_, modified)| *modified);
        let excess = images.len() - max;

        let mut removed = 0u64;
        for (path, _) in images.into_iter().take(excess) {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => removed += 1,
                Err(e) => warn!(path = %path.display(), "Failed to evict image: {}", e),
            }
        }

        self.remove_empty_shards().await;

        if removed > 0 {
            info!(removed = removed, "Image retention cleanup complete");
        }
        Ok(removed)
    }

    fn is_managed_path(&self, path: &Path) -> bool {
        path.starts_with(&self.base_path)
            && !path
                .components()
                .any(|c| matches!(c, std::path::Component::ParentDir))
    }

    // Non-recursive walk over the fixed <type>/<date>/ layout
    async fn list_images(&self) -> Result<Vec<(PathBuf, std::time::SystemTime)>> {
        let mut images = Vec::new();
        let mut dirs = vec![self.base_path.clone()];

        while let Some(dir) = dirs.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let metadata = entry.metadata().await?;
                if metadata.is_dir() {
                    dirs.push(entry.path());
                } else if entry.path().extension().map_or(false, |e| e == "jpg") {
                    let modified = metadata
                        .modified()
                        .unwrap_or(std::time::SystemTime::UNIX_EPOCH);
                    images.push((entry.path(), modified));
                }
            }
        }

        Ok(images)
    }

    async fn remove_empty_shards(&self) {
        let mut date_dirs = Vec::new();
        let mut type_dirs = Vec::new();

        if let Ok(mut entries) = tokio::fs::read_dir(&self.base_path).await {
            while let Ok(Some(entry)) = entries.next_entry().await {
                if entry.metadata().await.map_or(false, |m| m.is_dir()) {
                    type_dirs.push(entry.path());
                    if let Ok(mut inner) = tokio::fs::read_dir(entry.path()).await {
                        while let Ok(Some(inner_entry)) = inner.next_entry().await {
                            if inner_entry.metadata().await.map_or(false, |m| m.is_dir()) {
                                date_dirs.push(inner_entry.path());
                            }
                        }
                    }
                }
            }
        }

        // remove_dir only succeeds on empty directories, which is the point
        for dir in date_dirs.into_iter().chain(type_dirs) {
            let _ = tokio::fs::remove_dir(&dir).await;
        }
    }
}

fn sanitize_component(value: &str) -> String {
    value
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
