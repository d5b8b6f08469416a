use crate::traits::{validate_key, ObjectMetadata, Storage, StorageError, StorageResult};
use crate::StorageBackend;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tokio::fs;

/// Local filesystem storage: `{root}/{bucket}/{object_name}`.
#[derive(Clone)]
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    /// Create a new LocalStorage instance
    ///
    /// # Arguments
    /// * `root` - Directory holding one subdirectory per bucket (e.g., "/var/lib/csvtrack/buckets")
    pub async fn new(root: impl Into<PathBuf>) -> StorageResult<Self> {
        let root = root.into();

        fs::create_dir_all(&root).await.map_err(|e| {
            StorageError::ConfigError(format!(
                "Failed to create storage directory {}: {}",
                root.display(),
                e
            ))
        })?;

        Ok(LocalStorage { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn bucket_path(&self, bucket: &str) -> PathBuf {
        self.root.join(bucket)
    }

    /// Convert bucket and object name to a filesystem path that stays under the root.
    fn key_to_path(&self, bucket: &str, object_name: &str) -> StorageResult<PathBuf> {
        validate_key(bucket, object_name)?;

        let path = self.bucket_path(bucket).join(object_name);

        // Symlinks inside the tree could still point outside of it.
        if let (Ok(canonical), Ok(root_canonical)) = (path.canonicalize(), self.root.canonicalize())
        {
            if canonical.strip_prefix(&root_canonical).is_err() {
                return Err(StorageError::InvalidKey(format!(
                    "{}/{} resolves outside storage directory",
                    bucket, object_name
                )));
            }
        }

        Ok(path)
    }

    async fn ensure_exists(&self, path: &Path, bucket: &str, object_name: &str) -> StorageResult<()> {
        if !fs::try_exists(path).await.unwrap_or(false) {
            return Err(StorageError::NotFound(format!("{}/{}", bucket, object_name)));
        }
        Ok(())
    }
}

#[async_trait]
impl Storage for LocalStorage {
    async fn download(&self, bucket: &str, object_name: &str) -> StorageResult<Vec<u8>> {
        let path = self.key_to_path(bucket, object_name)?;
        let start = std::time::Instant::now();

        self.ensure_exists(&path, bucket, object_name).await?;

        let data = fs::read(&path).await.map_err(|e| {
            StorageError::DownloadFailed(format!("Failed to read file {}: {}", path.display(), e))
        })?;

        tracing::info!(
            path = %path.display(),
            bucket = %bucket,
            object_name = %object_name,
            size_bytes = data.len(),
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "Local storage download successful"
        );

        Ok(data)
    }

    async fn head(&self, bucket: &str, object_name: &str) -> StorageResult<ObjectMetadata> {
        let path = self.key_to_path(bucket, object_name)?;
        self.ensure_exists(&path, bucket, object_name).await?;

        let metadata = fs::metadata(&path).await?;
        if !metadata.is_file() {
            return Err(StorageError::NotFound(format!("{}/{}", bucket, object_name)));
        }

        // Not every filesystem records birth time.
        let created_at = metadata
            .created()
            .or_else(|_| metadata.modified())
            .ok()
            .map(DateTime::<Utc>::from);

        Ok(ObjectMetadata {
            size: metadata.len(),
            created_at,
        })
    }

    async fn list(&self, bucket: &str) -> StorageResult<Vec<String>> {
        validate_key(bucket, "_")?;
        let bucket_root = self.bucket_path(bucket);
        if !fs::try_exists(&bucket_root).await.unwrap_or(false) {
            return Err(StorageError::NotFound(bucket.to_string()));
        }

        let mut names = Vec::new();
        let mut pending = vec![bucket_root.clone()];
        while let Some(dir) = pending.pop() {
            let mut entries = fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let file_type = entry.file_type().await?;
                let path = entry.path();
                if file_type.is_dir() {
                    pending.push(path);
                } else if file_type.is_file() {
                    if let Ok(relative) = path.strip_prefix(&bucket_root) {
                        let name = relative
                            .components()
                            .map(|c| c.as_os_str().to_string_lossy().into_owned())
                            .collect::<Vec<_>>()
                            .join("/");
                        names.push(name);
                    }
                }
            }
        }
        names.sort();

        tracing::debug!(bucket = %bucket, count = names.len(), "Listed bucket");
        Ok(names)
    }

    fn backend_type(&self) -> StorageBackend {
        StorageBackend::Local
    }
}
