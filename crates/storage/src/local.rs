//! Local filesystem storage backend
//!
//! Async file I/O with atomic publication: objects are written to a
//! hidden temp file, fsynced, then renamed into place, and the parent
//! directory is synced so the rename survives a crash.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use runtime_core::{Error, Result};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::StorageBackend;

/// Local filesystem storage backend rooted at a base directory
#[derive(Debug, Clone)]
pub struct LocalStorage {
    base_path: PathBuf,
}

impl LocalStorage {
    /// Create a backend rooted at `base_path`
    pub fn new<P: AsRef<Path>>(base_path: P) -> Self {
        Self {
            base_path: base_path.as_ref().to_path_buf(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn full_path(&self, path: &str) -> PathBuf {
        self.base_path.join(path)
    }

    /// Unique sibling temp path for an object, so a crashed write never
    /// collides with a later one
    fn temp_path(&self, path: &str) -> PathBuf {
        let full_path = self.full_path(path);
        let temp_name = format!(
            ".{}.{}.tmp",
            full_path.file_name().unwrap_or_default().to_string_lossy(),
            Uuid::new_v4()
        );
        full_path.with_file_name(temp_name)
    }

    async fn ensure_parent_dir(&self, full_path: &Path) -> Result<()> {
        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::Storage {
                    message: format!("Failed to create directory {parent:?}: {e}"),
                })?;
        }
        Ok(())
    }

    /// Fsync the directory containing `full_path`, best effort
    async fn sync_parent_dir(&self, full_path: &Path) {
        if let Some(parent) = full_path.parent() {
            if let Ok(dir) = fs::File::open(parent).await {
                let _ = dir.sync_all().await;
            }
        }
    }
}

#[async_trait]
impl StorageBackend for LocalStorage {
    #[instrument(skip(self), fields(backend = "local"))]
    async fn read(&self, path: &str) -> Result<Bytes> {
        let full_path = self.full_path(path);
        debug!(?full_path, "Reading file");

        match fs::read(&full_path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Error::StoragePathNotFound {
                path: path.to_string(),
            }),
            Err(e) => Err(Error::Storage {
                message: format!("Failed to read {path}: {e}"),
            }),
        }
    }

    #[instrument(skip(self, data), fields(backend = "local", size = data.len()))]
    async fn write(&self, path: &str, data: Bytes) -> Result<u64> {
        let full_path = self.full_path(path);
        let temp_path = self.temp_path(path);
        let size = data.len() as u64;

        debug!(?full_path, ?temp_path, size, "Writing file atomically");

        self.ensure_parent_dir(&full_path).await?;

        let mut file = fs::File::create(&temp_path)
            .await
            .map_err(|e| Error::Storage {
                message: format!("Failed to create temp file {temp_path:?}: {e}"),
            })?;
        file.write_all(&data).await.map_err(|e| Error::Storage {
            message: format!("Failed to write data: {e}"),
        })?;
        file.sync_all().await.map_err(|e| Error::Storage {
            message: format!("Failed to sync file: {e}"),
        })?;

        fs::rename(&temp_path, &full_path)
            .await
            .map_err(|e| Error::Storage {
                message: format!("Failed to rename {temp_path:?} to {full_path:?}: {e}"),
            })?;
        self.sync_parent_dir(&full_path).await;

        debug!(?full_path, size, "File written");
        Ok(size)
    }

    #[instrument(skip(self, data), fields(backend = "local", size = data.len()))]
    async fn write_if_absent(&self, path: &str, data: Bytes) -> Result<bool> {
        let full_path = self.full_path(path);
        self.ensure_parent_dir(&full_path).await?;

        // create_new gives the atomic exists-check-and-create; the file is
        // written in place since renaming over it would drop exclusivity.
        let open_result = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&full_path)
            .await;

        let mut file = match open_result {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                debug!(?full_path, "Path already exists");
                return Ok(false);
            }
            Err(e) => {
                return Err(Error::Storage {
                    message: format!("Failed to create {full_path:?}: {e}"),
                })
            }
        };

        file.write_all(&data).await.map_err(|e| Error::Storage {
            message: format!("Failed to write data: {e}"),
        })?;
        file.sync_all().await.map_err(|e| Error::Storage {
            message: format!("Failed to sync file: {e}"),
        })?;
        self.sync_parent_dir(&full_path).await;

        debug!(?full_path, "File created exclusively");
        Ok(true)
    }

    #[instrument(skip(self), fields(backend = "local"))]
    async fn delete(&self, path: &str) -> Result<()> {
        let full_path = self.full_path(path);
        debug!(?full_path, "Deleting file");

        match fs::remove_file(&full_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Error::StoragePathNotFound {
                path: path.to_string(),
            }),
            Err(e) => Err(Error::Storage {
                message: format!("Failed to delete {path}: {e}"),
            }),
        }
    }

    #[instrument(skip(self), fields(backend = "local"))]
    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(fs::metadata(self.full_path(path)).await.is_ok())
    }

    #[instrument(skip(self), fields(backend = "local"))]
    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let search_path = self.full_path(prefix);
        let mut results = Vec::new();

        let scan_root = if search_path.is_dir() {
            search_path
        } else {
            match search_path.parent() {
                Some(parent) if parent.is_dir() => parent.to_path_buf(),
                _ => return Ok(results),
            }
        };

        let mut stack = vec![scan_root];
        while let Some(dir) = stack.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(_) => continue,
            };

            while let Ok(Some(entry)) = entries.next_entry().await {
                let entry_path = entry.path();
                let metadata = match entry.metadata().await {
                    Ok(m) => m,
                    Err(_) => continue,
                };

                if metadata.is_dir() {
                    stack.push(entry_path);
                } else if metadata.is_file() {
                    if let Ok(relative) = entry_path.strip_prefix(&self.base_path) {
                        let relative_str = relative.to_string_lossy().to_string();
                        if relative_str.starts_with(prefix) {
                            results.push(relative_str);
                        }
                    }
                }
            }
        }

        results.sort();
        debug!(count = results.len(), prefix, "Listed files");
        Ok(results)
    }
}
