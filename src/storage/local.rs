// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Filesystem backend. Objects live at `<path>/<item type>/<locator>`.
//!
//! Writes go to a uniquely named temp file in the same directory and are
//! renamed into place, so a reader never observes a partial object. The
//! whole write runs as one blocking task: a caller that stops waiting (a
//! deadline, a dropped future) does not stop the write halfway, and the temp
//! file is always either renamed or removed.

use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::fs;
use tracing::{debug, warn};

use super::traits::{StorageError, UnitBackend};
use crate::index::ItemType;

#[derive(Debug, Clone, Deserialize)]
pub struct LocalStorageConfig {
    pub path: PathBuf,
}

#[derive(Debug)]
pub struct LocalBackend {
    root: PathBuf,
}

fn map_io(context: &str, err: std::io::Error) -> StorageError {
    match err.kind() {
        ErrorKind::NotFound => StorageError::NotFound(context.to_string()),
        ErrorKind::PermissionDenied => StorageError::Fatal(format!("{}: {}", context, err)),
        _ => StorageError::Backend(format!("{}: {}", context, err)),
    }
}

/// Locators are hex digests; anything else could escape the root.
fn check_locator(locator: &str) -> Result<(), StorageError> {
    if locator.is_empty() || !locator.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_') {
        return Err(StorageError::InvalidInput(format!("invalid locator '{}'", locator)));
    }
    Ok(())
}

impl LocalBackend {
    /// Create the root if needed and check that it is a writable directory.
    pub async fn init(config: LocalStorageConfig) -> Result<Self, StorageError> {
        if config.path.as_os_str().is_empty() {
            return Err(StorageError::Config("local storage path is empty".into()));
        }

        fs::create_dir_all(&config.path)
            .await
            .map_err(|e| StorageError::Config(format!("cannot create {}: {}", config.path.display(), e)))?;

        let meta = fs::metadata(&config.path)
            .await
            .map_err(|e| StorageError::Config(format!("cannot stat {}: {}", config.path.display(), e)))?;
        if !meta.is_dir() {
            return Err(StorageError::Config(format!("{} is not a directory", config.path.display())));
        }
        if meta.permissions().readonly() {
            return Err(StorageError::Config(format!("{} is read-only", config.path.display())));
        }

        debug!(path = %config.path.display(), "Local storage initialized");
        Ok(Self { root: config.path })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, item_type: ItemType, locator: &str) -> Result<PathBuf, StorageError> {
        check_locator(locator)?;
        Ok(self.root.join(item_type.as_str()).join(locator))
    }
}

#[async_trait]
impl UnitBackend for LocalBackend {
    fn kind(&self) -> &'static str {
        "local"
    }

    async fn put_object(&self, item_type: ItemType, locator: &str, data: Vec<u8>) -> Result<(), StorageError> {
        let path = self.object_path(item_type, locator)?;
        let dir = self.root.join(item_type.as_str());
        let tmp = dir.join(format!(".{}.{}.tmp", locator, uuid::Uuid::new_v4()));

        tokio::task::spawn_blocking(move || write_atomically(&dir, &tmp, &path, &data))
            .await
            .map_err(|e| StorageError::Backend(format!("write task failed: {}", e)))?
    }

    async fn get_object(&self, item_type: ItemType, locator: &str) -> Result<Vec<u8>, StorageError> {
        let path = self.object_path(item_type, locator)?;
        fs::read(&path)
            .await
            .map_err(|e| map_io(&format!("object {}/{}", item_type, locator), e))
    }

    async fn object_exists(&self, item_type: ItemType, locator: &str) -> Result<bool, StorageError> {
        let path = self.object_path(item_type, locator)?;
        match fs::metadata(&path).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(map_io("probing object", e)),
        }
    }
}

/// Temp file, fsync, rename. On error the temp file is removed.
fn write_atomically(dir: &Path, tmp: &Path, path: &Path, data: &[u8]) -> Result<(), StorageError> {
    std::fs::create_dir_all(dir).map_err(|e| map_io("creating type directory", e))?;

    let written: std::io::Result<()> = (|| {
        let mut file = std::fs::File::create(tmp)?;
        file.write_all(data)?;
        file.sync_all()?;
        drop(file);
        std::fs::rename(tmp, path)
    })();

    if let Err(e) = written {
        if let Err(cleanup) = std::fs::remove_file(tmp) {
            if cleanup.kind() != ErrorKind::NotFound {
                warn!(path = %tmp.display(), error = %cleanup, "Failed to remove temp file");
            }
        }
        return Err(map_io("writing object", e));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn backend() -> (LocalBackend, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::init(LocalStorageConfig {
            path: dir.path().join("units"),
        })
        .await
        .unwrap();
        (backend, dir)
    }

    #[tokio::test]
    async fn test_put_get_exists() {
        let (backend, _dir) = backend().await;
        assert!(!backend.object_exists(ItemType::StepLog, "abc123").await.unwrap());

        backend.put_object(ItemType::StepLog, "abc123", b"sealed".to_vec()).await.unwrap();

        assert!(backend.object_exists(ItemType::StepLog, "abc123").await.unwrap());
        assert!(!backend.object_exists(ItemType::ServiceLog, "abc123").await.unwrap());
        assert_eq!(backend.get_object(ItemType::StepLog, "abc123").await.unwrap(), b"sealed");
        assert!(backend.root().join("StepLog").join("abc123").is_file());
    }

    #[tokio::test]
    async fn test_rewrite_is_idempotent() {
        let (backend, _dir) = backend().await;
        backend.put_object(ItemType::StepLog, "same", b"bytes".to_vec()).await.unwrap();
        backend.put_object(ItemType::StepLog, "same", b"bytes".to_vec()).await.unwrap();

        let entries: Vec<_> = std::fs::read_dir(backend.root().join("StepLog")).unwrap().collect();
        assert_eq!(entries.len(), 1, "no temp files left behind");
    }

    #[tokio::test]
    async fn test_abandoned_write_completes_without_temp_files() {
        let (backend, _dir) = backend().await;
        let data = vec![7u8; 4 * 1024 * 1024];

        // The caller gives up as soon as the write is handed off
        let _ = tokio::time::timeout(Duration::ZERO, backend.put_object(ItemType::StepLog, "slow", data.clone())).await;

        let mut landed = false;
        for _ in 0..200 {
            if backend.object_exists(ItemType::StepLog, "slow").await.unwrap() {
                landed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(landed, "write stopped halfway");
        assert_eq!(backend.get_object(ItemType::StepLog, "slow").await.unwrap(), data);

        let names: Vec<_> = std::fs::read_dir(backend.root().join("StepLog"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["slow".to_string()]);
    }

    #[tokio::test]
    async fn test_missing_object_is_not_found() {
        let (backend, _dir) = backend().await;
        let err = backend.get_object(ItemType::StepLog, "missing").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_locator_cannot_escape_root() {
        let (backend, _dir) = backend().await;
        let err = backend.put_object(ItemType::StepLog, "../escape", vec![1]).await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_init_rejects_file_path() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("not-a-dir");
        std::fs::write(&file, b"x").unwrap();

        let err = LocalBackend::init(LocalStorageConfig { path: file }).await.unwrap_err();
        assert!(matches!(err, StorageError::Config(_)));
    }

    #[tokio::test]
    async fn test_init_rejects_empty_path() {
        let err = LocalBackend::init(LocalStorageConfig { path: PathBuf::new() }).await.unwrap_err();
        assert!(matches!(err, StorageError::Config(_)));
    }
}
