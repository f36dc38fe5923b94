//! Durable storage boundary used to fetch inputs and publish outputs.

use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tokio::io::{self, AsyncRead};

/// Scheme prefix that marks an input value as a storage handle rather than
/// literal content.
pub const STORAGE_SCHEME: &str = "storage://";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Not a storage handle: {0}")]
    InvalidHandle(String),
    #[error("Invalid storage object name: {0}")]
    InvalidName(String),
    #[error("Storage object not found: {0}")]
    NotFound(String),
    #[error("Storage I/O failure for {target}: {source}")]
    Io {
        target: String,
        source: std::io::Error,
    },
}

#[async_trait]
pub trait Storage: Send + Sync {
    /// Open the object behind `handle` for reading.
    async fn fetch(&self, handle: &str) -> Result<Box<dyn AsyncRead + Send + Unpin>, StorageError>;

    /// Write `content` under `name`, replacing any previous object, and return
    /// its handle.
    async fn store(
        &self,
        name: &str,
        content: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<String, StorageError>;
}

pub fn is_storage_handle(value: &str) -> bool {
    value.starts_with(STORAGE_SCHEME)
}

/// Filesystem-backed storage. Handles look like `storage:///<name>`.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, name: &str) -> Result<PathBuf, StorageError> {
        let relative = Path::new(name.trim_start_matches('/'));
        if relative.as_os_str().is_empty() {
            return Err(StorageError::InvalidName(name.to_string()));
        }
        for component in relative.components() {
            match component {
                Component::Normal(_) | Component::CurDir => {}
                _ => return Err(StorageError::InvalidName(name.to_string())),
            }
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl Storage for LocalStorage {
    async fn fetch(&self, handle: &str) -> Result<Box<dyn AsyncRead + Send + Unpin>, StorageError> {
        let name = handle
            .strip_prefix(STORAGE_SCHEME)
            .ok_or_else(|| StorageError::InvalidHandle(handle.to_string()))?;
        let path = self.object_path(name)?;

        match fs::File::open(&path).await {
            Ok(file) => Ok(Box::new(file)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(handle.to_string()))
            }
            Err(source) => Err(StorageError::Io {
                target: handle.to_string(),
                source,
            }),
        }
    }

    async fn store(
        &self,
        name: &str,
        content: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<String, StorageError> {
        let path = self.object_path(name)?;
        let io_err = |source| StorageError::Io {
            target: path.display().to_string(),
            source,
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(io_err)?;
        }
        let mut file = fs::File::create(&path).await.map_err(io_err)?;
        io::copy(content, &mut file).await.map_err(io_err)?;

        Ok(format!(
            "{}/{}",
            STORAGE_SCHEME,
            name.trim_start_matches('/')
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tokio::io::AsyncReadExt;

    async fn read_all(storage: &LocalStorage, handle: &str) -> Vec<u8> {
        let mut reader = storage.fetch(handle).await.unwrap();
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await.unwrap();
        buf
    }

    #[tokio::test]
    async fn store_then_fetch_returns_same_bytes() {
        let dir = tempdir().unwrap();
        let storage = LocalStorage::new(dir.path());

        let handle = storage
            .store("exec/report.txt", &mut &b"hello"[..])
            .await
            .unwrap();

        assert_eq!(handle, "storage:///exec/report.txt");
        assert_eq!(read_all(&storage, &handle).await, b"hello");
    }

    #[tokio::test]
    async fn store_overwrites_existing_object() {
        let dir = tempdir().unwrap();
        let storage = LocalStorage::new(dir.path());

        storage.store("a.txt", &mut &b"first"[..]).await.unwrap();
        let handle = storage.store("a.txt", &mut &b"second"[..]).await.unwrap();

        assert_eq!(read_all(&storage, &handle).await, b"second");
    }

    #[tokio::test]
    async fn rejects_traversal_and_foreign_handles() {
        let dir = tempdir().unwrap();
        let storage = LocalStorage::new(dir.path());

        assert!(matches!(
            storage.store("../escape", &mut &b""[..]).await,
            Err(StorageError::InvalidName(_))
        ));
        assert!(matches!(
            storage.fetch("s3://bucket/key").await,
            Err(StorageError::InvalidHandle(_))
        ));
        assert!(matches!(
            storage.fetch("storage:///missing").await,
            Err(StorageError::NotFound(_))
        ));
    }
}
