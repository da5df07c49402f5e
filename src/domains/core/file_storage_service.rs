use async_trait::async_trait;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::fs; // Use tokio::fs for async file operations

#[derive(Debug, Error)]
pub enum FileStorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("File not found: {0}")]
    NotFound(String),
    #[error("Permission denied: {0}")]
    PermissionDenied(String),
    #[error("Invalid path component: {0}")]
    InvalidPathComponent(String),
    #[error("Unknown storage error: {0}")]
    Other(String),
}

pub type FileStorageResult<T> = Result<T, FileStorageError>;

/// Service trait for abstracting blob storage operations.
///
/// Paths are relative, `/`-separated, and interpreted against the disk root.
#[async_trait]
pub trait FileStorage: Send + Sync {
    /// Whether a file exists at the given relative path.
    async fn exists(&self, relative_path: &str) -> FileStorageResult<bool>;

    /// Whether a directory exists at the given relative path.
    async fn directory_exists(&self, relative_path: &str) -> FileStorageResult<bool>;

    /// Read a whole file into memory.
    async fn get(&self, relative_path: &str) -> FileStorageResult<Vec<u8>>;

    /// Write a file, creating parent directories as needed.
    async fn put(&self, relative_path: &str, data: Vec<u8>) -> FileStorageResult<()>;

    /// Delete a file. Deleting a missing file is a success.
    async fn delete(&self, relative_path: &str) -> FileStorageResult<()>;

    /// Recursively delete a directory. Deleting a missing directory is a success.
    async fn delete_directory(&self, relative_path: &str) -> FileStorageResult<()>;

    /// List the file names (not paths) directly inside a directory, sorted.
    async fn list(&self, relative_path: &str) -> FileStorageResult<Vec<String>>;
}

// --- Local File Storage Implementation ---

pub struct LocalFileStorage {
    base_path: PathBuf,
}

impl LocalFileStorage {
    /// Creates a new LocalFileStorage rooted at `base_path_str`.
    /// Ensures the base directory exists.
    pub fn new(base_path_str: impl AsRef<Path>) -> io::Result<Self> {
        let base_path = base_path_str.as_ref().to_path_buf();
        std::fs::create_dir_all(&base_path)?;
        Ok(Self { base_path })
    }

    /// Resolve a relative path against the base, dropping unsafe components.
    fn absolute_path(&self, relative_path: &str) -> FileStorageResult<PathBuf> {
        let mut abs_path = self.base_path.clone();
        for component in Path::new(relative_path).components() {
            match component {
                std::path::Component::Normal(comp) => {
                    let s = comp
                        .to_str()
                        .ok_or_else(|| FileStorageError::InvalidPathComponent(relative_path.to_string()))?;
                    if s.is_empty() || s == "." || s == ".." {
                        return Err(FileStorageError::InvalidPathComponent(s.to_string()));
                    }
                    abs_path.push(s);
                }
                std::path::Component::CurDir => {}
                _ => {
                    return Err(FileStorageError::InvalidPathComponent(relative_path.to_string()));
                }
            }
        }
        if !abs_path.starts_with(&self.base_path) {
            return Err(FileStorageError::PermissionDenied(
                "Attempt to access outside base path".to_string(),
            ));
        }
        Ok(abs_path)
    }
}

#[async_trait]
impl FileStorage for LocalFileStorage {
    async fn exists(&self, relative_path: &str) -> FileStorageResult<bool> {
        let path = self.absolute_path(relative_path)?;
        match fs::metadata(&path).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(FileStorageError::Io(e)),
        }
    }

    async fn directory_exists(&self, relative_path: &str) -> FileStorageResult<bool> {
        let path = self.absolute_path(relative_path)?;
        match fs::metadata(&path).await {
            Ok(meta) => Ok(meta.is_dir()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(FileStorageError::Io(e)),
        }
    }

    async fn get(&self, relative_path: &str) -> FileStorageResult<Vec<u8>> {
        let path = self.absolute_path(relative_path)?;
        match fs::read(&path).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(FileStorageError::NotFound(relative_path.to_string()))
            }
            Err(e) => Err(FileStorageError::Io(e)),
        }
    }

    async fn put(&self, relative_path: &str, data: Vec<u8>) -> FileStorageResult<()> {
        let path = self.absolute_path(relative_path)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&path, data).await?;
        Ok(())
    }

    async fn delete(&self, relative_path: &str) -> FileStorageResult<()> {
        let path = self.absolute_path(relative_path)?;
        match fs::remove_file(&path).await {
            Ok(_) => Ok(()),
            // Consider it success if the file is already gone
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(FileStorageError::Io(e)),
        }
    }

    async fn delete_directory(&self, relative_path: &str) -> FileStorageResult<()> {
        let path = self.absolute_path(relative_path)?;
        match fs::remove_dir_all(&path).await {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(FileStorageError::Io(e)),
        }
    }

    async fn list(&self, relative_path: &str) -> FileStorageResult<Vec<String>> {
        let path = self.absolute_path(relative_path)?;
        let mut entries = match fs::read_dir(&path).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(FileStorageError::NotFound(relative_path.to_string()))
            }
            Err(e) => return Err(FileStorageError::Io(e)),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                if let Some(name) = entry.file_name().to_str() {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }
}

/// Registry of named storage disks, the seam the host wires backends into.
#[derive(Default)]
pub struct StorageManager {
    disks: HashMap<String, Arc<dyn FileStorage>>,
}

impl StorageManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, name: impl Into<String>, disk: Arc<dyn FileStorage>) -> Self {
        self.disks.insert(name.into(), disk);
        self
    }

    pub fn disk(&self, name: &str) -> Option<Arc<dyn FileStorage>> {
        self.disks.get(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn storage() -> (TempDir, LocalFileStorage) {
        let dir = TempDir::new().unwrap();
        let storage = LocalFileStorage::new(dir.path()).unwrap();
        (dir, storage)
    }

    #[tokio::test]
    async fn test_put_get_round_trip() {
        let (_dir, storage) = storage().await;

        storage.put("exports/abc/headers.csv", b"ID,Name\n".to_vec()).await.unwrap();

        assert!(storage.exists("exports/abc/headers.csv").await.unwrap());
        assert!(storage.directory_exists("exports/abc").await.unwrap());
        let data = storage.get("exports/abc/headers.csv").await.unwrap();
        assert_eq!(data, b"ID,Name\n");
    }

    #[tokio::test]
    async fn test_get_missing_file_is_not_found() {
        let (_dir, storage) = storage().await;

        match storage.get("exports/none.csv").await {
            Err(FileStorageError::NotFound(path)) => assert_eq!(path, "exports/none.csv"),
            other => panic!("expected NotFound, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_list_returns_sorted_file_names() {
        let (_dir, storage) = storage().await;

        storage.put("exports/abc/0000000000000002.csv", b"b".to_vec()).await.unwrap();
        storage.put("exports/abc/headers.csv", b"h".to_vec()).await.unwrap();
        storage.put("exports/abc/0000000000000001.csv", b"a".to_vec()).await.unwrap();

        let names = storage.list("exports/abc").await.unwrap();
        assert_eq!(
            names,
            vec!["0000000000000001.csv", "0000000000000002.csv", "headers.csv"]
        );
    }

    #[tokio::test]
    async fn test_delete_directory_is_idempotent() {
        let (_dir, storage) = storage().await;

        storage.put("exports/abc/headers.csv", b"h".to_vec()).await.unwrap();
        storage.delete_directory("exports/abc").await.unwrap();
        assert!(!storage.directory_exists("exports/abc").await.unwrap());

        // Second delete of a missing directory succeeds.
        storage.delete_directory("exports/abc").await.unwrap();
    }

    #[tokio::test]
    async fn test_rejects_parent_traversal() {
        let (_dir, storage) = storage().await;

        assert!(storage.get("../outside.csv").await.is_err());
    }
}
