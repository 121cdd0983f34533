//! Durable blob storage for synthesized audio

use std::path::{Path, PathBuf};

use crate::{Error, Result};

/// Byte blobs addressed by key
///
/// Storage may be unavailable; callers fall back to in-memory audio when a write fails.
pub trait BlobStore: Send + Sync {
    /// Persist `bytes` under `key` and return the path it can be played from
    ///
    /// # Errors
    ///
    /// Returns error if the blob cannot be written
    fn write(&self, key: &str, bytes: &[u8]) -> Result<PathBuf>;

    /// Read a blob back
    ///
    /// # Errors
    ///
    /// Returns error if the blob does not exist or cannot be read
    fn read(&self, key: &str) -> Result<Vec<u8>>;

    /// Remove a blob; missing blobs are ignored
    fn remove(&self, key: &str);
}

/// Stores blobs as files in a cache directory
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    dir: PathBuf,
}

impl FsBlobStore {
    /// Create a store rooted at `dir`, creating it if needed
    ///
    /// # Errors
    ///
    /// Returns error if the directory cannot be created
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        tracing::debug!(path = %dir.display(), "blob store ready");
        Ok(Self { dir })
    }

    /// Directory blobs are written to
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        if key.is_empty() || key.contains(['/', '\\']) || key.starts_with('.') {
            return Err(Error::Storage(format!("invalid blob key: {key:?}")));
        }
        Ok(self.dir.join(key))
    }
}

impl BlobStore for FsBlobStore {
    fn write(&self, key: &str, bytes: &[u8]) -> Result<PathBuf> {
        let path = self.path_for(key)?;
        std::fs::write(&path, bytes)
            .map_err(|e| Error::Storage(format!("write {}: {e}", path.display())))?;
        Ok(path)
    }

    fn read(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.path_for(key)?;
        Ok(std::fs::read(path)?)
    }

    fn remove(&self, key: &str) {
        let Ok(path) = self.path_for(key) else {
            return;
        };
        if let Err(e) = std::fs::remove_file(&path)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            tracing::debug!(path = %path.display(), error = %e, "failed to remove blob");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_read_remove() {
        let dir = TempDir::new().unwrap();
        let store = FsBlobStore::new(dir.path().join("tts")).unwrap();

        let path = store.write("reply.mp3", b"ID3").unwrap();
        assert!(path.exists());
        assert_eq!(store.read("reply.mp3").unwrap(), b"ID3");

        store.remove("reply.mp3");
        assert!(!path.exists());
        store.remove("reply.mp3");
    }

    #[test]
    fn test_rejects_path_traversal() {
        let dir = TempDir::new().unwrap();
        let store = FsBlobStore::new(dir.path()).unwrap();

        assert!(store.write("../escape", b"x").is_err());
        assert!(store.write("", b"x").is_err());
    }
}
