use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::{unique_object_name, ByteReader, FileStore, StoreError};

/// Locator prefix for objects managed by the local store.
const LOCATOR_PREFIX: &str = "/uploads/";

/// Disk-backed file store. Objects live flat under `base_dir`; locators are
/// `/uploads/<millis>-<filename>` so they double as URL paths when served by
/// a collaborator.
pub struct LocalFileStore {
    base_dir: PathBuf,
    base_url: String,
}

impl LocalFileStore {
    /// Create a store rooted at `base_dir`, creating the directory if needed.
    pub fn new(base_dir: impl Into<PathBuf>, base_url: impl Into<String>) -> Result<Self, StoreError> {
        let base_dir = base_dir.into();
        std::fs::create_dir_all(&base_dir)?;

        Ok(Self {
            base_dir,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn resolve(&self, locator: &str) -> Result<PathBuf, StoreError> {
        let name = locator
            .strip_prefix(LOCATOR_PREFIX)
            .ok_or_else(|| StoreError::NotFound(locator.to_string()))?;

        // Locators are issued by this store and never contain separators,
        // but a corrupted row must not escape the base directory.
        if name.is_empty() || name.contains('/') || name.contains('\\') {
            return Err(StoreError::NotFound(locator.to_string()));
        }

        Ok(self.base_dir.join(name))
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }
}

#[async_trait]
impl FileStore for LocalFileStore {
    async fn save(&self, filename: &str, bytes: &[u8]) -> Result<String, StoreError> {
        let object_name = unique_object_name(filename);
        let path = self.base_dir.join(&object_name);

        tokio::fs::create_dir_all(&self.base_dir).await?;
        tokio::fs::write(&path, bytes).await?;

        debug!("Saved {} bytes to {}", bytes.len(), path.display());
        Ok(format!("{LOCATOR_PREFIX}{object_name}"))
    }

    async fn open_read_stream(&self, locator: &str) -> Result<ByteReader, StoreError> {
        let path = self.resolve(locator)?;

        match tokio::fs::File::open(&path).await {
            Ok(file) => Ok(Box::new(file)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(locator.to_string()))
            }
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    fn url_for(&self, locator: &str) -> String {
        format!("{}{}", self.base_url, locator)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_save_and_read_back_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let store = LocalFileStore::new(temp_dir.path(), "http://localhost:3000").unwrap();

        let bytes: Vec<u8> = (0..=255).cycle().take(2048).map(|b| b as u8).collect();
        let locator = store.save("call.mp3", &bytes).await.unwrap();
        assert!(locator.starts_with("/uploads/"));

        let mut reader = store.open_read_stream(&locator).await.unwrap();
        let mut drained = Vec::new();
        reader.read_to_end(&mut drained).await.unwrap();
        assert_eq!(drained, bytes);
    }

    #[tokio::test]
    async fn test_missing_locator_is_not_found() {
        let temp_dir = TempDir::new().unwrap();
        let store = LocalFileStore::new(temp_dir.path(), "http://localhost:3000").unwrap();

        let err = store
            .open_read_stream("/uploads/1700000000000-gone.mp3")
            .await
            .map(|_| ())
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_foreign_locator_is_not_found() {
        let temp_dir = TempDir::new().unwrap();
        let store = LocalFileStore::new(temp_dir.path(), "http://localhost:3000").unwrap();

        let err = store
            .open_read_stream("s3-bucket/key.mp3")
            .await
            .map(|_| ())
            .unwrap_err();
        assert!(err.is_not_found());

        let err = store
            .open_read_stream("/uploads/../escape.mp3")
            .await
            .map(|_| ())
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_repeated_filenames_get_distinct_locators() {
        let temp_dir = TempDir::new().unwrap();
        let store = LocalFileStore::new(temp_dir.path(), "http://localhost:3000").unwrap();

        let first = store.save("same.mp3", b"one").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        let second = store.save("same.mp3", b"two").await.unwrap();

        assert_ne!(first, second);
    }

    #[test]
    fn test_url_for() {
        let temp_dir = TempDir::new().unwrap();
        let store = LocalFileStore::new(temp_dir.path(), "http://localhost:3000/").unwrap();

        assert_eq!(
            store.url_for("/uploads/123-a.mp3"),
            "http://localhost:3000/uploads/123-a.mp3"
        );
    }
}
