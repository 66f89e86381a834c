use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use anyhow::anyhow;
use async_trait::async_trait;
use bytes::Bytes;
use uuid::Uuid;

use crate::storage::{DatastoreKind, StorageBackend};
use crate::utils::{content_hash, sharded_location};

pub struct FileSystemBackend {
    directory: PathBuf,
}

impl FileSystemBackend {
    pub fn new(dir: PathBuf) -> Self {
        Self { directory: dir }
    }

    /// Resolves a location to a path inside the datastore directory.
    fn format_path(&self, location: &str) -> anyhow::Result<PathBuf> {
        let relative = Path::new(location);
        let is_contained = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)));

        if location.is_empty() || !is_contained {
            return Err(anyhow!("Invalid datastore location {:?}", location));
        }

        Ok(self.directory.join(relative))
    }
}

#[async_trait]
impl StorageBackend for FileSystemBackend {
    fn kind(&self) -> DatastoreKind {
        DatastoreKind::File
    }

    async fn store(&self, data: Bytes, _content_type: &str) -> anyhow::Result<String> {
        let location = sharded_location(&content_hash(&data));
        let path = self.format_path(&location)?;

        if self.exists(&location).await? {
            debug!("Content already stored @ {:?}", &path);
            return Ok(location);
        }

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let temp_path = path.with_extension(format!("{}.tmp", Uuid::new_v4()));
        debug!("Storing content @ {:?}", &path);
        tokio::fs::write(&temp_path, &data).await?;
        if let Err(e) = tokio::fs::rename(&temp_path, &path).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(e.into());
        }

        Ok(location)
    }

    async fn fetch(&self, location: &str) -> anyhow::Result<Option<Bytes>> {
        let path = self.format_path(location)?;

        debug!("Retrieving content @ {:?}", &path);
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(ref e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(other) => Err(other.into()),
        }
    }

    async fn exists(&self, location: &str) -> anyhow::Result<bool> {
        let path = self.format_path(location)?;

        match tokio::fs::metadata(&path).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(ref e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(other) => Err(other.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_store_and_fetch() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let backend = FileSystemBackend::new(dir.path().to_path_buf());

        let location = backend.store(Bytes::from_static(b"hello"), "text/plain").await?;
        assert!(backend.exists(&location).await?);

        let data = backend.fetch(&location).await?;
        assert_eq!(data.as_deref(), Some(&b"hello"[..]));
        Ok(())
    }

    #[tokio::test]
    async fn test_identical_content_shares_location() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let backend = FileSystemBackend::new(dir.path().to_path_buf());

        let first = backend.store(Bytes::from_static(b"same"), "text/plain").await?;
        let second = backend.store(Bytes::from_static(b"same"), "text/plain").await?;
        let other = backend.store(Bytes::from_static(b"different"), "text/plain").await?;

        assert_eq!(first, second);
        assert_ne!(first, other);
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_content() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let backend = FileSystemBackend::new(dir.path().to_path_buf());

        assert!(backend.fetch("ab/cd/abcdef").await?.is_none());
        assert!(!backend.exists("ab/cd/abcdef").await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_rejects_locations_outside_directory() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let backend = FileSystemBackend::new(dir.path().to_path_buf());

        assert!(backend.fetch("../secret").await.is_err());
        assert!(backend.fetch("/etc/passwd").await.is_err());
        assert!(backend.exists("").await.is_err());
        Ok(())
    }
}
