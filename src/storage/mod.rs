pub mod catalog;
pub mod s3;

use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};

use crate::errors::{AppError, Result};

pub use catalog::{DestinationCatalog, ResolvedDestination, S3Connector, StorageConnector};
pub use s3::S3Storage;

/// Object storage addressed by keys such as `nightly/2024/05/01/dump-....sql.gz`.
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Uploads a local file; returns the number of bytes stored.
    async fn put(&self, key: &str, source: &Path) -> Result<u64>;

    /// Downloads an object into a local file; returns the number of bytes written.
    async fn get(&self, key: &str, destination: &Path) -> Result<u64>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Verifies the storage is reachable with the configured credentials.
    async fn check(&self) -> Result<()>;
}

/// Keys mapped onto a directory tree. Backs bucket-less setups and tests.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key.trim_start_matches('/'));
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if key.trim().is_empty() || escapes {
            return Err(AppError::Storage(format!("invalid object key '{key}'")));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl ObjectStorage for LocalStorage {
    async fn put(&self, key: &str, source: &Path) -> Result<u64> {
        let target = self.resolve(key)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| AppError::storage(format!("failed to create {}", parent.display()), e))?;
        }
        tokio::fs::copy(source, &target)
            .await
            .map_err(|e| AppError::storage(format!("failed to store object {key}"), e))
    }

    async fn get(&self, key: &str, destination: &Path) -> Result<u64> {
        let source = self.resolve(key)?;
        tokio::fs::copy(&source, destination)
            .await
            .map_err(|e| AppError::storage(format!("failed to read object {key}"), e))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let target = self.resolve(key)?;
        match tokio::fs::remove_file(&target).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(AppError::storage(format!("failed to delete object {key}"), e)),
        }
    }

    async fn check(&self) -> Result<()> {
        let metadata = tokio::fs::metadata(&self.root).await.map_err(|e| {
            AppError::storage(format!("storage root {} is not accessible", self.root.display()), e)
        })?;
        if metadata.is_dir() {
            Ok(())
        } else {
            Err(AppError::Storage(format!(
                "storage root {} is not a directory",
                self.root.display()
            )))
        }
    }
}
