// pgbackd/src/storage/catalog.rs
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use super::{ObjectStorage, S3Storage};
use crate::errors::Result;
use crate::model::{Destination, NewDestination};
use crate::store::Store;
use crate::utils::crypto::CredentialCipher;

/// A destination with its keys decrypted. Lives only for the duration of a transfer.
#[derive(Clone)]
pub struct ResolvedDestination {
    pub id: Uuid,
    pub name: String,
    pub bucket_name: String,
    pub region: String,
    pub endpoint: String,
    pub access_key: String,
    pub secret_key: String,
}

impl fmt::Debug for ResolvedDestination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedDestination")
            .field("id", &self.id)
            .field("bucket_name", &self.bucket_name)
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

/// Opens an object storage client for a resolved destination.
#[async_trait]
pub trait StorageConnector: Send + Sync {
    async fn connect(&self, destination: &ResolvedDestination) -> Result<Arc<dyn ObjectStorage>>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct S3Connector;

#[async_trait]
impl StorageConnector for S3Connector {
    async fn connect(&self, destination: &ResolvedDestination) -> Result<Arc<dyn ObjectStorage>> {
        Ok(Arc::new(S3Storage::connect(destination).await))
    }
}

/// Destination lookups with the process-wide cipher applied.
pub struct DestinationCatalog {
    store: Arc<dyn Store>,
    cipher: Arc<CredentialCipher>,
    connector: Arc<dyn StorageConnector>,
}

impl DestinationCatalog {
    pub fn new(
        store: Arc<dyn Store>,
        cipher: Arc<CredentialCipher>,
        connector: Arc<dyn StorageConnector>,
    ) -> Self {
        Self {
            store,
            cipher,
            connector,
        }
    }

    /// Encrypts the plaintext keys and stores the destination.
    pub async fn create(&self, plain: NewDestination) -> Result<Destination> {
        let sealed = NewDestination {
            access_key: self.cipher.encrypt(&plain.access_key)?,
            secret_key: self.cipher.encrypt(&plain.secret_key)?,
            ..plain
        };
        self.store.create_destination(sealed).await
    }

    pub async fn resolve(&self, id: Uuid) -> Result<ResolvedDestination> {
        let destination = self.store.get_destination(id).await?;
        Ok(ResolvedDestination {
            access_key: self.cipher.decrypt(&destination.access_key)?,
            secret_key: self.cipher.decrypt(&destination.secret_key)?,
            id: destination.id,
            name: destination.name,
            bucket_name: destination.bucket_name,
            region: destination.region,
            endpoint: destination.endpoint,
        })
    }

    pub async fn storage_for(&self, id: Uuid) -> Result<Arc<dyn ObjectStorage>> {
        let resolved = self.resolve(id).await?;
        self.connector.connect(&resolved).await
    }

    /// Checks the bucket is reachable and records the outcome on the destination.
    pub async fn test(&self, id: Uuid) -> Result<Destination> {
        let outcome = match self.storage_for(id).await {
            Ok(storage) => storage.check().await,
            Err(e) => Err(e),
        };

        match outcome {
            Ok(()) => {
                info!(destination_id = %id, "destination test succeeded");
                self.store.record_destination_test(id, true, None).await
            }
            Err(e) => {
                warn!(destination_id = %id, error = %e, "destination test failed");
                self.store
                    .record_destination_test(id, false, Some(e.to_string()))
                    .await
            }
        }
    }
}
