// pgbackd/src/storage/s3.rs
use async_trait::async_trait;
use aws_sdk_s3 as s3;
use s3::config::Region;
use s3::primitives::ByteStream;
use std::path::Path;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use super::ObjectStorage;
use super::catalog::ResolvedDestination;
use crate::errors::{AppError, Result};

/// An S3-compatible bucket (AWS, DigitalOcean Spaces, MinIO, ...).
#[derive(Debug, Clone)]
pub struct S3Storage {
    client: s3::Client,
    bucket: String,
}

impl S3Storage {
    /// Builds a client from decrypted credentials. Nothing is sent until first use.
    pub async fn connect(destination: &ResolvedDestination) -> Self {
        let sdk_config = aws_config::defaults(s3::config::BehaviorVersion::latest())
            .endpoint_url(&destination.endpoint)
            .region(Region::new(destination.region.clone()))
            .credentials_provider(s3::config::Credentials::new(
                &destination.access_key,
                &destination.secret_key,
                None,     // session_token
                None,     // expiry
                "Static", // provider_name
            ))
            .load()
            .await;

        let config = s3::config::Builder::from(&sdk_config)
            .force_path_style(true)
            .build();

        Self {
            client: s3::Client::from_conf(config),
            bucket: destination.bucket_name.clone(),
        }
    }
}

#[async_trait]
impl ObjectStorage for S3Storage {
    async fn put(&self, key: &str, source: &Path) -> Result<u64> {
        let size = tokio::fs::metadata(source)
            .await
            .map_err(|e| AppError::storage(format!("cannot stat upload source {}", source.display()), e))?
            .len();
        let body = ByteStream::from_path(source)
            .await
            .map_err(|e| AppError::storage(format!("cannot read upload source {}", source.display()), e))?;

        debug!(bucket = %self.bucket, key, size, "uploading object");
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(body)
            .send()
            .await
            .map_err(|e| {
                AppError::storage(
                    format!("failed to upload s3://{}/{}", self.bucket, key),
                    s3::error::DisplayErrorContext(e),
                )
            })?;

        info!(bucket = %self.bucket, key, size, "object uploaded");
        Ok(size)
    }

    async fn get(&self, key: &str, destination: &Path) -> Result<u64> {
        let mut object = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                AppError::storage(
                    format!("failed to get s3://{}/{}", self.bucket, key),
                    s3::error::DisplayErrorContext(e),
                )
            })?;

        let mut output = File::create(destination)
            .await
            .map_err(|e| AppError::storage(format!("failed to create {}", destination.display()), e))?;

        let mut downloaded = 0u64;
        while let Some(chunk) = object
            .body
            .try_next()
            .await
            .map_err(|e| AppError::storage(format!("download of s3://{}/{} broke off", self.bucket, key), e))?
        {
            output
                .write_all(&chunk)
                .await
                .map_err(|e| AppError::storage(format!("failed to write {}", destination.display()), e))?;
            downloaded += chunk.len() as u64;
        }
        output
            .flush()
            .await
            .map_err(|e| AppError::storage(format!("failed to flush {}", destination.display()), e))?;

        debug!(bucket = %self.bucket, key, downloaded, "object downloaded");
        Ok(downloaded)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                AppError::storage(
                    format!("failed to delete s3://{}/{}", self.bucket, key),
                    s3::error::DisplayErrorContext(e),
                )
            })?;
        Ok(())
    }

    // HeadBucket only needs access to the target bucket, unlike ListBuckets.
    async fn check(&self) -> Result<()> {
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(|e| {
                AppError::storage(
                    format!("bucket {} is not accessible", self.bucket),
                    s3::error::DisplayErrorContext(e),
                )
            })?;
        Ok(())
    }
}
