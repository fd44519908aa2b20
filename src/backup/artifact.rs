// pgbackd/src/backup/artifact.rs
use std::io::Write;
use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Utc};
use flate2::Compression;
use flate2::write::{GzDecoder, GzEncoder};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;
use uuid::Uuid;

use crate::errors::{AppError, Result};
use crate::model::BackupConfig;
use crate::storage::DestinationCatalog;

const CHUNK_SIZE: usize = 64 * 1024;

/// Where a run's compressed dump lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactLocation {
    Local(PathBuf),
    Remote { destination_id: Uuid, key: String },
}

impl ArtifactLocation {
    /// Picks the location for a new run of `config`.
    pub fn plan(
        config: &BackupConfig,
        backups_root: &Path,
        started_at: DateTime<Utc>,
        execution_id: Uuid,
    ) -> Result<Self> {
        let relative = format!(
            "{}/dump-{}-{}.sql.gz",
            started_at.format("%Y/%m/%d"),
            started_at.format("%Y%m%d-%H%M%S"),
            execution_id
        );
        let dest_dir = clean_dest_dir(&config.dest_dir)?;
        let relative = if dest_dir.is_empty() {
            relative
        } else {
            format!("{dest_dir}/{relative}")
        };

        match (config.is_local, config.destination_id) {
            (true, _) => Ok(ArtifactLocation::Local(backups_root.join(relative))),
            (false, Some(destination_id)) => Ok(ArtifactLocation::Remote {
                destination_id,
                key: relative,
            }),
            (false, None) => Err(AppError::InvalidInput(format!(
                "backup {} is remote but has no destination",
                config.id
            ))),
        }
    }

    /// Rebuilds the location from an execution's recorded path.
    pub fn for_execution(config: &BackupConfig, path: &str) -> Result<Self> {
        if path.trim().is_empty() {
            return Err(AppError::InvalidInput("execution has an empty artifact path".into()));
        }
        match (config.is_local, config.destination_id) {
            (true, _) => Ok(ArtifactLocation::Local(PathBuf::from(path))),
            (false, Some(destination_id)) => Ok(ArtifactLocation::Remote {
                destination_id,
                key: path.to_string(),
            }),
            (false, None) => Err(AppError::InvalidInput(format!(
                "backup {} is remote but has no destination",
                config.id
            ))),
        }
    }

    /// The value recorded in the execution's `path` column.
    pub fn stored_path(&self) -> String {
        match self {
            ArtifactLocation::Local(path) => path.to_string_lossy().into_owned(),
            ArtifactLocation::Remote { key, .. } => key.clone(),
        }
    }

    /// Deletes the artifact. A missing artifact counts as removed.
    pub async fn remove(&self, destinations: &DestinationCatalog) -> Result<()> {
        match self {
            ArtifactLocation::Local(path) => match tokio::fs::remove_file(path).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(AppError::storage(format!("failed to remove {}", path.display()), e)),
            },
            ArtifactLocation::Remote {
                destination_id,
                key,
            } => {
                let storage = destinations.storage_for(*destination_id).await?;
                storage.delete(key).await
            }
        }
    }
}

fn clean_dest_dir(dest_dir: &str) -> Result<String> {
    let trimmed = dest_dir.trim().trim_matches('/');
    let escapes = Path::new(trimmed)
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if escapes {
        return Err(AppError::InvalidInput(format!(
            "destination directory '{dest_dir}' must stay inside the backup root"
        )));
    }
    Ok(trimmed.to_string())
}

/// Which side of a copy broke.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("read failed: {0}")]
    Read(std::io::Error),
    #[error("write failed: {0}")]
    Write(std::io::Error),
}

/// Gzips everything `reader` yields into `writer`. Returns compressed bytes written.
///
/// The reader is consumed so its pipe closes as soon as streaming stops.
pub async fn compress_stream<R, W>(mut reader: R, writer: &mut W) -> std::result::Result<u64, StreamError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut encoder = GzEncoder::new(Vec::with_capacity(CHUNK_SIZE), Compression::default());
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut written = 0u64;

    loop {
        let n = reader.read(&mut buf).await.map_err(StreamError::Read)?;
        if n == 0 {
            break;
        }
        encoder.write_all(&buf[..n]).map_err(StreamError::Write)?;
        let pending = encoder.get_mut();
        if pending.len() >= CHUNK_SIZE {
            writer.write_all(pending).await.map_err(StreamError::Write)?;
            written += pending.len() as u64;
            pending.clear();
        }
    }

    let rest = encoder.finish().map_err(StreamError::Write)?;
    writer.write_all(&rest).await.map_err(StreamError::Write)?;
    writer.flush().await.map_err(StreamError::Write)?;
    written += rest.len() as u64;
    debug!(written, "compressed stream finished");
    Ok(written)
}

/// Gunzips `reader` into `writer`. Corrupt input is reported as a read failure.
pub async fn decompress_stream<R, W>(mut reader: R, mut writer: W) -> std::result::Result<u64, StreamError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut decoder = GzDecoder::new(Vec::with_capacity(CHUNK_SIZE));
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut written = 0u64;

    loop {
        let n = reader.read(&mut buf).await.map_err(StreamError::Read)?;
        if n == 0 {
            break;
        }
        decoder.write_all(&buf[..n]).map_err(StreamError::Read)?;
        let pending = decoder.get_mut();
        if !pending.is_empty() {
            writer.write_all(pending).await.map_err(StreamError::Write)?;
            written += pending.len() as u64;
            pending.clear();
        }
    }

    let rest = decoder.finish().map_err(StreamError::Read)?;
    writer.write_all(&rest).await.map_err(StreamError::Write)?;
    written += rest.len() as u64;
    writer.shutdown().await.map_err(StreamError::Write)?;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NewBackupConfig;
    use chrono::TimeZone;

    fn config(is_local: bool, dest_dir: &str) -> BackupConfig {
        NewBackupConfig {
            database_id: Uuid::new_v4(),
            destination_id: (!is_local).then(Uuid::new_v4),
            is_local,
            name: "nightly".into(),
            dest_dir: dest_dir.into(),
            ..Default::default()
        }
        .into_config(Uuid::new_v4(), Utc::now())
    }

    #[test]
    fn locations_are_dated_and_named_after_the_execution() {
        let started = Utc.with_ymd_and_hms(2024, 5, 1, 2, 30, 5).unwrap();
        let execution_id = Uuid::nil();

        let local = ArtifactLocation::plan(&config(true, "/orders/"), Path::new("/var/backups"), started, execution_id)
            .expect("local plan");
        assert_eq!(
            local,
            ArtifactLocation::Local(PathBuf::from(format!(
                "/var/backups/orders/2024/05/01/dump-20240501-023005-{execution_id}.sql.gz"
            )))
        );

        let remote_config = config(false, "");
        let remote = ArtifactLocation::plan(&remote_config, Path::new("/var/backups"), started, execution_id)
            .expect("remote plan");
        let ArtifactLocation::Remote { key, destination_id } = &remote else {
            panic!("expected a remote location");
        };
        assert_eq!(key, &format!("2024/05/01/dump-20240501-023005-{execution_id}.sql.gz"));
        assert_eq!(Some(*destination_id), remote_config.destination_id);
        assert_eq!(
            ArtifactLocation::for_execution(&remote_config, &remote.stored_path()).expect("rebuild"),
            remote
        );
    }

    #[test]
    fn dest_dir_cannot_escape_the_root() {
        let result = ArtifactLocation::plan(&config(true, "../etc"), Path::new("/var/backups"), Utc::now(), Uuid::nil());
        assert!(matches!(result, Err(AppError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn streams_survive_compression() {
        let sql = "CREATE TABLE orders (id int);\n".repeat(10_000);
        let mut compressed = Vec::new();
        let written = compress_stream(sql.as_bytes(), &mut compressed).await.expect("compress");
        assert_eq!(written as usize, compressed.len());
        assert!(compressed.len() < sql.len());

        let mut restored = Vec::new();
        let size = decompress_stream(compressed.as_slice(), &mut restored).await.expect("decompress");
        assert_eq!(size as usize, sql.len());
        assert_eq!(restored, sql.as_bytes());
    }

    #[tokio::test]
    async fn garbage_is_a_read_failure() {
        let mut sink = Vec::new();
        let err = decompress_stream(&b"definitely not gzip"[..], &mut sink)
            .await
            .expect_err("corrupt input");
        assert!(matches!(err, StreamError::Read(_)));
    }
}
