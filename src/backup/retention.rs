// pgbackd/src/backup/retention.rs
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use super::artifact::ArtifactLocation;
use crate::errors::Result;
use crate::model::{BackupConfig, ExecutionStatus};
use crate::storage::DestinationCatalog;
use crate::store::Store;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetentionReport {
    /// Executions moved to `deleted`.
    pub deleted: usize,
    /// Artifacts that could not be removed. Their rows are deleted anyway.
    pub artifact_failures: usize,
}

impl RetentionReport {
    fn absorb(&mut self, other: RetentionReport) {
        self.deleted += other.deleted;
        self.artifact_failures += other.artifact_failures;
    }
}

/// Soft-deletes executions that fell out of a configuration's retention window.
#[derive(Clone)]
pub struct RetentionEnforcer {
    store: Arc<dyn Store>,
    destinations: Arc<DestinationCatalog>,
}

impl RetentionEnforcer {
    pub fn new(store: Arc<dyn Store>, destinations: Arc<DestinationCatalog>) -> Self {
        Self {
            store,
            destinations,
        }
    }

    /// Prunes `config`'s executions that started more than `retention_days` before `now`.
    ///
    /// `keep` is never touched. A retention of zero days keeps everything.
    pub async fn enforce(
        &self,
        config: &BackupConfig,
        keep: Uuid,
        now: DateTime<Utc>,
    ) -> Result<RetentionReport> {
        let mut report = RetentionReport::default();
        if config.retention_days <= 0 {
            return Ok(report);
        }

        let cutoff = now - Duration::days(i64::from(config.retention_days));
        let expired = self
            .store
            .list_expired_executions(config.id, cutoff, keep)
            .await?;

        for execution in expired {
            if let Some(path) = execution.path.as_deref() {
                let removed = match ArtifactLocation::for_execution(config, path) {
                    Ok(location) => location.remove(&self.destinations).await,
                    Err(e) => Err(e),
                };
                if let Err(e) = removed {
                    warn!(
                        backup_id = %config.id,
                        execution_id = %execution.id,
                        error = %e,
                        "could not remove expired artifact"
                    );
                    report.artifact_failures += 1;
                }
            }

            match self.store.soft_delete_execution(execution.id).await {
                Ok(_) => report.deleted += 1,
                Err(e) => warn!(
                    backup_id = %config.id,
                    execution_id = %execution.id,
                    error = %e,
                    "could not soft-delete expired execution"
                ),
            }
        }

        if report.deleted > 0 {
            info!(
                backup_id = %config.id,
                deleted = report.deleted,
                artifact_failures = report.artifact_failures,
                retention_days = config.retention_days,
                "retention enforced"
            );
        }
        Ok(report)
    }

    /// Runs [`enforce`](Self::enforce) for every configuration, keeping each one's
    /// newest successful execution.
    pub async fn enforce_all(&self, now: DateTime<Utc>) -> Result<RetentionReport> {
        let mut total = RetentionReport::default();
        for config in self.store.list_backups().await? {
            if config.retention_days <= 0 {
                continue;
            }
            let keep = self
                .store
                .list_backup_executions(config.id)
                .await?
                .into_iter()
                .find(|e| e.status == ExecutionStatus::Success)
                .map(|e| e.id)
                .unwrap_or_else(Uuid::nil);

            match self.enforce(&config, keep, now).await {
                Ok(report) => total.absorb(report),
                Err(e) => warn!(backup_id = %config.id, error = %e, "retention sweep failed"),
            }
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Execution, ExecutionUpdate, NewBackupConfig, NewDatabase};
    use crate::storage::catalog::tests::BrokenConnector;
    use crate::store::{Catalog, ExecutionStore, MemoryStore};
    use crate::utils::crypto::CredentialCipher;

    async fn setup(retention_days: i16) -> (Arc<MemoryStore>, RetentionEnforcer, BackupConfig) {
        let store = Arc::new(MemoryStore::new());
        let cipher = Arc::new(CredentialCipher::from_secret("retention").expect("cipher"));
        let destinations = Arc::new(DestinationCatalog::new(
            store.clone(),
            cipher,
            Arc::new(BrokenConnector),
        ));
        let database = store
            .create_database(NewDatabase {
                name: "orders".into(),
                pg_version: "16".into(),
                connection_string: "postgresql://db/orders".into(),
            })
            .await
            .expect("database");
        let config = store
            .create_backup(NewBackupConfig {
                database_id: database.id,
                name: "nightly".into(),
                retention_days,
                ..Default::default()
            })
            .await
            .expect("backup");
        let enforcer = RetentionEnforcer::new(store.clone(), destinations);
        (store, enforcer, config)
    }

    async fn finished(store: &MemoryStore, backup_id: Uuid, days_ago: i64, path: Option<String>) -> Execution {
        let started = Utc::now() - Duration::days(days_ago);
        let mut execution = Execution::started(backup_id, started);
        let update = match path {
            Some(path) => ExecutionUpdate::succeeded(path, 10),
            None => ExecutionUpdate::failed("pg_dump error: boom"),
        };
        execution.apply(&update, started);
        store.insert_execution(execution.clone()).await;
        execution
    }

    #[tokio::test]
    async fn old_executions_are_deleted_with_their_files() {
        let (store, enforcer, config) = setup(7).await;
        let dir = tempfile::tempdir().expect("dir");
        let old_file = dir.path().join("old.sql.gz");
        tokio::fs::write(&old_file, b"old").await.expect("write");

        let old = finished(&store, config.id, 30, Some(old_file.to_string_lossy().into_owned())).await;
        let old_failed = finished(&store, config.id, 10, None).await;
        let recent = finished(&store, config.id, 2, Some("/nowhere/recent.sql.gz".into())).await;
        let newest = finished(&store, config.id, 0, Some("/nowhere/newest.sql.gz".into())).await;

        let report = enforcer.enforce(&config, newest.id, Utc::now()).await.expect("enforce");
        assert_eq!(report, RetentionReport { deleted: 2, artifact_failures: 0 });
        assert!(!old_file.exists());

        for id in [old.id, old_failed.id] {
            let row = store.get_execution(id).await.expect("row");
            assert_eq!(row.status, ExecutionStatus::Deleted);
            assert!(row.deleted_at.is_some());
        }
        assert_eq!(store.get_execution(recent.id).await.expect("row").status, ExecutionStatus::Success);
    }

    #[tokio::test]
    async fn zero_days_keeps_everything() {
        let (store, enforcer, config) = setup(0).await;
        let ancient = finished(&store, config.id, 3650, None).await;
        let report = enforcer.enforce(&config, Uuid::nil(), Utc::now()).await.expect("enforce");
        assert_eq!(report.deleted, 0);
        assert_eq!(store.get_execution(ancient.id).await.expect("row").status, ExecutionStatus::Failed);
    }

    #[tokio::test]
    async fn sweep_spares_the_newest_success_even_when_expired() {
        let (store, enforcer, config) = setup(1).await;
        let older = finished(&store, config.id, 20, Some("/nowhere/a.sql.gz".into())).await;
        let newest = finished(&store, config.id, 10, Some("/nowhere/b.sql.gz".into())).await;

        let report = enforcer.enforce_all(Utc::now()).await.expect("sweep");
        assert_eq!(report.deleted, 1);
        assert_eq!(store.get_execution(older.id).await.expect("row").status, ExecutionStatus::Deleted);
        assert_eq!(store.get_execution(newest.id).await.expect("row").status, ExecutionStatus::Success);
    }
}
