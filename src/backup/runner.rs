// pgbackd/src/backup/runner.rs
use std::any::Any;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::io::BufWriter;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::artifact::ArtifactLocation;
use super::db_dump::dump_database;
use super::retention::RetentionEnforcer;
use crate::errors::{AppError, Result};
use crate::model::{BackupConfig, Execution, ExecutionStatus, ExecutionUpdate};
use crate::notify::{Event, Notifier};
use crate::storage::DestinationCatalog;
use crate::store::Store;
use crate::utils::ToolLocator;
use crate::utils::locks::{LockGuard, LockSet};

pub const DEFAULT_MAX_RUN_DURATION: Duration = Duration::from_secs(6 * 60 * 60);

#[derive(Debug, Clone)]
pub struct RunnerSettings {
    /// Root of every local artifact.
    pub backups_root: PathBuf,
    /// Scratch space for dumps waiting to be uploaded.
    pub temp_dir: PathBuf,
    pub tools: ToolLocator,
    pub max_run_duration: Duration,
}

/// Handle to an accepted run.
#[derive(Debug)]
pub struct RunTicket {
    pub execution_id: Uuid,
    pub backup_id: Uuid,
    cancel: CancellationToken,
    done: oneshot::Receiver<Result<Execution>>,
}

impl RunTicket {
    /// Asks the run to stop. It is recorded as failed with a `cancelled:` message.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Waits for the run to finish and returns its final row.
    pub async fn wait(self) -> Result<Execution> {
        self.done
            .await
            .map_err(|_| AppError::Internal("run supervisor exited without reporting".into()))?
    }
}

/// Runs backups: one supervised task per run, at most one run per configuration.
#[derive(Clone)]
pub struct BackupRunner {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<dyn Store>,
    destinations: Arc<DestinationCatalog>,
    notifier: Arc<dyn Notifier>,
    retention: RetentionEnforcer,
    locks: LockSet,
    settings: RunnerSettings,
}

impl BackupRunner {
    pub fn new(
        store: Arc<dyn Store>,
        destinations: Arc<DestinationCatalog>,
        notifier: Arc<dyn Notifier>,
        settings: RunnerSettings,
    ) -> Self {
        let retention = RetentionEnforcer::new(store.clone(), destinations.clone());
        Self {
            inner: Arc::new(Inner {
                store,
                destinations,
                notifier,
                retention,
                locks: LockSet::new(),
                settings,
            }),
        }
    }

    pub fn retention(&self) -> &RetentionEnforcer {
        &self.inner.retention
    }

    pub fn is_running(&self, backup_id: Uuid) -> bool {
        self.inner.locks.is_held(backup_id)
    }

    /// Accepts a run for `backup_id` and returns once its execution row exists.
    ///
    /// Fails with `AlreadyRunning` when the configuration has a run in flight.
    pub async fn start(&self, backup_id: Uuid) -> Result<RunTicket> {
        let config = self.inner.store.get_backup(backup_id).await?;
        let guard = self
            .inner
            .locks
            .try_acquire(backup_id)
            .ok_or(AppError::AlreadyRunning(backup_id))?;
        let execution = self.inner.store.create_execution(backup_id).await?;

        info!(%backup_id, execution_id = %execution.id, backup = %config.name, "backup run accepted");

        let cancel = CancellationToken::new();
        let (tx, rx) = oneshot::channel();
        let ticket = RunTicket {
            execution_id: execution.id,
            backup_id,
            cancel: cancel.clone(),
            done: rx,
        };

        tokio::spawn(self.clone().supervise(config, execution, guard, cancel, tx));
        Ok(ticket)
    }

    /// Owns the run lock for the life of the run and always finalizes the row.
    async fn supervise(
        self,
        config: BackupConfig,
        execution: Execution,
        guard: LockGuard,
        cancel: CancellationToken,
        tx: oneshot::Sender<Result<Execution>>,
    ) {
        let settings = &self.inner.settings;
        let outcome = match ArtifactLocation::plan(
            &config,
            &settings.backups_root,
            execution.started_at,
            execution.id,
        ) {
            Ok(location) => {
                let result = self.bounded_attempt(&config, &location, &cancel).await;
                if result.is_err() {
                    self.discard(&location, execution.id).await;
                }
                result.map(|size| (location, size))
            }
            Err(e) => Err(e),
        };

        let (update, event) = match outcome {
            Ok((location, size)) => {
                info!(backup_id = %config.id, execution_id = %execution.id, size, "backup run succeeded");
                let path = location.stored_path();
                (
                    ExecutionUpdate::succeeded(path.clone(), size),
                    Event::ExecutionSucceeded {
                        execution_id: execution.id,
                        backup_id: config.id,
                        path,
                        file_size: size,
                    },
                )
            }
            Err(e) => {
                warn!(backup_id = %config.id, execution_id = %execution.id, error = %e, "backup run failed");
                let message = e.to_string();
                (
                    ExecutionUpdate::failed(message.clone()),
                    Event::ExecutionFailed {
                        execution_id: execution.id,
                        backup_id: config.id,
                        message,
                    },
                )
            }
        };

        let finalized = self.inner.store.update_execution(execution.id, update).await;
        match &finalized {
            Ok(row) => {
                self.inner.notifier.notify(event);
                if row.status == ExecutionStatus::Success {
                    if let Err(e) = self.inner.retention.enforce(&config, row.id, Utc::now()).await {
                        warn!(backup_id = %config.id, error = %e, "retention enforcement failed");
                    }
                }
            }
            Err(e) => {
                error!(execution_id = %execution.id, error = %e, "could not finalize execution");
            }
        }

        drop(guard);
        let _ = tx.send(finalized);
    }

    /// Runs the attempt on its own task, bounded by the run timeout and the ticket's token.
    async fn bounded_attempt(
        &self,
        config: &BackupConfig,
        location: &ArtifactLocation,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let max = self.inner.settings.max_run_duration;
        let mut attempt = tokio::spawn({
            let runner = self.clone();
            let config = config.clone();
            let location = location.clone();
            async move { runner.attempt(&config, &location).await }
        });

        tokio::select! {
            joined = &mut attempt => match joined {
                Ok(result) => result,
                Err(e) if e.is_panic() => Err(AppError::Internal(format!(
                    "backup task panicked: {}",
                    panic_message(e.into_panic())
                ))),
                Err(_) => Err(AppError::Cancelled("backup task was aborted".into())),
            },
            _ = tokio::time::sleep(max) => {
                attempt.abort();
                let _ = attempt.await;
                Err(AppError::Timeout(max))
            }
            _ = cancel.cancelled() => {
                attempt.abort();
                let _ = attempt.await;
                Err(AppError::Cancelled("run cancelled by request".into()))
            }
        }
    }

    async fn attempt(&self, config: &BackupConfig, location: &ArtifactLocation) -> Result<u64> {
        let database = self.inner.store.get_database(config.database_id).await?;
        let tool = self.inner.settings.tools.pg_dump(&database.pg_version)?;

        match location {
            ArtifactLocation::Local(path) => {
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent).await.map_err(|e| {
                        AppError::storage(format!("failed to create {}", parent.display()), e)
                    })?;
                }
                let file = tokio::fs::File::create(path)
                    .await
                    .map_err(|e| AppError::storage(format!("failed to create {}", path.display()), e))?;
                let mut writer = BufWriter::new(file);
                dump_database(&tool, &database, &config.options, &mut writer).await?;
                drop(writer);

                let size = tokio::fs::metadata(path)
                    .await
                    .map_err(|e| AppError::storage(format!("failed to stat {}", path.display()), e))?
                    .len();
                Ok(size)
            }
            ArtifactLocation::Remote {
                destination_id,
                key,
            } => {
                let storage = self.inner.destinations.storage_for(*destination_id).await?;
                let temp_dir = &self.inner.settings.temp_dir;
                tokio::fs::create_dir_all(temp_dir).await.map_err(|e| {
                    AppError::storage(format!("failed to create {}", temp_dir.display()), e)
                })?;
                let staged = tempfile::Builder::new()
                    .prefix("pgbackd-")
                    .suffix(".sql.gz")
                    .tempfile_in(temp_dir)
                    .map_err(|e| AppError::storage("failed to create staging file", e))?;

                let file = tokio::fs::File::create(staged.path())
                    .await
                    .map_err(|e| AppError::storage("failed to open staging file", e))?;
                let mut writer = BufWriter::new(file);
                dump_database(&tool, &database, &config.options, &mut writer).await?;
                drop(writer);

                storage.put(key, staged.path()).await
            }
        }
    }

    async fn discard(&self, location: &ArtifactLocation, execution_id: Uuid) {
        if let Err(e) = location.remove(&self.inner.destinations).await {
            warn!(%execution_id, error = %e, "could not remove partial artifact");
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::model::{
        Database, Destination, NewBackupConfig, NewDatabase,
    };
    use crate::notify::ChannelNotifier;
    use crate::storage::catalog::tests::{BrokenConnector, DirectoryConnector, plain_destination};
    use crate::storage::StorageConnector;
    use crate::store::{Catalog, ExecutionStore, MemoryStore};
    use crate::utils::ToolCommand;
    use crate::utils::crypto::CredentialCipher;
    use tempfile::TempDir;
    use tokio::sync::mpsc::UnboundedReceiver;

    pub(crate) struct Harness {
        pub(crate) store: Arc<MemoryStore>,
        pub(crate) destinations: Arc<DestinationCatalog>,
        pub(crate) runner: BackupRunner,
        pub(crate) events: UnboundedReceiver<Event>,
        pub(crate) database: Database,
        pub(crate) dir: TempDir,
    }

    pub(crate) fn fake_pg_dump(script: &str) -> ToolCommand {
        ToolCommand::new("sh").arg("-c").arg(script).arg("pg_dump")
    }

    pub(crate) async fn harness_with(
        pg_dump: ToolCommand,
        max_run_duration: Duration,
        connector: Arc<dyn StorageConnector>,
    ) -> Harness {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(MemoryStore::new());
        let cipher = Arc::new(CredentialCipher::from_secret("runner tests").expect("cipher"));
        let destinations = Arc::new(DestinationCatalog::new(store.clone(), cipher, connector));
        let (notifier, events) = ChannelNotifier::new();
        let settings = RunnerSettings {
            backups_root: dir.path().join("backups"),
            temp_dir: dir.path().join("tmp"),
            tools: ToolLocator {
                pg_dump: Some(pg_dump),
                ..Default::default()
            },
            max_run_duration,
        };
        let runner = BackupRunner::new(store.clone(), destinations.clone(), Arc::new(notifier), settings);
        let database = store
            .create_database(NewDatabase {
                name: "orders".into(),
                pg_version: "16".into(),
                connection_string: "postgresql://backup:secret@db/orders".into(),
            })
            .await
            .expect("database");
        Harness {
            store,
            destinations,
            runner,
            events,
            database,
            dir,
        }
    }

    pub(crate) async fn harness(pg_dump: ToolCommand) -> Harness {
        harness_with(pg_dump, Duration::from_secs(30), Arc::new(BrokenConnector)).await
    }

    impl Harness {
        pub(crate) async fn local_backup(&self, retention_days: i16) -> BackupConfig {
            self.store
                .create_backup(NewBackupConfig {
                    database_id: self.database.id,
                    name: "nightly".into(),
                    dest_dir: "orders".into(),
                    retention_days,
                    ..Default::default()
                })
                .await
                .expect("backup")
        }

        async fn remote_backup(&self, destination: &Destination) -> BackupConfig {
            self.store
                .create_backup(NewBackupConfig {
                    database_id: self.database.id,
                    destination_id: Some(destination.id),
                    is_local: false,
                    name: "offsite".into(),
                    dest_dir: "orders".into(),
                    ..Default::default()
                })
                .await
                .expect("backup")
        }
    }

    #[tokio::test]
    async fn local_run_records_path_and_exact_size() {
        let mut h = harness(fake_pg_dump("echo 'CREATE TABLE orders (id int);'")).await;
        let config = h.local_backup(0).await;

        let ticket = h.runner.start(config.id).await.expect("accepted");
        let running = h.store.get_execution(ticket.execution_id).await.expect("row");
        assert_eq!(running.status, ExecutionStatus::Running);

        let execution = ticket.wait().await.expect("finished");
        assert_eq!(execution.status, ExecutionStatus::Success);
        assert!(execution.finished_at.is_some());

        let path = PathBuf::from(execution.path.clone().expect("path"));
        assert!(path.starts_with(h.dir.path().join("backups").join("orders")));
        let on_disk = std::fs::metadata(&path).expect("artifact").len();
        assert_eq!(execution.file_size, Some(on_disk as i64));
        assert!(!h.runner.is_running(config.id));

        match h.events.recv().await {
            Some(Event::ExecutionSucceeded { execution_id, file_size, .. }) => {
                assert_eq!(execution_id, execution.id);
                assert_eq!(file_size, on_disk);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn second_trigger_while_running_is_rejected() {
        let h = harness(fake_pg_dump("sleep 1; echo done")).await;
        let config = h.local_backup(0).await;

        let ticket = h.runner.start(config.id).await.expect("first accepted");
        let second = h.runner.start(config.id).await;
        assert!(matches!(second, Err(AppError::AlreadyRunning(id)) if id == config.id));

        let executions = h.store.list_backup_executions(config.id).await.expect("list");
        assert_eq!(executions.len(), 1);

        ticket.wait().await.expect("finished");
        let third = h.runner.start(config.id).await.expect("accepted after finish");
        third.wait().await.expect("finished");
    }

    #[tokio::test]
    async fn timeout_fails_the_row_and_frees_the_config() {
        let h = harness_with(
            fake_pg_dump("echo partial; sleep 30"),
            Duration::from_millis(300),
            Arc::new(BrokenConnector),
        )
        .await;
        let config = h.local_backup(0).await;

        let execution = h.runner.start(config.id).await.expect("accepted").wait().await.expect("done");
        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert!(execution.message.unwrap_or_default().starts_with("timeout:"));
        assert!(execution.path.is_none());

        let day_dir = h.dir.path().join("backups").join("orders");
        let leftovers = walk_files(&day_dir);
        assert!(leftovers.is_empty(), "partial artifacts left: {leftovers:?}");

        let retry = h.runner.start(config.id).await.expect("re-trigger accepted");
        retry.cancel();
        let cancelled = retry.wait().await.expect("done");
        assert_eq!(cancelled.status, ExecutionStatus::Failed);
        assert!(cancelled.message.unwrap_or_default().starts_with("cancelled:"));
    }

    #[tokio::test]
    async fn tool_failure_is_recorded_with_stderr() {
        let mut h = harness(fake_pg_dump(
            "echo 'pg_dump: error: could not translate host name \"db\"' >&2; exit 1",
        ))
        .await;
        let config = h.local_backup(0).await;

        let execution = h.runner.start(config.id).await.expect("accepted").wait().await.expect("done");
        assert_eq!(execution.status, ExecutionStatus::Failed);
        let message = execution.message.unwrap_or_default();
        assert!(message.starts_with("connection error:"), "{message}");
        assert!(message.contains("could not translate host name"));
        assert!(matches!(h.events.recv().await, Some(Event::ExecutionFailed { .. })));
    }

    #[tokio::test]
    async fn unknown_config_is_not_found() {
        let h = harness(fake_pg_dump("true")).await;
        assert!(matches!(
            h.runner.start(Uuid::new_v4()).await,
            Err(AppError::NotFound { entity: "backup", .. })
        ));
    }

    #[tokio::test]
    async fn remote_run_uploads_the_staged_dump() {
        let buckets = tempfile::tempdir().expect("buckets");
        let h = harness_with(
            fake_pg_dump("echo 'CREATE TABLE orders (id int);'"),
            Duration::from_secs(30),
            Arc::new(DirectoryConnector {
                root: buckets.path().to_path_buf(),
            }),
        )
        .await;
        let destination = h.destinations.create(plain_destination("archive")).await.expect("destination");
        let config = h.remote_backup(&destination).await;

        let execution = h.runner.start(config.id).await.expect("accepted").wait().await.expect("done");
        assert_eq!(execution.status, ExecutionStatus::Success, "{:?}", execution.message);

        let key = execution.path.clone().expect("key");
        assert!(key.starts_with("orders/"));
        let object = buckets.path().join("archive").join(&key);
        let stored = std::fs::metadata(&object).expect("object").len();
        assert_eq!(execution.file_size, Some(stored as i64));
        assert!(walk_files(&h.dir.path().join("tmp")).is_empty());
    }

    #[tokio::test]
    async fn successful_run_prunes_expired_executions() {
        let h = harness(fake_pg_dump("echo 'SELECT 1;'")).await;
        let config = h.local_backup(7).await;

        let started = Utc::now() - chrono::Duration::days(30);
        let mut stale = Execution::started(config.id, started);
        stale.apply(&ExecutionUpdate::failed("pg_dump error: old"), started);
        h.store.insert_execution(stale.clone()).await;

        let fresh = h.runner.start(config.id).await.expect("accepted").wait().await.expect("done");
        assert_eq!(fresh.status, ExecutionStatus::Success);
        let stale = h.store.get_execution(stale.id).await.expect("row");
        assert_eq!(stale.status, ExecutionStatus::Deleted);
    }

    pub(crate) fn walk_files(root: &std::path::Path) -> Vec<PathBuf> {
        let mut files = Vec::new();
        let Ok(entries) = std::fs::read_dir(root) else {
            return files;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                files.extend(walk_files(&path));
            } else {
                files.push(path);
            }
        }
        files
    }
}
