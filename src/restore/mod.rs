//! Restorations: loading a successful execution's artifact back into a database.

pub mod db_restore;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::backup::ArtifactLocation;
use crate::errors::{AppError, Result};
use crate::model::{BackupConfig, Database, Execution, ExecutionStatus, Restoration, RestorationStatus};
use crate::notify::{Event, Notifier};
use crate::storage::DestinationCatalog;
use crate::store::Store;
use crate::utils::ToolLocator;
use crate::utils::locks::{LockGuard, LockSet};
use db_restore::load_dump;

pub const DEFAULT_MAX_RESTORE_DURATION: Duration = Duration::from_secs(6 * 60 * 60);

#[derive(Debug, Clone)]
pub struct RestoreSettings {
    /// Where remote artifacts are downloaded before loading.
    pub temp_dir: PathBuf,
    pub tools: ToolLocator,
    pub max_restore_duration: Duration,
}

/// Handle to an accepted restoration.
#[derive(Debug)]
pub struct RestoreTicket {
    pub restoration_id: Uuid,
    pub target_database_id: Uuid,
    cancel: CancellationToken,
    done: oneshot::Receiver<Result<Restoration>>,
}

impl RestoreTicket {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub async fn wait(self) -> Result<Restoration> {
        self.done
            .await
            .map_err(|_| AppError::Internal("restoration supervisor exited without reporting".into()))?
    }
}

/// Runs restorations, at most one per target database at a time.
#[derive(Clone)]
pub struct RestorationRunner {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<dyn Store>,
    destinations: Arc<DestinationCatalog>,
    notifier: Arc<dyn Notifier>,
    locks: LockSet,
    settings: RestoreSettings,
}

struct Job {
    execution: Execution,
    config: BackupConfig,
    target: Database,
    location: ArtifactLocation,
}

impl RestorationRunner {
    pub fn new(
        store: Arc<dyn Store>,
        destinations: Arc<DestinationCatalog>,
        notifier: Arc<dyn Notifier>,
        settings: RestoreSettings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                destinations,
                notifier,
                locks: LockSet::new(),
                settings,
            }),
        }
    }

    pub fn is_restoring(&self, database_id: Uuid) -> bool {
        self.inner.locks.is_held(database_id)
    }

    /// Accepts a restoration of `execution_id` into `database_id`, or into the
    /// execution's source database when `None`.
    pub async fn start(&self, execution_id: Uuid, database_id: Option<Uuid>) -> Result<RestoreTicket> {
        let store = &self.inner.store;
        let execution = store.get_execution(execution_id).await?;
        if execution.status != ExecutionStatus::Success {
            return Err(AppError::InvalidInput(format!(
                "execution {execution_id} is {}, only successful executions can be restored",
                execution.status
            )));
        }
        let path = execution
            .path
            .clone()
            .filter(|p| !p.trim().is_empty())
            .ok_or_else(|| AppError::InvalidInput(format!("execution {execution_id} has no artifact")))?;

        let config = store.get_backup(execution.backup_id).await?;
        let target_id = database_id.unwrap_or(config.database_id);
        let target = store.get_database(target_id).await?;
        let location = ArtifactLocation::for_execution(&config, &path)?;

        let guard = self
            .inner
            .locks
            .try_acquire(target_id)
            .ok_or(AppError::RestorationInProgress(target_id))?;
        let restoration = store.create_restoration(execution_id, Some(target_id)).await?;

        info!(
            restoration_id = %restoration.id,
            %execution_id,
            target = %target.name,
            "restoration accepted"
        );

        let cancel = CancellationToken::new();
        let (tx, rx) = oneshot::channel();
        let ticket = RestoreTicket {
            restoration_id: restoration.id,
            target_database_id: target_id,
            cancel: cancel.clone(),
            done: rx,
        };
        let job = Job {
            execution,
            config,
            target,
            location,
        };
        tokio::spawn(self.clone().supervise(restoration, job, guard, cancel, tx));
        Ok(ticket)
    }

    async fn supervise(
        self,
        restoration: Restoration,
        job: Job,
        guard: LockGuard,
        cancel: CancellationToken,
        tx: oneshot::Sender<Result<Restoration>>,
    ) {
        let max = self.inner.settings.max_restore_duration;
        let execution_id = job.execution.id;
        let database_id = job.target.id;
        let mut attempt = tokio::spawn({
            let runner = self.clone();
            async move { runner.attempt(&job).await }
        });

        let outcome = tokio::select! {
            joined = &mut attempt => match joined {
                Ok(result) => result,
                Err(e) if e.is_panic() => Err(AppError::Internal("restoration task panicked".into())),
                Err(_) => Err(AppError::Cancelled("restoration task was aborted".into())),
            },
            _ = tokio::time::sleep(max) => {
                attempt.abort();
                let _ = attempt.await;
                Err(AppError::Timeout(max))
            }
            _ = cancel.cancelled() => {
                attempt.abort();
                let _ = attempt.await;
                Err(AppError::Cancelled("restoration cancelled by request".into()))
            }
        };

        let (status, message, event) = match outcome {
            Ok(fed) => {
                info!(restoration_id = %restoration.id, %execution_id, fed, "restoration succeeded");
                (
                    RestorationStatus::Success,
                    "restoration completed successfully".to_string(),
                    Event::RestorationSucceeded {
                        restoration_id: restoration.id,
                        execution_id,
                        database_id,
                    },
                )
            }
            Err(e) => {
                warn!(restoration_id = %restoration.id, %execution_id, error = %e, "restoration failed");
                let message = e.to_string();
                (
                    RestorationStatus::Failed,
                    message.clone(),
                    Event::RestorationFailed {
                        restoration_id: restoration.id,
                        execution_id,
                        database_id,
                        message,
                    },
                )
            }
        };

        let finalized = self
            .inner
            .store
            .finish_restoration(restoration.id, status, message)
            .await;
        match &finalized {
            Ok(_) => self.inner.notifier.notify(event),
            Err(e) => error!(restoration_id = %restoration.id, error = %e, "could not finalize restoration"),
        }

        drop(guard);
        let _ = tx.send(finalized);
    }

    async fn attempt(&self, job: &Job) -> Result<u64> {
        let tool = self.inner.settings.tools.psql(&job.target.pg_version)?;

        match &job.location {
            ArtifactLocation::Local(path) => {
                let file = tokio::fs::File::open(path).await.map_err(|e| {
                    AppError::storage(format!("cannot open artifact {}", path.display()), e)
                })?;
                load_dump(&tool, &job.target, file).await
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
                    .prefix("pgbackd-restore-")
                    .suffix(".sql.gz")
                    .tempfile_in(temp_dir)
                    .map_err(|e| AppError::storage("failed to create download file", e))?;

                let downloaded = storage.get(key, staged.path()).await?;
                info!(
                    backup_id = %job.config.id,
                    execution_id = %job.execution.id,
                    downloaded,
                    "artifact downloaded for restoration"
                );
                let file = tokio::fs::File::open(staged.path())
                    .await
                    .map_err(|e| AppError::storage("cannot open downloaded artifact", e))?;
                load_dump(&tool, &job.target, file).await
            }
        }
    }
}
