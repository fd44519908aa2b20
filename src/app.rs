// pgbackd/src/app.rs
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::backup::BackupRunner;
use crate::config::AppConfig;
use crate::errors::Result;
use crate::notify::{Notifier, TracingNotifier};
use crate::restore::RestorationRunner;
use crate::scheduler::Scheduler;
use crate::service::ExecutionsService;
use crate::storage::{DestinationCatalog, S3Connector, StorageConnector};
use crate::store::{MemoryStore, PgStore, Store};
use crate::utils::crypto::CredentialCipher;

const INTERRUPTED_MESSAGE: &str = "internal error: interrupted by a restart before finishing";

/// Every long-lived component, wired together.
#[derive(Clone)]
pub struct Core {
    pub store: Arc<dyn Store>,
    pub destinations: Arc<DestinationCatalog>,
    pub runner: BackupRunner,
    pub restorer: RestorationRunner,
    pub scheduler: Scheduler,
    pub service: ExecutionsService,
    retention_sweep_interval: Option<Duration>,
}

impl Core {
    /// Opens the configured store and builds the core with S3 storage and log notifications.
    pub async fn from_config(config: &AppConfig) -> Result<Self> {
        let store: Arc<dyn Store> = match &config.database_url {
            Some(url) => {
                let store = PgStore::connect(url, config.db_max_connections).await?;
                store.migrate().await?;
                Arc::new(store)
            }
            None => {
                warn!("no database_url configured, executions are kept in memory only");
                Arc::new(MemoryStore::new())
            }
        };
        Self::assemble(store, config, Arc::new(S3Connector), Arc::new(TracingNotifier))
    }

    pub fn assemble(
        store: Arc<dyn Store>,
        config: &AppConfig,
        connector: Arc<dyn StorageConnector>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self> {
        let cipher = Arc::new(CredentialCipher::from_secret(&config.encryption_key)?);
        let destinations = Arc::new(DestinationCatalog::new(store.clone(), cipher, connector));
        let runner = BackupRunner::new(
            store.clone(),
            destinations.clone(),
            notifier.clone(),
            config.runner_settings(),
        );
        let restorer = RestorationRunner::new(
            store.clone(),
            destinations.clone(),
            notifier,
            config.restore_settings(),
        );
        let scheduler = Scheduler::start(runner.clone(), store.clone());
        let service = ExecutionsService::new(
            store.clone(),
            scheduler.clone(),
            restorer.clone(),
            destinations.clone(),
        );

        Ok(Self {
            store,
            destinations,
            runner,
            restorer,
            scheduler,
            service,
            retention_sweep_interval: config.retention_sweep_interval,
        })
    }

    /// Fails executions a previous process left `running`. Only safe while no run is in flight.
    pub async fn recover_interrupted(&self) -> Result<u64> {
        let failed = self.store.fail_stale_running(INTERRUPTED_MESSAGE).await?;
        if failed > 0 {
            warn!(failed, "marked interrupted executions as failed");
        }
        Ok(failed)
    }

    /// Runs retention over every configuration on the configured interval until `shutdown`.
    pub fn spawn_retention_sweep(&self, shutdown: CancellationToken) -> Option<JoinHandle<()>> {
        let interval = self.retention_sweep_interval?;
        let retention = self.runner.retention().clone();
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => match retention.enforce_all(Utc::now()).await {
                        Ok(report) => info!(
                            deleted = report.deleted,
                            artifact_failures = report.artifact_failures,
                            "retention sweep finished"
                        ),
                        Err(e) => warn!(error = %e, "retention sweep failed"),
                    },
                }
            }
        }))
    }
}
