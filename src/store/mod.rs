//! Persistence for the backup core.
//!
//! The execution store is the only writer of execution status. Every
//! implementation must reject status changes that are not allowed by
//! [`ExecutionStatus::can_transition_to`] and must never hold two `running`
//! executions for the same backup.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::Result;
use crate::model::{
    BackupConfig, Database, Destination, EventType, Execution, ExecutionDetail, ExecutionStatus,
    ExecutionUpdate, NewBackupConfig, NewDatabase, NewDestination, NewWebhook, PageRequest,
    PaginateResponse, Restoration, RestorationStatus, Webhook,
};

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionFilter {
    pub backup_id: Option<Uuid>,
    pub database_id: Option<Uuid>,
    pub destination_id: Option<Uuid>,
    pub status: Option<ExecutionStatus>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestorationFilter {
    pub execution_id: Option<Uuid>,
    pub database_id: Option<Uuid>,
}

/// Backup configurations, databases, destinations and webhooks.
#[async_trait]
pub trait Catalog: Send + Sync {
    async fn create_backup(&self, new: NewBackupConfig) -> Result<BackupConfig>;
    async fn get_backup(&self, id: Uuid) -> Result<BackupConfig>;
    async fn list_backups(&self) -> Result<Vec<BackupConfig>>;
    async fn list_active_backups(&self) -> Result<Vec<BackupConfig>>;

    async fn create_database(&self, new: NewDatabase) -> Result<Database>;
    async fn get_database(&self, id: Uuid) -> Result<Database>;

    async fn create_destination(&self, new: NewDestination) -> Result<Destination>;
    async fn get_destination(&self, id: Uuid) -> Result<Destination>;
    async fn record_destination_test(
        &self,
        id: Uuid,
        ok: bool,
        error: Option<String>,
    ) -> Result<Destination>;

    async fn create_webhook(&self, new: NewWebhook) -> Result<Webhook>;
    async fn list_active_webhooks(&self, event_type: EventType) -> Result<Vec<Webhook>>;
}

#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Inserts a `running` execution started now.
    async fn create_execution(&self, backup_id: Uuid) -> Result<Execution>;

    /// Moves an execution to `update.status`, patching the given fields.
    async fn update_execution(&self, id: Uuid, update: ExecutionUpdate) -> Result<Execution>;

    async fn get_execution(&self, id: Uuid) -> Result<Execution>;
    async fn get_execution_detail(&self, id: Uuid) -> Result<ExecutionDetail>;

    /// Every execution of one backup, newest first.
    async fn list_backup_executions(&self, backup_id: Uuid) -> Result<Vec<Execution>>;

    async fn paginate_executions(
        &self,
        filter: ExecutionFilter,
        page: PageRequest,
    ) -> Result<(PaginateResponse, Vec<ExecutionDetail>)>;

    /// Non-deleted executions of `backup_id` started before `cutoff`, except `keep`.
    async fn list_expired_executions(
        &self,
        backup_id: Uuid,
        cutoff: DateTime<Utc>,
        keep: Uuid,
    ) -> Result<Vec<Execution>>;

    /// Fails every `running` row. Used at startup when no run can be in flight.
    async fn fail_stale_running(&self, message: &str) -> Result<u64>;

    async fn soft_delete_execution(&self, id: Uuid) -> Result<Execution> {
        self.update_execution(id, ExecutionUpdate::deleted()).await
    }
}

#[async_trait]
pub trait RestorationStore: Send + Sync {
    async fn create_restoration(
        &self,
        execution_id: Uuid,
        database_id: Option<Uuid>,
    ) -> Result<Restoration>;

    /// Moves a `running` restoration to a terminal status.
    async fn finish_restoration(
        &self,
        id: Uuid,
        status: RestorationStatus,
        message: String,
    ) -> Result<Restoration>;

    async fn get_restoration(&self, id: Uuid) -> Result<Restoration>;

    async fn paginate_restorations(
        &self,
        filter: RestorationFilter,
        page: PageRequest,
    ) -> Result<(PaginateResponse, Vec<Restoration>)>;
}

/// Everything the core persists, behind one handle.
pub trait Store: Catalog + ExecutionStore + RestorationStore {}

impl<T: Catalog + ExecutionStore + RestorationStore> Store for T {}
