// pgbackd/src/store/memory.rs
use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{Catalog, ExecutionFilter, ExecutionStore, RestorationFilter, RestorationStore};
use crate::errors::{AppError, Result};
use crate::model::pagination::paginate;
use crate::model::{
    BackupConfig, Database, Destination, EventType, Execution, ExecutionDetail, ExecutionStatus,
    ExecutionUpdate, NewBackupConfig, NewDatabase, NewDestination, NewWebhook, PageRequest,
    PaginateResponse, Restoration, RestorationStatus, Webhook,
};

/// Process-local store. Used when no `database_url` is configured, and by tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<State>,
}

#[derive(Debug, Default)]
struct State {
    backups: HashMap<Uuid, BackupConfig>,
    databases: HashMap<Uuid, Database>,
    destinations: HashMap<Uuid, Destination>,
    webhooks: Vec<Webhook>,
    executions: HashMap<Uuid, Execution>,
    restorations: HashMap<Uuid, Restoration>,
}

impl State {
    fn detail(&self, execution: &Execution) -> Result<ExecutionDetail> {
        let backup = self
            .backups
            .get(&execution.backup_id)
            .ok_or_else(|| AppError::not_found("backup", execution.backup_id))?;
        let database = self
            .databases
            .get(&backup.database_id)
            .ok_or_else(|| AppError::not_found("database", backup.database_id))?;
        let destination_name = backup
            .destination_id
            .and_then(|id| self.destinations.get(&id))
            .map(|d| d.name.clone());

        Ok(ExecutionDetail {
            execution: execution.clone(),
            backup_name: backup.name.clone(),
            is_local: backup.is_local,
            database_name: database.name.clone(),
            database_pg_version: database.pg_version.clone(),
            destination_name,
        })
    }

    fn matches(&self, execution: &Execution, filter: &ExecutionFilter) -> bool {
        if filter.backup_id.is_some_and(|id| id != execution.backup_id) {
            return false;
        }
        if filter.status.is_some_and(|status| status != execution.status) {
            return false;
        }
        if filter.database_id.is_none() && filter.destination_id.is_none() {
            return true;
        }
        match self.backups.get(&execution.backup_id) {
            Some(backup) => {
                filter.database_id.is_none_or(|id| id == backup.database_id)
                    && filter
                        .destination_id
                        .is_none_or(|id| Some(id) == backup.destination_id)
            }
            None => false,
        }
    }
}

fn newest_first(executions: &mut [Execution]) {
    executions.sort_by(|a, b| b.started_at.cmp(&a.started_at).then(b.id.cmp(&a.id)));
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a historical execution as-is, bypassing the lifecycle checks.
    #[cfg(test)]
    pub(crate) async fn insert_execution(&self, execution: Execution) {
        self.state
            .write()
            .await
            .executions
            .insert(execution.id, execution);
    }
}

#[async_trait]
impl Catalog for MemoryStore {
    async fn create_backup(&self, new: NewBackupConfig) -> Result<BackupConfig> {
        new.validate()?;
        let mut state = self.state.write().await;
        if !state.databases.contains_key(&new.database_id) {
            return Err(AppError::not_found("database", new.database_id));
        }
        if let Some(destination_id) = new.destination_id {
            if !state.destinations.contains_key(&destination_id) {
                return Err(AppError::not_found("destination", destination_id));
            }
        }
        let backup = new.into_config(Uuid::new_v4(), Utc::now());
        state.backups.insert(backup.id, backup.clone());
        Ok(backup)
    }

    async fn get_backup(&self, id: Uuid) -> Result<BackupConfig> {
        self.state
            .read()
            .await
            .backups
            .get(&id)
            .cloned()
            .ok_or_else(|| AppError::not_found("backup", id))
    }

    async fn list_backups(&self) -> Result<Vec<BackupConfig>> {
        let mut backups: Vec<_> = self.state.read().await.backups.values().cloned().collect();
        backups.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(backups)
    }

    async fn list_active_backups(&self) -> Result<Vec<BackupConfig>> {
        let backups = self.list_backups().await?;
        Ok(backups.into_iter().filter(|b| b.is_active).collect())
    }

    async fn create_database(&self, new: NewDatabase) -> Result<Database> {
        let database = Database {
            id: Uuid::new_v4(),
            name: new.name,
            pg_version: new.pg_version,
            connection_string: new.connection_string,
            created_at: Utc::now(),
        };
        self.state
            .write()
            .await
            .databases
            .insert(database.id, database.clone());
        Ok(database)
    }

    async fn get_database(&self, id: Uuid) -> Result<Database> {
        self.state
            .read()
            .await
            .databases
            .get(&id)
            .cloned()
            .ok_or_else(|| AppError::not_found("database", id))
    }

    async fn create_destination(&self, new: NewDestination) -> Result<Destination> {
        let destination = Destination {
            id: Uuid::new_v4(),
            name: new.name,
            bucket_name: new.bucket_name,
            region: new.region,
            endpoint: new.endpoint,
            access_key: new.access_key,
            secret_key: new.secret_key,
            test_ok: None,
            test_error: None,
            last_test_at: None,
            created_at: Utc::now(),
        };
        self.state
            .write()
            .await
            .destinations
            .insert(destination.id, destination.clone());
        Ok(destination)
    }

    async fn get_destination(&self, id: Uuid) -> Result<Destination> {
        self.state
            .read()
            .await
            .destinations
            .get(&id)
            .cloned()
            .ok_or_else(|| AppError::not_found("destination", id))
    }

    async fn record_destination_test(
        &self,
        id: Uuid,
        ok: bool,
        error: Option<String>,
    ) -> Result<Destination> {
        let mut state = self.state.write().await;
        let destination = state
            .destinations
            .get_mut(&id)
            .ok_or_else(|| AppError::not_found("destination", id))?;
        destination.test_ok = Some(ok);
        destination.test_error = error;
        destination.last_test_at = Some(Utc::now());
        Ok(destination.clone())
    }

    async fn create_webhook(&self, new: NewWebhook) -> Result<Webhook> {
        let webhook = Webhook {
            id: Uuid::new_v4(),
            name: new.name,
            event_type: new.event_type,
            target_ids: new.target_ids,
            is_active: new.is_active,
            method: new.method,
            url: new.url,
            headers: new.headers,
            body: new.body,
            created_at: Utc::now(),
        };
        self.state.write().await.webhooks.push(webhook.clone());
        Ok(webhook)
    }

    async fn list_active_webhooks(&self, event_type: EventType) -> Result<Vec<Webhook>> {
        Ok(self
            .state
            .read()
            .await
            .webhooks
            .iter()
            .filter(|w| w.is_active && w.event_type == event_type)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl ExecutionStore for MemoryStore {
    async fn create_execution(&self, backup_id: Uuid) -> Result<Execution> {
        let mut state = self.state.write().await;
        if !state.backups.contains_key(&backup_id) {
            return Err(AppError::not_found("backup", backup_id));
        }
        let already_running = state
            .executions
            .values()
            .any(|e| e.backup_id == backup_id && e.status == ExecutionStatus::Running);
        if already_running {
            return Err(AppError::AlreadyRunning(backup_id));
        }

        let execution = Execution::started(backup_id, Utc::now());
        state.executions.insert(execution.id, execution.clone());
        Ok(execution)
    }

    async fn update_execution(&self, id: Uuid, update: ExecutionUpdate) -> Result<Execution> {
        let mut state = self.state.write().await;
        let execution = state
            .executions
            .get_mut(&id)
            .ok_or_else(|| AppError::not_found("execution", id))?;
        if !execution.status.can_transition_to(update.status) {
            return Err(AppError::InvalidTransition {
                entity: "execution",
                id,
                from: execution.status.to_string(),
                to: update.status.to_string(),
            });
        }
        execution.apply(&update, Utc::now());
        Ok(execution.clone())
    }

    async fn get_execution(&self, id: Uuid) -> Result<Execution> {
        self.state
            .read()
            .await
            .executions
            .get(&id)
            .cloned()
            .ok_or_else(|| AppError::not_found("execution", id))
    }

    async fn get_execution_detail(&self, id: Uuid) -> Result<ExecutionDetail> {
        let state = self.state.read().await;
        let execution = state
            .executions
            .get(&id)
            .ok_or_else(|| AppError::not_found("execution", id))?;
        state.detail(execution)
    }

    async fn list_backup_executions(&self, backup_id: Uuid) -> Result<Vec<Execution>> {
        let mut executions: Vec<_> = self
            .state
            .read()
            .await
            .executions
            .values()
            .filter(|e| e.backup_id == backup_id)
            .cloned()
            .collect();
        newest_first(&mut executions);
        Ok(executions)
    }

    async fn paginate_executions(
        &self,
        filter: ExecutionFilter,
        page: PageRequest,
    ) -> Result<(PaginateResponse, Vec<ExecutionDetail>)> {
        let state = self.state.read().await;
        let mut executions: Vec<_> = state
            .executions
            .values()
            .filter(|e| state.matches(e, &filter))
            .cloned()
            .collect();
        newest_first(&mut executions);

        let (response, executions) = paginate(executions, PageRequest::new(page.page, page.limit));
        let details = executions
            .iter()
            .map(|e| state.detail(e))
            .collect::<Result<Vec<_>>>()?;
        Ok((response, details))
    }

    async fn list_expired_executions(
        &self,
        backup_id: Uuid,
        cutoff: DateTime<Utc>,
        keep: Uuid,
    ) -> Result<Vec<Execution>> {
        let mut expired: Vec<_> = self
            .state
            .read()
            .await
            .executions
            .values()
            .filter(|e| {
                e.backup_id == backup_id
                    && e.id != keep
                    && e.started_at < cutoff
                    && matches!(e.status, ExecutionStatus::Success | ExecutionStatus::Failed)
            })
            .cloned()
            .collect();
        newest_first(&mut expired);
        Ok(expired)
    }

    async fn fail_stale_running(&self, message: &str) -> Result<u64> {
        let now = Utc::now();
        let update = ExecutionUpdate::failed(message);
        let mut state = self.state.write().await;
        let mut failed = 0;
        for execution in state.executions.values_mut() {
            if execution.status == ExecutionStatus::Running {
                execution.apply(&update, now);
                failed += 1;
            }
        }
        Ok(failed)
    }
}

#[async_trait]
impl RestorationStore for MemoryStore {
    async fn create_restoration(
        &self,
        execution_id: Uuid,
        database_id: Option<Uuid>,
    ) -> Result<Restoration> {
        let mut state = self.state.write().await;
        if !state.executions.contains_key(&execution_id) {
            return Err(AppError::not_found("execution", execution_id));
        }
        let now = Utc::now();
        let restoration = Restoration {
            id: Uuid::new_v4(),
            execution_id,
            database_id,
            status: RestorationStatus::Running,
            message: None,
            started_at: now,
            updated_at: now,
            finished_at: None,
        };
        state.restorations.insert(restoration.id, restoration.clone());
        Ok(restoration)
    }

    async fn finish_restoration(
        &self,
        id: Uuid,
        status: RestorationStatus,
        message: String,
    ) -> Result<Restoration> {
        let mut state = self.state.write().await;
        let restoration = state
            .restorations
            .get_mut(&id)
            .ok_or_else(|| AppError::not_found("restoration", id))?;
        if restoration.status != RestorationStatus::Running || status == RestorationStatus::Running
        {
            return Err(AppError::InvalidTransition {
                entity: "restoration",
                id,
                from: restoration.status.to_string(),
                to: status.to_string(),
            });
        }
        let now = Utc::now();
        restoration.status = status;
        restoration.message = Some(message);
        restoration.updated_at = now;
        restoration.finished_at = Some(now);
        Ok(restoration.clone())
    }

    async fn get_restoration(&self, id: Uuid) -> Result<Restoration> {
        self.state
            .read()
            .await
            .restorations
            .get(&id)
            .cloned()
            .ok_or_else(|| AppError::not_found("restoration", id))
    }

    async fn paginate_restorations(
        &self,
        filter: RestorationFilter,
        page: PageRequest,
    ) -> Result<(PaginateResponse, Vec<Restoration>)> {
        let mut restorations: Vec<_> = self
            .state
            .read()
            .await
            .restorations
            .values()
            .filter(|r| {
                filter.execution_id.is_none_or(|id| id == r.execution_id)
                    && filter.database_id.is_none_or(|id| Some(id) == r.database_id)
            })
            .cloned()
            .collect();
        restorations.sort_by(|a, b| b.started_at.cmp(&a.started_at).then(b.id.cmp(&a.id)));
        Ok(paginate(restorations, PageRequest::new(page.page, page.limit)))
    }
}
