// pgbackd/src/model/execution.rs
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::errors::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Running,
    Success,
    Failed,
    Deleted,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Running => "running",
            ExecutionStatus::Success => "success",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Deleted => "deleted",
        }
    }

    /// The statuses a row may be in immediately before moving to `self`.
    pub fn predecessors(&self) -> &'static [ExecutionStatus] {
        match self {
            ExecutionStatus::Running => &[],
            ExecutionStatus::Success | ExecutionStatus::Failed => &[ExecutionStatus::Running],
            ExecutionStatus::Deleted => &[ExecutionStatus::Success, ExecutionStatus::Failed],
        }
    }

    pub fn can_transition_to(&self, next: ExecutionStatus) -> bool {
        next.predecessors().contains(self)
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionStatus::Running)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(ExecutionStatus::Running),
            "success" => Ok(ExecutionStatus::Success),
            "failed" => Ok(ExecutionStatus::Failed),
            "deleted" => Ok(ExecutionStatus::Deleted),
            other => Err(AppError::InvalidInput(format!(
                "unknown execution status '{other}'"
            ))),
        }
    }
}

impl TryFrom<String> for ExecutionStatus {
    type Error = AppError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// One attempt to run a backup for a configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Execution {
    pub id: Uuid,
    pub backup_id: Uuid,
    #[sqlx(try_from = "String")]
    pub status: ExecutionStatus,
    pub message: Option<String>,
    pub path: Option<String>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub file_size: Option<i64>,
}

impl Execution {
    pub fn started(backup_id: Uuid, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            backup_id,
            status: ExecutionStatus::Running,
            message: None,
            path: None,
            started_at: now,
            updated_at: now,
            finished_at: None,
            deleted_at: None,
            file_size: None,
        }
    }

    /// Applies a patch in memory. Callers check the transition first.
    pub fn apply(&mut self, update: &ExecutionUpdate, now: DateTime<Utc>) {
        self.status = update.status;
        if let Some(message) = &update.message {
            self.message = Some(message.clone());
        }
        if let Some(path) = &update.path {
            self.path = Some(path.clone());
        }
        if let Some(size) = update.file_size {
            self.file_size = Some(size);
        }
        if update.finished {
            self.finished_at = Some(now);
        }
        if update.status == ExecutionStatus::Deleted {
            self.deleted_at = Some(now);
        }
        self.updated_at = now;
    }
}

/// Status change plus the fields that travel with it. `None` leaves a field untouched.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionUpdate {
    pub status: ExecutionStatus,
    pub message: Option<String>,
    pub path: Option<String>,
    pub file_size: Option<i64>,
    pub finished: bool,
}

impl ExecutionUpdate {
    pub fn succeeded(path: String, file_size: u64) -> Self {
        Self {
            status: ExecutionStatus::Success,
            message: Some("backup completed successfully".to_string()),
            path: Some(path),
            file_size: Some(i64::try_from(file_size).unwrap_or(i64::MAX)),
            finished: true,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: ExecutionStatus::Failed,
            message: Some(message.into()),
            path: None,
            file_size: None,
            finished: true,
        }
    }

    pub fn deleted() -> Self {
        Self {
            status: ExecutionStatus::Deleted,
            message: None,
            path: None,
            file_size: None,
            finished: false,
        }
    }
}

/// An execution joined with the names of what it belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct ExecutionDetail {
    #[sqlx(flatten)]
    #[serde(flatten)]
    pub execution: Execution,
    pub backup_name: String,
    pub is_local: bool,
    pub database_name: String,
    pub database_pg_version: String,
    pub destination_name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RestorationStatus {
    Running,
    Success,
    Failed,
}

impl RestorationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RestorationStatus::Running => "running",
            RestorationStatus::Success => "success",
            RestorationStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for RestorationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for RestorationStatus {
    type Error = AppError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "running" => Ok(RestorationStatus::Running),
            "success" => Ok(RestorationStatus::Success),
            "failed" => Ok(RestorationStatus::Failed),
            other => Err(AppError::InvalidInput(format!(
                "unknown restoration status '{other}'"
            ))),
        }
    }
}

/// One attempt to load an execution's artifact into a database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Restoration {
    pub id: Uuid,
    pub execution_id: Uuid,
    /// Target database. The restoration runner records the source database when none is requested.
    pub database_id: Option<Uuid>,
    #[sqlx(try_from = "String")]
    pub status: RestorationStatus,
    pub message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions_are_monotonic() {
        use ExecutionStatus::*;

        assert!(Running.can_transition_to(Success));
        assert!(Running.can_transition_to(Failed));
        assert!(Success.can_transition_to(Deleted));
        assert!(Failed.can_transition_to(Deleted));

        assert!(!Running.can_transition_to(Deleted));
        assert!(!Success.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Success));
        assert!(!Deleted.can_transition_to(Success));
        assert!(!Deleted.can_transition_to(Running));
        assert!(!Success.can_transition_to(Running));
    }

    #[test]
    fn status_parses_from_its_column_text() {
        for status in [
            ExecutionStatus::Running,
            ExecutionStatus::Success,
            ExecutionStatus::Failed,
            ExecutionStatus::Deleted,
        ] {
            assert_eq!(status.as_str().parse::<ExecutionStatus>().ok(), Some(status));
        }
        assert!("paused".parse::<ExecutionStatus>().is_err());
    }

    #[test]
    fn deleting_stamps_deleted_at_but_keeps_outcome() {
        let now = Utc::now();
        let mut execution = Execution::started(Uuid::new_v4(), now);
        execution.apply(&ExecutionUpdate::succeeded("/b/dump.sql.gz".into(), 42), now);
        assert_eq!(execution.file_size, Some(42));
        assert!(execution.finished_at.is_some());
        assert!(execution.deleted_at.is_none());

        execution.apply(&ExecutionUpdate::deleted(), now);
        assert_eq!(execution.status, ExecutionStatus::Deleted);
        assert_eq!(execution.path.as_deref(), Some("/b/dump.sql.gz"));
        assert!(execution.deleted_at.is_some());
    }
}
