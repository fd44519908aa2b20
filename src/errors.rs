use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),

    #[error("a backup run is already in progress for backup {0}")]
    AlreadyRunning(Uuid),

    #[error("connection error: {0}")]
    Connection(String),

    /// Non-zero exit from an external tool (`pg_dump`, `psql`), carrying a stderr excerpt.
    #[error("{tool} error: {stderr}")]
    DumpTool { tool: &'static str, stderr: String },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("timeout: run exceeded the maximum duration of {0:?}")]
    Timeout(Duration),

    #[error("a restoration is already in progress for database {0}")]
    RestorationInProgress(Uuid),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },

    #[error("invalid status transition for {entity} {id}: {from} -> {to}")]
    InvalidTransition {
        entity: &'static str,
        id: Uuid,
        from: String,
        to: String,
    },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("encryption error: {0}")]
    Crypto(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl AppError {
    pub fn not_found(entity: &'static str, id: Uuid) -> Self {
        AppError::NotFound { entity, id }
    }

    pub fn storage(context: impl std::fmt::Display, err: impl std::fmt::Display) -> Self {
        AppError::Storage(format!("{context}: {err}"))
    }
}

pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_failures_carry_their_category_in_the_message() {
        let timeout = AppError::Timeout(Duration::from_millis(250));
        assert!(timeout.to_string().starts_with("timeout:"));

        let tool = AppError::DumpTool {
            tool: "pg_dump",
            stderr: "relation is locked".into(),
        };
        assert_eq!(tool.to_string(), "pg_dump error: relation is locked");

        let missing = AppError::not_found("backup", Uuid::nil());
        assert!(missing.to_string().contains("not found"));
    }
}
