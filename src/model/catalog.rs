// pgbackd/src/model/catalog.rs
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::errors::AppError;

/// A registered source or target database.
#[derive(Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Database {
    pub id: Uuid,
    pub name: String,
    /// Major version tag such as `"16"`; selects the client tools.
    pub pg_version: String,
    #[serde(skip_serializing)]
    pub connection_string: String,
    pub created_at: DateTime<Utc>,
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("pg_version", &self.pg_version)
            .field("connection_string", &"<redacted>")
            .finish()
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct NewDatabase {
    pub name: String,
    pub pg_version: String,
    pub connection_string: String,
}

/// An S3-compatible bucket. Keys are stored as ciphertext.
#[derive(Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Destination {
    pub id: Uuid,
    pub name: String,
    pub bucket_name: String,
    pub region: String,
    pub endpoint: String,
    #[serde(skip_serializing)]
    pub access_key: String,
    #[serde(skip_serializing)]
    pub secret_key: String,
    pub test_ok: Option<bool>,
    pub test_error: Option<String>,
    pub last_test_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl fmt::Debug for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Destination")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("bucket_name", &self.bucket_name)
            .field("region", &self.region)
            .field("endpoint", &self.endpoint)
            .field("test_ok", &self.test_ok)
            .field("last_test_at", &self.last_test_at)
            .finish_non_exhaustive()
    }
}

/// A destination whose keys were already encrypted by the caller.
#[derive(Clone)]
pub struct NewDestination {
    pub name: String,
    pub bucket_name: String,
    pub region: String,
    pub endpoint: String,
    pub access_key: String,
    pub secret_key: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    ExecutionSuccess,
    ExecutionFailed,
    RestorationSuccess,
    RestorationFailed,
    DatabaseHealthy,
    DatabaseUnhealthy,
    DestinationHealthy,
    DestinationUnhealthy,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::ExecutionSuccess => "execution_success",
            EventType::ExecutionFailed => "execution_failed",
            EventType::RestorationSuccess => "restoration_success",
            EventType::RestorationFailed => "restoration_failed",
            EventType::DatabaseHealthy => "database_healthy",
            EventType::DatabaseUnhealthy => "database_unhealthy",
            EventType::DestinationHealthy => "destination_healthy",
            EventType::DestinationUnhealthy => "destination_unhealthy",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for EventType {
    type Error = AppError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        serde_json::from_value(serde_json::Value::String(value.clone()))
            .map_err(|_| AppError::InvalidInput(format!("unknown webhook event type '{value}'")))
    }
}

/// Outbound notification definition consumed by the external dispatcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Webhook {
    pub id: Uuid,
    pub name: String,
    #[sqlx(try_from = "String")]
    pub event_type: EventType,
    /// Backup, database or destination ids this webhook listens to.
    pub target_ids: Vec<Uuid>,
    pub is_active: bool,
    pub method: String,
    pub url: String,
    pub headers: Option<String>,
    pub body: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Webhook {
    pub fn listens_to(&self, event_type: EventType, target_id: Uuid) -> bool {
        self.is_active && self.event_type == event_type && self.target_ids.contains(&target_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewWebhook {
    pub name: String,
    pub event_type: EventType,
    pub target_ids: Vec<Uuid>,
    pub is_active: bool,
    pub method: String,
    pub url: String,
    pub headers: Option<String>,
    pub body: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_round_trips_through_column_text() {
        let parsed = EventType::try_from("restoration_failed".to_string()).ok();
        assert_eq!(parsed, Some(EventType::RestorationFailed));
        assert!(EventType::try_from("backup_exploded".to_string()).is_err());
    }

    #[test]
    fn debug_output_hides_credentials() {
        let database = Database {
            id: Uuid::nil(),
            name: "orders".into(),
            pg_version: "16".into(),
            connection_string: "postgresql://admin:hunter2@db/orders".into(),
            created_at: Utc::now(),
        };
        let printed = format!("{database:?}");
        assert!(!printed.contains("hunter2"));
        assert!(printed.contains("orders"));
    }

    #[test]
    fn webhook_matches_on_event_and_target() {
        let target = Uuid::new_v4();
        let hook = Webhook {
            id: Uuid::new_v4(),
            name: "ops".into(),
            event_type: EventType::ExecutionFailed,
            target_ids: vec![target],
            is_active: true,
            method: "POST".into(),
            url: "https://hooks.example.com/ops".into(),
            headers: None,
            body: None,
            created_at: Utc::now(),
        };
        assert!(hook.listens_to(EventType::ExecutionFailed, target));
        assert!(!hook.listens_to(EventType::ExecutionSuccess, target));
        assert!(!hook.listens_to(EventType::ExecutionFailed, Uuid::new_v4()));
    }
}
