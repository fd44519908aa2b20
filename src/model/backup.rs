// pgbackd/src/model/backup.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::errors::{AppError, Result};
use crate::scheduler::cron::CronSchedule;

/// `pg_dump` switches carried by a backup configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct DumpOptions {
    #[sqlx(rename = "opt_data_only")]
    pub data_only: bool,
    #[sqlx(rename = "opt_schema_only")]
    pub schema_only: bool,
    #[sqlx(rename = "opt_clean")]
    pub clean: bool,
    #[sqlx(rename = "opt_if_exists")]
    pub if_exists: bool,
    #[sqlx(rename = "opt_create")]
    pub create: bool,
    #[sqlx(rename = "opt_no_comments")]
    pub no_comments: bool,
}

impl DumpOptions {
    pub fn validate(&self) -> Result<()> {
        if self.data_only && self.schema_only {
            return Err(AppError::InvalidInput(
                "data-only and schema-only dump options are mutually exclusive".into(),
            ));
        }
        if self.if_exists && !self.clean {
            return Err(AppError::InvalidInput(
                "the if-exists dump option requires the clean option".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct BackupConfig {
    pub id: Uuid,
    pub database_id: Uuid,
    pub destination_id: Option<Uuid>,
    pub is_local: bool,
    pub name: String,
    pub cron_expression: String,
    pub time_zone: String,
    pub is_active: bool,
    pub dest_dir: String,
    pub retention_days: i16,
    #[sqlx(flatten)]
    #[serde(flatten)]
    pub options: DumpOptions,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields supplied when a backup configuration is created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewBackupConfig {
    pub database_id: Uuid,
    pub destination_id: Option<Uuid>,
    pub is_local: bool,
    pub name: String,
    pub cron_expression: String,
    pub time_zone: String,
    pub is_active: bool,
    pub dest_dir: String,
    pub retention_days: i16,
    #[serde(flatten)]
    pub options: DumpOptions,
}

impl Default for NewBackupConfig {
    fn default() -> Self {
        Self {
            database_id: Uuid::nil(),
            destination_id: None,
            is_local: true,
            name: String::new(),
            cron_expression: "0 0 * * *".to_string(),
            time_zone: "UTC".to_string(),
            is_active: true,
            dest_dir: String::new(),
            retention_days: 0,
            options: DumpOptions::default(),
        }
    }
}

impl NewBackupConfig {
    /// Checks the creation-time invariants of a backup configuration.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(AppError::InvalidInput("backup name cannot be empty".into()));
        }
        match (self.is_local, self.destination_id) {
            (true, Some(_)) => {
                return Err(AppError::InvalidInput(
                    "a local backup cannot reference a destination".into(),
                ));
            }
            (false, None) => {
                return Err(AppError::InvalidInput(
                    "a remote backup must reference a destination".into(),
                ));
            }
            _ => {}
        }
        if self.retention_days < 0 {
            return Err(AppError::InvalidInput(format!(
                "retention days must be zero or positive, got {}",
                self.retention_days
            )));
        }
        CronSchedule::parse(&self.cron_expression, &self.time_zone)?;
        self.options.validate()
    }

    pub fn into_config(self, id: Uuid, now: DateTime<Utc>) -> BackupConfig {
        BackupConfig {
            id,
            database_id: self.database_id,
            destination_id: self.destination_id,
            is_local: self.is_local,
            name: self.name,
            cron_expression: self.cron_expression,
            time_zone: self.time_zone,
            is_active: self.is_active,
            dest_dir: self.dest_dir,
            retention_days: self.retention_days,
            options: self.options,
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local(name: &str) -> NewBackupConfig {
        NewBackupConfig {
            database_id: Uuid::new_v4(),
            name: name.into(),
            ..Default::default()
        }
    }

    #[test]
    fn local_flag_and_destination_must_agree() {
        assert!(local("nightly").validate().is_ok());

        let mut with_destination = local("nightly");
        with_destination.destination_id = Some(Uuid::new_v4());
        assert!(matches!(
            with_destination.validate(),
            Err(AppError::InvalidInput(_))
        ));

        let remote_without_destination = NewBackupConfig {
            is_local: false,
            ..local("nightly")
        };
        assert!(remote_without_destination.validate().is_err());

        let remote = NewBackupConfig {
            is_local: false,
            destination_id: Some(Uuid::new_v4()),
            ..local("nightly")
        };
        assert!(remote.validate().is_ok());
    }

    #[test]
    fn rejects_bad_schedule_and_conflicting_options() {
        let bad_cron = NewBackupConfig {
            cron_expression: "every tuesday".into(),
            ..local("weekly")
        };
        assert!(matches!(
            bad_cron.validate(),
            Err(AppError::InvalidSchedule(_))
        ));

        let bad_zone = NewBackupConfig {
            time_zone: "Mars/Olympus_Mons".into(),
            ..local("weekly")
        };
        assert!(matches!(
            bad_zone.validate(),
            Err(AppError::InvalidSchedule(_))
        ));

        let mut conflicting = local("weekly");
        conflicting.options.data_only = true;
        conflicting.options.schema_only = true;
        assert!(conflicting.validate().is_err());

        let mut dangling_if_exists = local("weekly");
        dangling_if_exists.options.if_exists = true;
        assert!(dangling_if_exists.validate().is_err());
        dangling_if_exists.options.clean = true;
        assert!(dangling_if_exists.validate().is_ok());
    }

    #[test]
    fn rejects_blank_name_and_negative_retention() {
        assert!(local("   ").validate().is_err());
        let negative = NewBackupConfig {
            retention_days: -1,
            ..local("nightly")
        };
        assert!(negative.validate().is_err());
    }
}
