// pgbackd/src/config/mod.rs
use anyhow::{Context, Result};
use serde::Deserialize;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::backup::{DEFAULT_MAX_RUN_DURATION, RunnerSettings};
use crate::restore::{DEFAULT_MAX_RESTORE_DURATION, RestoreSettings};
use crate::utils::{ToolCommand, ToolLocator};

pub const DEFAULT_CONFIG_PATH: &str = "config.json";
const DEFAULT_RETENTION_SWEEP_SECS: u64 = 60 * 60;
const DEFAULT_DB_MAX_CONNECTIONS: u32 = 5;

// Shape of config.json
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawJsonConfig {
    pub database_url: Option<String>,
    pub db_max_connections: Option<u32>,
    pub encryption_key: Option<String>,
    pub backups_root: Option<PathBuf>,
    pub temp_dir: Option<PathBuf>,
    pub pg_bin_root: Option<PathBuf>,
    pub pg_dump_path: Option<PathBuf>,
    pub psql_path: Option<PathBuf>,
    pub max_run_duration_secs: Option<u64>,
    pub max_restore_duration_secs: Option<u64>,
    /// `0` turns the periodic sweep off.
    pub retention_sweep_interval_secs: Option<u64>,
    pub log_filter: Option<String>,
}

/// Values read from the environment once, in `main`, and passed in.
#[derive(Clone, Default)]
pub struct EnvOverrides {
    pub database_url: Option<String>,
    pub encryption_key: Option<String>,
}

impl EnvOverrides {
    pub fn from_env() -> Self {
        let read = |name: &str| std::env::var(name).ok().filter(|v| !v.trim().is_empty());
        Self {
            database_url: read("PGBACKD_DATABASE_URL"),
            encryption_key: read("PGBACKD_ENCRYPTION_KEY"),
        }
    }
}

#[derive(Clone)]
pub struct AppConfig {
    /// `None` keeps everything in memory for the life of the process.
    pub database_url: Option<String>,
    pub db_max_connections: u32,
    pub encryption_key: String,
    pub backups_root: PathBuf,
    pub temp_dir: PathBuf,
    pub tools: ToolLocator,
    pub max_run_duration: Duration,
    pub max_restore_duration: Duration,
    pub retention_sweep_interval: Option<Duration>,
    pub log_filter: String,
}

impl fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppConfig")
            .field("database_url", &self.database_url.as_ref().map(|_| "<redacted>"))
            .field("encryption_key", &"<redacted>")
            .field("backups_root", &self.backups_root)
            .field("temp_dir", &self.temp_dir)
            .field("tools", &self.tools)
            .field("max_run_duration", &self.max_run_duration)
            .field("max_restore_duration", &self.max_restore_duration)
            .field("retention_sweep_interval", &self.retention_sweep_interval)
            .field("log_filter", &self.log_filter)
            .finish()
    }
}

impl AppConfig {
    pub fn load_from_json(config_path: &Path, overrides: EnvOverrides) -> Result<Self> {
        let config_content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file at {}", config_path.display()))?;
        let raw_json_config: RawJsonConfig = serde_json::from_str(&config_content)
            .with_context(|| {
                format!(
                    "Failed to parse JSON from config file at {}",
                    config_path.display()
                )
            })?;
        Self::from_raw(raw_json_config, overrides)
    }

    pub fn from_raw(raw: RawJsonConfig, overrides: EnvOverrides) -> Result<Self> {
        let encryption_key = overrides
            .encryption_key
            .or(raw.encryption_key)
            .filter(|k| !k.trim().is_empty())
            .context("encryption_key must be set in config.json or PGBACKD_ENCRYPTION_KEY")?;

        let database_url = overrides
            .database_url
            .or(raw.database_url)
            .filter(|u| !u.trim().is_empty());

        let backups_root = raw.backups_root.unwrap_or_else(|| PathBuf::from("backups"));
        if backups_root.as_os_str().is_empty() {
            return Err(anyhow::anyhow!("backups_root cannot be empty in config.json."));
        }
        // Local execution paths are stored as given, so they must not depend on the CWD.
        let backups_root = if backups_root.is_relative() {
            std::env::current_dir()
                .context("Failed to resolve the current directory for backups_root")?
                .join(backups_root)
        } else {
            backups_root
        };
        let temp_dir = raw.temp_dir.unwrap_or_else(std::env::temp_dir);
        if temp_dir.as_os_str().is_empty() {
            return Err(anyhow::anyhow!("temp_dir cannot be empty in config.json."));
        }

        let max_run_duration = positive_secs(raw.max_run_duration_secs, "max_run_duration_secs")?
            .unwrap_or(DEFAULT_MAX_RUN_DURATION);
        let max_restore_duration =
            positive_secs(raw.max_restore_duration_secs, "max_restore_duration_secs")?
                .unwrap_or(DEFAULT_MAX_RESTORE_DURATION);
        let retention_sweep_interval = match raw
            .retention_sweep_interval_secs
            .unwrap_or(DEFAULT_RETENTION_SWEEP_SECS)
        {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };

        let db_max_connections = raw.db_max_connections.unwrap_or(DEFAULT_DB_MAX_CONNECTIONS);
        if db_max_connections == 0 {
            return Err(anyhow::anyhow!("db_max_connections must be at least 1."));
        }

        Ok(AppConfig {
            database_url,
            db_max_connections,
            encryption_key,
            backups_root,
            temp_dir,
            tools: ToolLocator {
                pg_bin_root: raw.pg_bin_root,
                pg_dump: raw.pg_dump_path.map(ToolCommand::new),
                psql: raw.psql_path.map(ToolCommand::new),
            },
            max_run_duration,
            max_restore_duration,
            retention_sweep_interval,
            log_filter: raw.log_filter.unwrap_or_else(|| "info".to_string()),
        })
    }

    pub fn runner_settings(&self) -> RunnerSettings {
        RunnerSettings {
            backups_root: self.backups_root.clone(),
            temp_dir: self.temp_dir.clone(),
            tools: self.tools.clone(),
            max_run_duration: self.max_run_duration,
        }
    }

    pub fn restore_settings(&self) -> RestoreSettings {
        RestoreSettings {
            temp_dir: self.temp_dir.clone(),
            tools: self.tools.clone(),
            max_restore_duration: self.max_restore_duration,
        }
    }
}

fn positive_secs(value: Option<u64>, field: &str) -> Result<Option<Duration>> {
    match value {
        Some(0) => Err(anyhow::anyhow!("{field} must be greater than zero.")),
        Some(secs) => Ok(Some(Duration::from_secs(secs))),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(value: serde_json::Value) -> RawJsonConfig {
        serde_json::from_value(value).expect("valid raw config")
    }

    #[test]
    fn defaults_fill_in_the_optional_fields() -> anyhow::Result<()> {
        let config = AppConfig::from_raw(raw(json!({ "encryption_key": "s3cret" })), EnvOverrides::default())?;
        assert!(config.database_url.is_none());
        assert!(config.backups_root.is_absolute());
        assert_eq!(config.backups_root, std::env::current_dir()?.join("backups"));
        assert_eq!(config.max_run_duration, DEFAULT_MAX_RUN_DURATION);
        assert_eq!(config.retention_sweep_interval, Some(Duration::from_secs(3600)));
        assert_eq!(config.log_filter, "info");
        Ok(())
    }

    #[test]
    fn environment_wins_over_the_file() -> anyhow::Result<()> {
        let file = raw(json!({
            "database_url": "postgresql://file/pgbackd",
            "encryption_key": "from-file",
            "pg_dump_path": "/opt/pg16/bin/pg_dump",
            "retention_sweep_interval_secs": 0
        }));
        let overrides = EnvOverrides {
            database_url: Some("postgresql://env/pgbackd".into()),
            encryption_key: Some("from-env".into()),
        };
        let config = AppConfig::from_raw(file, overrides)?;
        assert_eq!(config.database_url.as_deref(), Some("postgresql://env/pgbackd"));
        assert_eq!(config.encryption_key, "from-env");
        assert_eq!(
            config.tools.pg_dump,
            Some(ToolCommand::new("/opt/pg16/bin/pg_dump"))
        );
        assert!(config.retention_sweep_interval.is_none());
        assert!(!format!("{config:?}").contains("from-env"));
        Ok(())
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(AppConfig::from_raw(raw(json!({})), EnvOverrides::default()).is_err());
        assert!(
            AppConfig::from_raw(
                raw(json!({ "encryption_key": "k", "max_run_duration_secs": 0 })),
                EnvOverrides::default()
            )
            .is_err()
        );
        assert!(
            serde_json::from_value::<RawJsonConfig>(json!({ "source_database_url": "x" })).is_err()
        );
    }

    #[test]
    fn loads_from_a_file() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("config.json");
        fs::write(
            &path,
            r#"{ "encryption_key": "k", "backups_root": "/srv/backups", "max_run_duration_secs": 60 }"#,
        )?;
        let config = AppConfig::load_from_json(&path, EnvOverrides::default())?;
        assert_eq!(config.backups_root, PathBuf::from("/srv/backups"));
        assert_eq!(config.runner_settings().max_run_duration, Duration::from_secs(60));
        assert!(AppConfig::load_from_json(&dir.path().join("missing.json"), EnvOverrides::default()).is_err());
        Ok(())
    }
}
