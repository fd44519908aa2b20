//! pgbackd: scheduled PostgreSQL backups and restores
//!
//! Provides the CLI entry point for the backup service

// pgbackd/src/main.rs
use anyhow::{Context, Result};
use pgbackd::config::{AppConfig, DEFAULT_CONFIG_PATH, EnvOverrides};
use pgbackd::model::{ExecutionStatus, RestorationStatus};
use pgbackd::store::PgStore;
use pgbackd::utils::logging::init_tracing;
use pgbackd::Core;
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

const USAGE: &str = "Usage: pgbackd <command>

Commands:
  serve                                   Schedule every active backup and run until Ctrl-C
  run <backup_id>                         Run one backup now and wait for it
  restore <execution_id> [database_id]    Restore an execution and wait for it
  migrate                                 Create or update the catalog tables
  test-database <database_id>             Check that a registered database is reachable
  test-destination <destination_id>       Check a destination bucket and record the result";

/// Main entry point for the backup service
#[tokio::main]
async fn main() -> ExitCode {
    match run_app().await {
        Ok(_) => {
            println!("✅ Operation completed successfully.");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("❌ Error: {:?}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run_app() -> Result<()> {
    dotenv::dotenv().ok();

    let config_path = env::var("PGBACKD_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));
    let app_config = AppConfig::load_from_json(&config_path, EnvOverrides::from_env())
        .context(format!("Failed to load application configuration from {}", config_path.display()))?;
    init_tracing(&app_config.log_filter);

    let args: Vec<String> = env::args().skip(1).collect();
    let command = args.first().map(|s| s.trim().to_string()).unwrap_or_default();

    match command.as_str() {
        "serve" => serve(&app_config).await.context("Service stopped with an error")?,
        "run" => {
            let backup_id = parse_id(args.get(1), "backup_id")?;
            run_once(&app_config, backup_id).await.context("Backup run failed")?;
        }
        "restore" => {
            let execution_id = parse_id(args.get(1), "execution_id")?;
            let database_id = args.get(2).map(|v| parse_id(Some(v), "database_id")).transpose()?;
            restore_once(&app_config, execution_id, database_id)
                .await
                .context("Restore failed")?;
        }
        "migrate" => {
            let url = app_config
                .database_url
                .as_deref()
                .context("database_url must be set in config.json or PGBACKD_DATABASE_URL to migrate")?;
            let store = PgStore::connect(url, app_config.db_max_connections).await?;
            store.migrate().await.context("Migration failed")?;
        }
        "test-database" => {
            let database_id = parse_id(args.get(1), "database_id")?;
            let core = Core::from_config(&app_config).await?;
            core.service.test_database(database_id).await?;
        }
        "test-destination" => {
            let destination_id = parse_id(args.get(1), "destination_id")?;
            let core = Core::from_config(&app_config).await?;
            let destination = core.service.test_destination(destination_id).await?;
            if destination.test_ok != Some(true) {
                anyhow::bail!(
                    "Destination {} failed its test: {}",
                    destination.name,
                    destination.test_error.unwrap_or_default()
                );
            }
        }
        _ => {
            println!("{USAGE}");
            anyhow::bail!("Invalid command '{}'", command);
        }
    }
    Ok(())
}

fn parse_id(value: Option<&String>, name: &str) -> Result<Uuid> {
    let value = value.with_context(|| format!("missing <{name}> argument\n\n{USAGE}"))?;
    Uuid::parse_str(value.trim()).with_context(|| format!("<{name}> must be a UUID, got '{value}'"))
}

async fn serve(app_config: &AppConfig) -> Result<()> {
    let core = Core::from_config(app_config).await?;
    core.recover_interrupted().await?;
    core.scheduler.schedule_all_active().await?;

    let shutdown = CancellationToken::new();
    let sweep = core.spawn_retention_sweep(shutdown.clone());
    info!("pgbackd is running, press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("shutting down, in-flight runs are left to finish");

    shutdown.cancel();
    core.scheduler.shutdown().await;
    if let Some(sweep) = sweep {
        let _ = sweep.await;
    }
    Ok(())
}

async fn run_once(app_config: &AppConfig, backup_id: Uuid) -> Result<()> {
    let core = Core::from_config(app_config).await?;
    let ticket = core.scheduler.trigger(backup_id).await?;
    println!("🚀 Backup run {} started...", ticket.execution_id);

    let cancel = ticket.cancellation_token();
    let wait = ticket.wait();
    tokio::pin!(wait);
    let execution = tokio::select! {
        done = &mut wait => done?,
        _ = tokio::signal::ctrl_c() => {
            cancel.cancel();
            wait.await?
        }
    };
    core.scheduler.shutdown().await;

    match execution.status {
        ExecutionStatus::Success => {
            println!(
                "Backup stored at {} ({} bytes)",
                execution.path.unwrap_or_default(),
                execution.file_size.unwrap_or_default()
            );
            Ok(())
        }
        _ => anyhow::bail!(
            "Backup run {} failed: {}",
            execution.id,
            execution.message.unwrap_or_default()
        ),
    }
}

async fn restore_once(
    app_config: &AppConfig,
    execution_id: Uuid,
    database_id: Option<Uuid>,
) -> Result<()> {
    let core = Core::from_config(app_config).await?;
    let ticket = core.service.start_restoration(execution_id, database_id).await?;
    println!("🔄 Restoration {} started...", ticket.restoration_id);

    let restoration = ticket.wait().await?;
    core.scheduler.shutdown().await;
    match restoration.status {
        RestorationStatus::Success => Ok(()),
        _ => anyhow::bail!(
            "Restoration {} failed: {}",
            restoration.id,
            restoration.message.unwrap_or_default()
        ),
    }
}
