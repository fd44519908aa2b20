// pgbackd/src/store/postgres.rs
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::info;
use uuid::Uuid;

use super::{Catalog, ExecutionFilter, ExecutionStore, RestorationFilter, RestorationStore};
use crate::errors::{AppError, Result};
use crate::model::{
    BackupConfig, Database, Destination, EventType, Execution, ExecutionDetail, ExecutionUpdate,
    NewBackupConfig, NewDatabase, NewDestination, NewWebhook, PageRequest, PaginateResponse,
    Restoration, RestorationStatus, Webhook,
};

const MIGRATIONS: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS databases (
        id UUID PRIMARY KEY,
        name TEXT NOT NULL,
        pg_version TEXT NOT NULL,
        connection_string TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )"#,
    r#"CREATE TABLE IF NOT EXISTS destinations (
        id UUID PRIMARY KEY,
        name TEXT NOT NULL,
        bucket_name TEXT NOT NULL,
        region TEXT NOT NULL,
        endpoint TEXT NOT NULL,
        access_key TEXT NOT NULL,
        secret_key TEXT NOT NULL,
        test_ok BOOLEAN,
        test_error TEXT,
        last_test_at TIMESTAMPTZ,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )"#,
    r#"CREATE TABLE IF NOT EXISTS backups (
        id UUID PRIMARY KEY,
        database_id UUID NOT NULL REFERENCES databases (id) ON DELETE CASCADE,
        destination_id UUID REFERENCES destinations (id) ON DELETE CASCADE,
        is_local BOOLEAN NOT NULL,
        name TEXT NOT NULL,
        cron_expression TEXT NOT NULL,
        time_zone TEXT NOT NULL DEFAULT 'UTC',
        is_active BOOLEAN NOT NULL DEFAULT TRUE,
        dest_dir TEXT NOT NULL DEFAULT '',
        retention_days SMALLINT NOT NULL DEFAULT 0 CHECK (retention_days >= 0),
        opt_data_only BOOLEAN NOT NULL DEFAULT FALSE,
        opt_schema_only BOOLEAN NOT NULL DEFAULT FALSE,
        opt_clean BOOLEAN NOT NULL DEFAULT FALSE,
        opt_if_exists BOOLEAN NOT NULL DEFAULT FALSE,
        opt_create BOOLEAN NOT NULL DEFAULT FALSE,
        opt_no_comments BOOLEAN NOT NULL DEFAULT FALSE,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        CONSTRAINT backups_local_xor_destination CHECK (
            (is_local AND destination_id IS NULL) OR (NOT is_local AND destination_id IS NOT NULL)
        )
    )"#,
    r#"CREATE TABLE IF NOT EXISTS executions (
        id UUID PRIMARY KEY,
        backup_id UUID NOT NULL REFERENCES backups (id) ON DELETE CASCADE,
        status TEXT NOT NULL CHECK (status IN ('running', 'success', 'failed', 'deleted')),
        message TEXT,
        path TEXT,
        started_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        finished_at TIMESTAMPTZ,
        deleted_at TIMESTAMPTZ,
        file_size BIGINT
    )"#,
    r#"CREATE UNIQUE INDEX IF NOT EXISTS executions_one_running_per_backup
        ON executions (backup_id) WHERE status = 'running'"#,
    r#"CREATE INDEX IF NOT EXISTS executions_backup_started
        ON executions (backup_id, started_at DESC)"#,
    r#"CREATE TABLE IF NOT EXISTS restorations (
        id UUID PRIMARY KEY,
        execution_id UUID NOT NULL REFERENCES executions (id) ON DELETE CASCADE,
        database_id UUID REFERENCES databases (id) ON DELETE CASCADE,
        status TEXT NOT NULL CHECK (status IN ('running', 'success', 'failed')),
        message TEXT,
        started_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        finished_at TIMESTAMPTZ
    )"#,
    r#"CREATE TABLE IF NOT EXISTS webhooks (
        id UUID PRIMARY KEY,
        name TEXT NOT NULL,
        event_type TEXT NOT NULL,
        target_ids UUID[] NOT NULL DEFAULT '{}',
        is_active BOOLEAN NOT NULL DEFAULT TRUE,
        method TEXT NOT NULL DEFAULT 'POST',
        url TEXT NOT NULL,
        headers TEXT,
        body TEXT,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )"#,
];

const EXECUTION_COLUMNS: &str =
    "id, backup_id, status, message, path, started_at, updated_at, finished_at, deleted_at, file_size";

const DETAIL_SELECT: &str = r#"
    SELECT e.id, e.backup_id, e.status, e.message, e.path, e.started_at, e.updated_at,
           e.finished_at, e.deleted_at, e.file_size,
           b.name AS backup_name, b.is_local,
           d.name AS database_name, d.pg_version AS database_pg_version,
           dest.name AS destination_name
    FROM executions e
    JOIN backups b ON b.id = e.backup_id
    JOIN databases d ON d.id = b.database_id
    LEFT JOIN destinations dest ON dest.id = b.destination_id
"#;

const DETAIL_FILTER: &str = r#"
    WHERE ($1::uuid IS NULL OR e.backup_id = $1)
      AND ($2::uuid IS NULL OR b.database_id = $2)
      AND ($3::uuid IS NULL OR b.destination_id = $3)
      AND ($4::text IS NULL OR e.status = $4)
"#;

const RESTORATION_COLUMNS: &str =
    "id, execution_id, database_id, status, message, started_at, updated_at, finished_at";

/// PostgreSQL-backed store.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| AppError::Connection(format!("failed to connect to the store database: {e}")))?;
        Ok(Self { pool })
    }

    /// Creates the tables the core needs. Safe to run on every start.
    pub async fn migrate(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for statement in MIGRATIONS {
            sqlx::query(statement).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        info!(statements = MIGRATIONS.len(), "store schema is up to date");
        Ok(())
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db.is_unique_violation(),
        _ => false,
    }
}

#[async_trait]
impl Catalog for PgStore {
    async fn create_backup(&self, new: NewBackupConfig) -> Result<BackupConfig> {
        new.validate()?;
        self.get_database(new.database_id).await?;
        if let Some(destination_id) = new.destination_id {
            self.get_destination(destination_id).await?;
        }

        let backup = sqlx::query_as::<_, BackupConfig>(
            r#"INSERT INTO backups (
                id, database_id, destination_id, is_local, name, cron_expression, time_zone,
                is_active, dest_dir, retention_days, opt_data_only, opt_schema_only, opt_clean,
                opt_if_exists, opt_create, opt_no_comments
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            RETURNING *"#,
        )
        .bind(Uuid::new_v4())
        .bind(new.database_id)
        .bind(new.destination_id)
        .bind(new.is_local)
        .bind(&new.name)
        .bind(&new.cron_expression)
        .bind(&new.time_zone)
        .bind(new.is_active)
        .bind(&new.dest_dir)
        .bind(new.retention_days)
        .bind(new.options.data_only)
        .bind(new.options.schema_only)
        .bind(new.options.clean)
        .bind(new.options.if_exists)
        .bind(new.options.create)
        .bind(new.options.no_comments)
        .fetch_one(&self.pool)
        .await?;
        Ok(backup)
    }

    async fn get_backup(&self, id: Uuid) -> Result<BackupConfig> {
        sqlx::query_as::<_, BackupConfig>("SELECT * FROM backups WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| AppError::not_found("backup", id))
    }

    async fn list_backups(&self) -> Result<Vec<BackupConfig>> {
        Ok(
            sqlx::query_as::<_, BackupConfig>("SELECT * FROM backups ORDER BY created_at, id")
                .fetch_all(&self.pool)
                .await?,
        )
    }

    async fn list_active_backups(&self) -> Result<Vec<BackupConfig>> {
        Ok(sqlx::query_as::<_, BackupConfig>(
            "SELECT * FROM backups WHERE is_active ORDER BY created_at, id",
        )
        .fetch_all(&self.pool)
        .await?)
    }

    async fn create_database(&self, new: NewDatabase) -> Result<Database> {
        Ok(sqlx::query_as::<_, Database>(
            "INSERT INTO databases (id, name, pg_version, connection_string)
             VALUES ($1, $2, $3, $4) RETURNING *",
        )
        .bind(Uuid::new_v4())
        .bind(&new.name)
        .bind(&new.pg_version)
        .bind(&new.connection_string)
        .fetch_one(&self.pool)
        .await?)
    }

    async fn get_database(&self, id: Uuid) -> Result<Database> {
        sqlx::query_as::<_, Database>("SELECT * FROM databases WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| AppError::not_found("database", id))
    }

    async fn create_destination(&self, new: NewDestination) -> Result<Destination> {
        Ok(sqlx::query_as::<_, Destination>(
            "INSERT INTO destinations (id, name, bucket_name, region, endpoint, access_key, secret_key)
             VALUES ($1, $2, $3, $4, $5, $6, $7) RETURNING *",
        )
        .bind(Uuid::new_v4())
        .bind(&new.name)
        .bind(&new.bucket_name)
        .bind(&new.region)
        .bind(&new.endpoint)
        .bind(&new.access_key)
        .bind(&new.secret_key)
        .fetch_one(&self.pool)
        .await?)
    }

    async fn get_destination(&self, id: Uuid) -> Result<Destination> {
        sqlx::query_as::<_, Destination>("SELECT * FROM destinations WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| AppError::not_found("destination", id))
    }

    async fn record_destination_test(
        &self,
        id: Uuid,
        ok: bool,
        error: Option<String>,
    ) -> Result<Destination> {
        sqlx::query_as::<_, Destination>(
            "UPDATE destinations SET test_ok = $2, test_error = $3, last_test_at = NOW()
             WHERE id = $1 RETURNING *",
        )
        .bind(id)
        .bind(ok)
        .bind(error)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| AppError::not_found("destination", id))
    }

    async fn create_webhook(&self, new: NewWebhook) -> Result<Webhook> {
        Ok(sqlx::query_as::<_, Webhook>(
            "INSERT INTO webhooks (id, name, event_type, target_ids, is_active, method, url, headers, body)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) RETURNING *",
        )
        .bind(Uuid::new_v4())
        .bind(&new.name)
        .bind(new.event_type.as_str())
        .bind(&new.target_ids)
        .bind(new.is_active)
        .bind(&new.method)
        .bind(&new.url)
        .bind(&new.headers)
        .bind(&new.body)
        .fetch_one(&self.pool)
        .await?)
    }

    async fn list_active_webhooks(&self, event_type: EventType) -> Result<Vec<Webhook>> {
        Ok(sqlx::query_as::<_, Webhook>(
            "SELECT * FROM webhooks WHERE is_active AND event_type = $1 ORDER BY created_at",
        )
        .bind(event_type.as_str())
        .fetch_all(&self.pool)
        .await?)
    }
}

#[async_trait]
impl ExecutionStore for PgStore {
    async fn create_execution(&self, backup_id: Uuid) -> Result<Execution> {
        self.get_backup(backup_id).await?;
        let inserted = sqlx::query_as::<_, Execution>(&format!(
            "INSERT INTO executions (id, backup_id, status) VALUES ($1, $2, 'running')
             RETURNING {EXECUTION_COLUMNS}"
        ))
        .bind(Uuid::new_v4())
        .bind(backup_id)
        .fetch_one(&self.pool)
        .await;

        match inserted {
            Ok(execution) => Ok(execution),
            Err(e) if is_unique_violation(&e) => Err(AppError::AlreadyRunning(backup_id)),
            Err(e) => Err(e.into()),
        }
    }

    async fn update_execution(&self, id: Uuid, update: ExecutionUpdate) -> Result<Execution> {
        let allowed_from: Vec<String> = update
            .status
            .predecessors()
            .iter()
            .map(|s| s.as_str().to_string())
            .collect();

        let updated = sqlx::query_as::<_, Execution>(&format!(
            r#"UPDATE executions SET
                status = $2,
                message = COALESCE($3, message),
                path = COALESCE($4, path),
                file_size = COALESCE($5, file_size),
                finished_at = CASE WHEN $6 THEN NOW() ELSE finished_at END,
                deleted_at = CASE WHEN $2 = 'deleted' THEN NOW() ELSE deleted_at END,
                updated_at = NOW()
            WHERE id = $1 AND status = ANY($7)
            RETURNING {EXECUTION_COLUMNS}"#
        ))
        .bind(id)
        .bind(update.status.as_str())
        .bind(&update.message)
        .bind(&update.path)
        .bind(update.file_size)
        .bind(update.finished)
        .bind(&allowed_from)
        .fetch_optional(&self.pool)
        .await?;

        match updated {
            Some(execution) => Ok(execution),
            None => {
                let current = self.get_execution(id).await?;
                Err(AppError::InvalidTransition {
                    entity: "execution",
                    id,
                    from: current.status.to_string(),
                    to: update.status.to_string(),
                })
            }
        }
    }

    async fn get_execution(&self, id: Uuid) -> Result<Execution> {
        sqlx::query_as::<_, Execution>(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM executions WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| AppError::not_found("execution", id))
    }

    async fn get_execution_detail(&self, id: Uuid) -> Result<ExecutionDetail> {
        sqlx::query_as::<_, ExecutionDetail>(&format!("{DETAIL_SELECT} WHERE e.id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| AppError::not_found("execution", id))
    }

    async fn list_backup_executions(&self, backup_id: Uuid) -> Result<Vec<Execution>> {
        Ok(sqlx::query_as::<_, Execution>(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM executions WHERE backup_id = $1
             ORDER BY started_at DESC, id DESC"
        ))
        .bind(backup_id)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn paginate_executions(
        &self,
        filter: ExecutionFilter,
        page: PageRequest,
    ) -> Result<(PaginateResponse, Vec<ExecutionDetail>)> {
        let page = PageRequest::new(page.page, page.limit);
        let status = filter.status.map(|s| s.as_str());

        let total: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM executions e JOIN backups b ON b.id = e.backup_id {DETAIL_FILTER}"
        ))
        .bind(filter.backup_id)
        .bind(filter.database_id)
        .bind(filter.destination_id)
        .bind(status)
        .fetch_one(&self.pool)
        .await?;

        let rows = sqlx::query_as::<_, ExecutionDetail>(&format!(
            "{DETAIL_SELECT} {DETAIL_FILTER} ORDER BY e.started_at DESC, e.id DESC LIMIT $5 OFFSET $6"
        ))
        .bind(filter.backup_id)
        .bind(filter.database_id)
        .bind(filter.destination_id)
        .bind(status)
        .bind(i64::from(page.limit))
        .bind(i64::try_from(page.offset()).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        let total = u64::try_from(total).unwrap_or_default();
        Ok((PaginateResponse::new(total, page), rows))
    }

    async fn list_expired_executions(
        &self,
        backup_id: Uuid,
        cutoff: DateTime<Utc>,
        keep: Uuid,
    ) -> Result<Vec<Execution>> {
        Ok(sqlx::query_as::<_, Execution>(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM executions
             WHERE backup_id = $1 AND id <> $3 AND started_at < $2
               AND status IN ('success', 'failed')
             ORDER BY started_at DESC"
        ))
        .bind(backup_id)
        .bind(cutoff)
        .bind(keep)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn fail_stale_running(&self, message: &str) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE executions SET status = 'failed', message = $1, finished_at = NOW(), updated_at = NOW()
             WHERE status = 'running'",
        )
        .bind(message)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl RestorationStore for PgStore {
    async fn create_restoration(
        &self,
        execution_id: Uuid,
        database_id: Option<Uuid>,
    ) -> Result<Restoration> {
        self.get_execution(execution_id).await?;
        Ok(sqlx::query_as::<_, Restoration>(&format!(
            "INSERT INTO restorations (id, execution_id, database_id, status)
             VALUES ($1, $2, $3, 'running') RETURNING {RESTORATION_COLUMNS}"
        ))
        .bind(Uuid::new_v4())
        .bind(execution_id)
        .bind(database_id)
        .fetch_one(&self.pool)
        .await?)
    }

    async fn finish_restoration(
        &self,
        id: Uuid,
        status: RestorationStatus,
        message: String,
    ) -> Result<Restoration> {
        if status == RestorationStatus::Running {
            return Err(AppError::InvalidInput(
                "a restoration can only finish as success or failed".into(),
            ));
        }
        let updated = sqlx::query_as::<_, Restoration>(&format!(
            "UPDATE restorations SET status = $2, message = $3, finished_at = NOW(), updated_at = NOW()
             WHERE id = $1 AND status = 'running' RETURNING {RESTORATION_COLUMNS}"
        ))
        .bind(id)
        .bind(status.as_str())
        .bind(&message)
        .fetch_optional(&self.pool)
        .await?;

        match updated {
            Some(restoration) => Ok(restoration),
            None => {
                let current = self.get_restoration(id).await?;
                Err(AppError::InvalidTransition {
                    entity: "restoration",
                    id,
                    from: current.status.to_string(),
                    to: status.to_string(),
                })
            }
        }
    }

    async fn get_restoration(&self, id: Uuid) -> Result<Restoration> {
        sqlx::query_as::<_, Restoration>(&format!(
            "SELECT {RESTORATION_COLUMNS} FROM restorations WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| AppError::not_found("restoration", id))
    }

    async fn paginate_restorations(
        &self,
        filter: RestorationFilter,
        page: PageRequest,
    ) -> Result<(PaginateResponse, Vec<Restoration>)> {
        let page = PageRequest::new(page.page, page.limit);
        let predicate = "WHERE ($1::uuid IS NULL OR execution_id = $1)
                           AND ($2::uuid IS NULL OR database_id = $2)";

        let total: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM restorations {predicate}"))
            .bind(filter.execution_id)
            .bind(filter.database_id)
            .fetch_one(&self.pool)
            .await?;

        let rows = sqlx::query_as::<_, Restoration>(&format!(
            "SELECT {RESTORATION_COLUMNS} FROM restorations {predicate}
             ORDER BY started_at DESC, id DESC LIMIT $3 OFFSET $4"
        ))
        .bind(filter.execution_id)
        .bind(filter.database_id)
        .bind(i64::from(page.limit))
        .bind(i64::try_from(page.offset()).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        let total = u64::try_from(total).unwrap_or_default();
        Ok((PaginateResponse::new(total, page), rows))
    }
}
