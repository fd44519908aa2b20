// pgbackd/src/utils/setting.rs
use sqlx::{Connection, PgConnection};
use tracing::{info, warn};

use crate::errors::{AppError, Result};

/// Opens and closes a connection to check that a database is reachable.
///
/// The connection string is never logged, only the database label.
pub async fn check_db_connection(label: &str, db_url: &str) -> Result<()> {
    match PgConnection::connect(db_url).await {
        Ok(conn) => {
            let _ = conn.close().await;
            info!(database = label, "database connection check succeeded");
            Ok(())
        }
        Err(e) => {
            warn!(database = label, error = %e, "database connection check failed");
            Err(AppError::Connection(format!(
                "failed to connect to database {label}: {e}"
            )))
        }
    }
}
