// pgbackd/src/restore/db_restore.rs
use std::process::Stdio;

use tokio::io::AsyncRead;
use tracing::{debug, info};

use crate::backup::artifact::{StreamError, decompress_stream};
use crate::errors::{AppError, Result};
use crate::model::Database;
use crate::utils::ToolCommand;
use crate::utils::process::{classify_tool_failure, connection_label, read_tail};

pub fn psql_args(connection_string: &str) -> Vec<String> {
    vec![
        "-X".to_string(), // Do not read psqlrc
        "-q".to_string(),
        "-v".to_string(),
        "ON_ERROR_STOP=1".to_string(),
        format!("--dbname={connection_string}"),
    ]
}

/// Gunzips a dump into `psql`'s stdin. Returns the number of SQL bytes fed.
///
/// A failed statement stops psql, and its exit code decides the outcome.
pub async fn load_dump<R>(tool: &ToolCommand, target: &Database, artifact: R) -> Result<u64>
where
    R: AsyncRead + Unpin,
{
    info!(
        database = %target.name,
        target = %connection_label(&target.connection_string),
        "starting psql restore"
    );

    let mut child = tool
        .command()
        .args(psql_args(&target.connection_string))
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| AppError::DumpTool {
            tool: "psql",
            stderr: format!("failed to start {}: {e}", tool.program.display()),
        })?;

    let (Some(stdin), Some(stderr)) = (child.stdin.take(), child.stderr.take()) else {
        return Err(AppError::Internal("psql pipes were not captured".into()));
    };

    let (fed, stderr) = tokio::join!(decompress_stream(artifact, stdin), read_tail(stderr));

    if let Err(StreamError::Read(e)) = &fed {
        let _ = child.start_kill();
        let _ = child.wait().await;
        return Err(AppError::Storage(format!("backup artifact is unreadable: {e}")));
    }

    let status = child.wait().await.map_err(|e| AppError::DumpTool {
        tool: "psql",
        stderr: format!("failed to wait for psql: {e}"),
    })?;
    if !status.success() {
        return Err(classify_tool_failure("psql", status, &stderr));
    }

    // psql exited cleanly yet stopped reading, so part of the dump was never applied.
    let fed = fed.map_err(|e| AppError::DumpTool {
        tool: "psql",
        stderr: format!("psql stopped reading input: {e}"),
    })?;
    debug!(database = %target.name, fed, "psql restore finished");
    Ok(fed)
}
