// pgbackd/src/backup/db_dump.rs
use std::process::Stdio;

use tokio::io::AsyncWrite;
use tracing::{debug, info};

use super::artifact::{StreamError, compress_stream};
use crate::errors::{AppError, Result};
use crate::model::{Database, DumpOptions};
use crate::utils::ToolCommand;
use crate::utils::process::{classify_tool_failure, connection_label, read_tail, stderr_excerpt};

/// `pg_dump` arguments for a plain SQL dump with the configured switches.
pub fn dump_args(options: &DumpOptions, connection_string: &str) -> Vec<String> {
    let mut args = vec!["--format=plain".to_string()];
    let flags = [
        (options.data_only, "--data-only"),
        (options.schema_only, "--schema-only"),
        (options.clean, "--clean"),
        (options.if_exists, "--if-exists"),
        (options.create, "--create"),
        (options.no_comments, "--no-comments"),
    ];
    args.extend(
        flags
            .iter()
            .filter(|(enabled, _)| *enabled)
            .map(|(_, flag)| flag.to_string()),
    );
    args.push(format!("--dbname={connection_string}"));
    args
}

/// Runs `pg_dump` and streams its output, gzipped, into `out`.
///
/// Returns the number of compressed bytes written. The child is killed if this
/// future is dropped.
pub async fn dump_database<W>(
    tool: &ToolCommand,
    database: &Database,
    options: &DumpOptions,
    out: &mut W,
) -> Result<u64>
where
    W: AsyncWrite + Unpin,
{
    info!(
        database = %database.name,
        target = %connection_label(&database.connection_string),
        "starting pg_dump"
    );

    let mut child = tool
        .command()
        .args(dump_args(options, &database.connection_string))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| AppError::DumpTool {
            tool: "pg_dump",
            stderr: format!("failed to start {}: {e}", tool.program.display()),
        })?;

    let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
        return Err(AppError::Internal("pg_dump pipes were not captured".into()));
    };

    let (streamed, stderr) = tokio::join!(compress_stream(stdout, out), read_tail(stderr));

    if let Err(StreamError::Write(e)) = &streamed {
        let _ = child.start_kill();
        let _ = child.wait().await;
        return Err(AppError::Storage(format!("failed to write dump artifact: {e}")));
    }

    let status = child.wait().await.map_err(|e| AppError::DumpTool {
        tool: "pg_dump",
        stderr: format!("failed to wait for pg_dump: {e}"),
    })?;
    if !status.success() {
        return Err(classify_tool_failure("pg_dump", status, &stderr));
    }

    match streamed {
        Ok(written) => {
            debug!(database = %database.name, written, "pg_dump finished");
            Ok(written)
        }
        Err(e) => Err(AppError::DumpTool {
            tool: "pg_dump",
            stderr: format!("failed to read pg_dump output: {e}. {}", stderr_excerpt(&stderr)),
        }),
    }
}
