// pgbackd/src/utils/process.rs
use std::process::ExitStatus;
use std::sync::LazyLock;

use regex::RegexSet;
use tokio::io::{AsyncRead, AsyncReadExt};
use url::Url;

use crate::errors::AppError;

/// How much of a tool's stderr ends up in an execution message.
pub const STDERR_EXCERPT_BYTES: usize = 2048;

static CONNECTION_FAILURES: LazyLock<RegexSet> = LazyLock::new(|| {
    RegexSet::new([
        r"(?i)could not connect to server",
        r"(?i)connection to server .* failed",
        r"(?i)connection refused",
        r"(?i)password authentication failed",
        r"(?i)authentication failed",
        r"(?i)could not translate host name",
        r"(?i)no pg_hba\.conf entry",
        r"(?i)timeout expired",
    ])
    .unwrap_or_else(|_| RegexSet::empty())
});

/// Drains a reader, keeping only the last [`STDERR_EXCERPT_BYTES`] bytes.
pub async fn read_tail<R: AsyncRead + Unpin>(mut reader: R) -> Vec<u8> {
    let mut tail = Vec::with_capacity(STDERR_EXCERPT_BYTES);
    let mut buf = [0u8; 1024];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                tail.extend_from_slice(&buf[..n]);
                if tail.len() > STDERR_EXCERPT_BYTES * 2 {
                    tail.drain(..tail.len() - STDERR_EXCERPT_BYTES);
                }
            }
        }
    }
    if tail.len() > STDERR_EXCERPT_BYTES {
        tail.drain(..tail.len() - STDERR_EXCERPT_BYTES);
    }
    tail
}

pub fn stderr_excerpt(stderr: &[u8]) -> String {
    let start = stderr.len().saturating_sub(STDERR_EXCERPT_BYTES);
    String::from_utf8_lossy(&stderr[start..]).trim().to_string()
}

/// Turns a non-zero exit into a connection or tool error, judged by stderr.
pub fn classify_tool_failure(tool: &'static str, status: ExitStatus, stderr: &[u8]) -> AppError {
    let excerpt = stderr_excerpt(stderr);
    let excerpt = if excerpt.is_empty() {
        format!("{tool} exited with {status}")
    } else {
        excerpt
    };
    if CONNECTION_FAILURES.is_match(&excerpt) {
        AppError::Connection(excerpt)
    } else {
        AppError::DumpTool {
            tool,
            stderr: excerpt,
        }
    }
}

/// `host:port/dbname` for log lines. Never includes user or password.
pub fn connection_label(connection_string: &str) -> String {
    match Url::parse(connection_string) {
        Ok(url) => {
            let host = url.host_str().unwrap_or("localhost");
            let db = url.path().trim_start_matches('/');
            match url.port() {
                Some(port) => format!("{host}:{port}/{db}"),
                None => format!("{host}/{db}"),
            }
        }
        Err(_) => "<unparsed connection string>".to_string(),
    }
}
