//! PostgreSQL backup execution and scheduling core.
//!
//! Runs `pg_dump` on cron schedules or on demand, streams gzipped dumps to
//! local disk or S3-compatible storage, records every attempt as an execution,
//! prunes old executions and restores artifacts with `psql`.

pub mod app;
pub mod backup;
pub mod config;
pub mod errors;
pub mod model;
pub mod notify;
pub mod restore;
pub mod scheduler;
pub mod service;
pub mod storage;
pub mod store;
pub mod utils;

pub use app::Core;
pub use errors::{AppError, Result};
