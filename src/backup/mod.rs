//! Backup runs: dumping, artifact placement and retention.

pub mod artifact;
pub mod db_dump;
pub mod retention;
pub mod runner;

pub use artifact::ArtifactLocation;
pub use retention::{RetentionEnforcer, RetentionReport};
pub use runner::{BackupRunner, DEFAULT_MAX_RUN_DURATION, RunTicket, RunnerSettings};
