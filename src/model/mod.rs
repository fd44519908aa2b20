//! Rows owned by the backup core.

pub mod backup;
pub mod catalog;
pub mod execution;
pub mod pagination;

pub use backup::{BackupConfig, DumpOptions, NewBackupConfig};
pub use catalog::{
    Database, Destination, EventType, NewDatabase, NewDestination, NewWebhook, Webhook,
};
pub use execution::{
    Execution, ExecutionDetail, ExecutionStatus, ExecutionUpdate, Restoration,
    RestorationStatus,
};
pub use pagination::{PageRequest, PaginateResponse};
