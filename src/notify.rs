// pgbackd/src/notify.rs
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::model::EventType;

/// A terminal transition the outside world may want to hear about.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    ExecutionSucceeded {
        execution_id: Uuid,
        backup_id: Uuid,
        path: String,
        file_size: u64,
    },
    ExecutionFailed {
        execution_id: Uuid,
        backup_id: Uuid,
        message: String,
    },
    RestorationSucceeded {
        restoration_id: Uuid,
        execution_id: Uuid,
        /// The database that was restored into.
        database_id: Uuid,
    },
    RestorationFailed {
        restoration_id: Uuid,
        execution_id: Uuid,
        database_id: Uuid,
        message: String,
    },
}

impl Event {
    pub fn event_type(&self) -> EventType {
        match self {
            Event::ExecutionSucceeded { .. } => EventType::ExecutionSuccess,
            Event::ExecutionFailed { .. } => EventType::ExecutionFailed,
            Event::RestorationSucceeded { .. } => EventType::RestorationSuccess,
            Event::RestorationFailed { .. } => EventType::RestorationFailed,
        }
    }

    /// The id webhooks subscribe to: the backup for executions, the target database for restorations.
    pub fn target_id(&self) -> Uuid {
        match self {
            Event::ExecutionSucceeded { backup_id, .. } | Event::ExecutionFailed { backup_id, .. } => {
                *backup_id
            }
            Event::RestorationSucceeded { database_id, .. }
            | Event::RestorationFailed { database_id, .. } => *database_id,
        }
    }
}

/// Fire-and-forget sink for [`Event`]s. Implementations must not block.
pub trait Notifier: Send + Sync {
    fn notify(&self, event: Event);
}

/// Writes every event to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, event: Event) {
        match &event {
            Event::ExecutionSucceeded {
                execution_id,
                backup_id,
                file_size,
                ..
            } => info!(%execution_id, %backup_id, file_size, "backup execution succeeded"),
            Event::ExecutionFailed {
                execution_id,
                backup_id,
                message,
            } => warn!(%execution_id, %backup_id, message, "backup execution failed"),
            Event::RestorationSucceeded {
                restoration_id,
                execution_id,
                database_id,
            } => info!(%restoration_id, %execution_id, %database_id, "restoration succeeded"),
            Event::RestorationFailed {
                restoration_id,
                execution_id,
                database_id,
                message,
            } => warn!(%restoration_id, %execution_id, %database_id, message, "restoration failed"),
        }
    }
}

/// Hands events to a dispatcher on the other end of a channel.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<Event>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Notifier for ChannelNotifier {
    fn notify(&self, event: Event) {
        if self.tx.send(event).is_err() {
            warn!("event dispatcher is gone, dropping event");
        }
    }
}
