//! Cron-driven and manual triggering of backup runs.
//!
//! A single coordinator task owns every configuration's next fire time. It
//! sleeps until the earliest one is due, hands due configurations to the
//! [`BackupRunner`] on their own tasks and recomputes their next fire from
//! `max(now, last fire)`, so an occurrence never fires twice.

pub mod cron;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backup::{BackupRunner, RunTicket};
use crate::errors::{AppError, Result};
use crate::model::BackupConfig;
use crate::store::Store;
use self::cron::CronSchedule;

/// Longest the coordinator sleeps without re-checking its entries.
const MAX_IDLE: Duration = Duration::from_secs(60);

enum Command {
    Schedule {
        backup_id: Uuid,
        schedule: CronSchedule,
    },
    Unschedule(Uuid),
    NextFire(Uuid, oneshot::Sender<Option<DateTime<Utc>>>),
}

struct Entry {
    schedule: CronSchedule,
    next_fire: Option<DateTime<Utc>>,
    last_fire: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct Scheduler {
    commands: mpsc::UnboundedSender<Command>,
    runner: BackupRunner,
    store: Arc<dyn Store>,
    shutdown: CancellationToken,
    coordinator: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl Scheduler {
    /// Spawns the coordinator. Nothing is scheduled until [`schedule`](Self::schedule)
    /// or [`schedule_all_active`](Self::schedule_all_active) is called.
    pub fn start(runner: BackupRunner, store: Arc<dyn Store>) -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(coordinate(rx, runner.clone(), shutdown.clone()));
        Self {
            commands,
            runner,
            store,
            shutdown,
            coordinator: Arc::new(Mutex::new(Some(handle))),
        }
    }

    /// Registers or replaces `config`'s entry. Inactive configurations are unscheduled.
    pub fn schedule(&self, config: &BackupConfig) -> Result<()> {
        if !config.is_active {
            return self.unschedule(config.id);
        }
        let schedule = CronSchedule::parse(&config.cron_expression, &config.time_zone)?;
        self.send(Command::Schedule {
            backup_id: config.id,
            schedule,
        })
    }

    pub fn unschedule(&self, backup_id: Uuid) -> Result<()> {
        self.send(Command::Unschedule(backup_id))
    }

    /// Starts a run now. Returns once the run is accepted or rejected.
    pub async fn trigger(&self, backup_id: Uuid) -> Result<RunTicket> {
        self.runner.start(backup_id).await
    }

    /// Schedules every active configuration in the store. Returns how many were scheduled.
    pub async fn schedule_all_active(&self) -> Result<usize> {
        let mut scheduled = 0;
        for config in self.store.list_active_backups().await? {
            match self.schedule(&config) {
                Ok(()) => scheduled += 1,
                Err(e) => warn!(backup_id = %config.id, error = %e, "skipping unschedulable backup"),
            }
        }
        info!(scheduled, "active backups scheduled");
        Ok(scheduled)
    }

    /// When `backup_id` fires next, or `None` if it is not scheduled.
    pub async fn next_fire(&self, backup_id: Uuid) -> Option<DateTime<Utc>> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::NextFire(backup_id, tx)).ok()?;
        rx.await.ok().flatten()
    }

    /// Stops the coordinator. Runs already started are left to finish.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        if let Some(handle) = self.coordinator.lock().await.take() {
            let _ = handle.await;
        }
    }

    fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| AppError::Internal("scheduler has been shut down".into()))
    }
}

async fn coordinate(
    mut commands: mpsc::UnboundedReceiver<Command>,
    runner: BackupRunner,
    shutdown: CancellationToken,
) {
    let mut entries: HashMap<Uuid, Entry> = HashMap::new();

    loop {
        let now = Utc::now();
        let wait = entries
            .values()
            .filter_map(|e| e.next_fire)
            .min()
            .map(|due| (due - now).to_std().unwrap_or(Duration::ZERO))
            .unwrap_or(MAX_IDLE)
            .min(MAX_IDLE);

        tokio::select! {
            _ = shutdown.cancelled() => break,
            command = commands.recv() => match command {
                Some(Command::Schedule { backup_id, schedule }) => {
                    let next_fire = schedule.next_after(Utc::now());
                    debug!(%backup_id, cron = schedule.expression(), ?next_fire, "backup scheduled");
                    entries.insert(backup_id, Entry { schedule, next_fire, last_fire: None });
                }
                Some(Command::Unschedule(backup_id)) => {
                    if entries.remove(&backup_id).is_some() {
                        debug!(%backup_id, "backup unscheduled");
                    }
                }
                Some(Command::NextFire(backup_id, reply)) => {
                    let _ = reply.send(entries.get(&backup_id).and_then(|e| e.next_fire));
                }
                None => break,
            },
            _ = tokio::time::sleep(wait) => fire_due(&mut entries, &runner),
        }
    }
    info!("scheduler stopped");
}

fn fire_due(entries: &mut HashMap<Uuid, Entry>, runner: &BackupRunner) {
    let now = Utc::now();
    for (backup_id, entry) in entries.iter_mut() {
        let Some(due) = entry.next_fire.filter(|due| *due <= now) else {
            continue;
        };
        let from = entry.last_fire.map_or(now, |last| last.max(now));
        entry.last_fire = Some(due);
        entry.next_fire = entry.schedule.next_after(from);

        let runner = runner.clone();
        let backup_id = *backup_id;
        tokio::spawn(async move {
            match runner.start(backup_id).await {
                Ok(ticket) => {
                    info!(%backup_id, execution_id = %ticket.execution_id, "scheduled run started")
                }
                Err(AppError::AlreadyRunning(_)) => {
                    info!(%backup_id, "previous run still in progress, skipping this occurrence")
                }
                Err(e) => warn!(%backup_id, error = %e, "scheduled run could not start"),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::runner::tests::{fake_pg_dump, harness};
    use crate::model::ExecutionStatus;
    use crate::store::ExecutionStore;
    use chrono::Timelike;

    #[tokio::test]
    async fn every_second_schedule_fires() {
        let h = harness(fake_pg_dump("echo 'SELECT 1;'")).await;
        let mut config = h.local_backup(0).await;
        config.cron_expression = "* * * * * *".into();

        let scheduler = Scheduler::start(h.runner.clone(), h.store.clone());
        scheduler.schedule(&config).expect("scheduled");

        let mut succeeded = false;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let executions = h.store.list_backup_executions(config.id).await.expect("list");
            if executions.iter().any(|e| e.status == ExecutionStatus::Success) {
                succeeded = true;
                break;
            }
        }
        scheduler.shutdown().await;
        assert!(succeeded, "no scheduled run completed within five seconds");

        let executions = h.store.list_backup_executions(config.id).await.expect("list");
        let running = executions.iter().filter(|e| e.status == ExecutionStatus::Running).count();
        assert!(running <= 1);
    }

    #[tokio::test]
    async fn every_minute_schedule_lands_on_the_next_boundary() {
        let h = harness(fake_pg_dump("true")).await;
        let mut config = h.local_backup(0).await;
        config.cron_expression = "* * * * *".into();
        config.time_zone = "Asia/Kolkata".into();

        let scheduler = Scheduler::start(h.runner.clone(), h.store.clone());
        let before = Utc::now();
        scheduler.schedule(&config).expect("scheduled");
        let next = scheduler.next_fire(config.id).await.expect("has a next fire");
        assert_eq!(next.second(), 0);
        assert!(next > before);
        assert!(next - before <= chrono::Duration::seconds(60));

        scheduler.unschedule(config.id).expect("unscheduled");
        assert!(scheduler.next_fire(config.id).await.is_none());
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn bad_and_inactive_configs_are_not_scheduled() {
        let h = harness(fake_pg_dump("true")).await;
        let config = h.local_backup(0).await;
        let scheduler = Scheduler::start(h.runner.clone(), h.store.clone());

        let mut broken = config.clone();
        broken.cron_expression = "every day at noon".into();
        assert!(matches!(scheduler.schedule(&broken), Err(AppError::InvalidSchedule(_))));

        scheduler.schedule(&config).expect("scheduled");
        assert!(scheduler.next_fire(config.id).await.is_some());

        let mut paused = config.clone();
        paused.is_active = false;
        scheduler.schedule(&paused).expect("unscheduled");
        assert!(scheduler.next_fire(config.id).await.is_none());

        assert_eq!(scheduler.schedule_all_active().await.expect("all"), 1);
        scheduler.shutdown().await;
        assert!(scheduler.schedule(&config).is_err());
    }

    #[tokio::test]
    async fn manual_trigger_while_running_is_rejected() {
        let h = harness(fake_pg_dump("sleep 1; echo 'SELECT 1;'")).await;
        let config = h.local_backup(0).await;
        let scheduler = Scheduler::start(h.runner.clone(), h.store.clone());

        let ticket = scheduler.trigger(config.id).await.expect("accepted");
        assert!(matches!(
            scheduler.trigger(config.id).await,
            Err(AppError::AlreadyRunning(_))
        ));
        let running = h
            .store
            .list_backup_executions(config.id)
            .await
            .expect("list")
            .into_iter()
            .filter(|e| e.status == ExecutionStatus::Running)
            .count();
        assert_eq!(running, 1);
        assert_eq!(ticket.wait().await.expect("done").status, ExecutionStatus::Success);
        scheduler.shutdown().await;
    }
}
