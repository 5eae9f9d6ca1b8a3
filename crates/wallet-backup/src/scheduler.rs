/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Backup scheduling system
//!
//! At most one timer is pending at a time. Its due time is persisted so a
//! restart re-arms it, and retries reuse the same timer with a fixed delay.

use crate::{
    error::{BackupError, Result},
    settings::{update_settings, SettingsStore},
    state::{BackupState, BackupStateMachine},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
    time::Duration,
};
use tokio::{sync::Mutex, task::JoinHandle};
use tracing::{debug, info};

/// Longest delay accepted for a scheduled or retried backup.
pub const MAX_SCHEDULE_DELAY: Duration = Duration::from_secs(366 * 24 * 60 * 60);

/// Schedule configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Delay before a regular backup, in seconds.
    #[serde(with = "duration_secs")]
    pub backup_interval: Duration,
    /// Delay before retrying a failed scheduled backup, in seconds.
    #[serde(with = "duration_secs")]
    pub retry_delay: Duration,
    pub max_retries: u32,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            backup_interval: Duration::from_secs(5 * 60),
            retry_delay: Duration::from_secs(60),
            max_retries: 5,
        }
    }
}

/// Entry point invoked when the timer fires.
#[async_trait]
pub trait ScheduledBackupTask: Send + Sync {
    async fn run_scheduled_backup(&self);
}

#[derive(Debug)]
struct PendingRun {
    id: u64,
    handle: JoinHandle<()>,
}

/// Backup scheduler
#[derive(Debug)]
pub struct BackupScheduler {
    config: ScheduleConfig,
    settings: Arc<dyn SettingsStore>,
    state: Arc<BackupStateMachine>,
    task: Weak<dyn ScheduledBackupTask>,
    pending: Arc<Mutex<Option<PendingRun>>>,
    next_id: AtomicU64,
}

impl BackupScheduler {
    pub fn new(
        config: ScheduleConfig,
        settings: Arc<dyn SettingsStore>,
        state: Arc<BackupStateMachine>,
        task: Weak<dyn ScheduledBackupTask>,
    ) -> Self {
        Self {
            config,
            settings,
            state,
            task,
            pending: Arc::new(Mutex::new(None)),
            next_id: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &ScheduleConfig {
        &self.config
    }

    /// Reconcile the persisted settings with the observable state and re-arm
    /// a persisted timer.
    pub async fn start(&self) -> Result<()> {
        let settings = self.settings.load().await?;
        if !settings.backup_enabled {
            self.state.transition(BackupState::Disabled);
            return Ok(());
        }
        if settings.has_failure_marker() {
            self.state.transition(BackupState::Failed(None));
            return Ok(());
        }

        match settings.retry.scheduled_at {
            Some(due_at) => {
                let delay = (due_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                let mut pending = self.pending.lock().await;
                if pending.is_none() {
                    info!("Restoring scheduled backup due at {}", due_at);
                    self.state.transition(BackupState::Scheduled(due_at));
                    *pending = Some(self.arm(delay));
                }
            }
            None => self.state.transition(BackupState::UpToDate),
        }
        Ok(())
    }

    /// Schedule a backup after `delay`, or the backup interval when `None`.
    ///
    /// Does nothing and returns `None` when a timer is already pending.
    pub async fn schedule(
        &self,
        delay: Option<Duration>,
        reset_retry_count: bool,
    ) -> Result<Option<DateTime<Utc>>> {
        let mut pending = self.pending.lock().await;
        if pending.is_some() {
            debug!("Backup already scheduled");
            return Ok(None);
        }

        let delay = delay.unwrap_or(self.config.backup_interval);
        let due_at = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|delay| Utc::now().checked_add_signed(delay))
            .ok_or_else(|| BackupError::Config(format!("Backup delay {:?} is out of range", delay)))?;

        update_settings(self.settings.as_ref(), |settings| {
            settings.retry.scheduled_at = Some(due_at);
            if reset_retry_count {
                settings.retry.attempt_count = 0;
            }
        })
        .await?;

        self.state.transition(BackupState::Scheduled(due_at));
        *pending = Some(self.arm(delay));
        info!("Backup scheduled for {}", due_at);
        Ok(Some(due_at))
    }

    /// Abort the pending timer. A run that already started is not affected.
    pub async fn cancel(&self) -> bool {
        match self.pending.lock().await.take() {
            Some(run) => {
                run.handle.abort();
                debug!("Pending backup cancelled");
                true
            }
            None => false,
        }
    }

    pub async fn has_pending_timer(&self) -> bool {
        self.pending.lock().await.is_some()
    }

    fn arm(&self, delay: Duration) -> PendingRun {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let pending = self.pending.clone();
        let task = self.task.clone();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            // Leave the slot before running so the run can cancel or
            // reschedule without aborting itself.
            {
                let mut slot = pending.lock().await;
                if slot.as_ref().map(|run| run.id) != Some(id) {
                    return;
                }
                slot.take();
            }

            if let Some(task) = task.upgrade() {
                task.run_scheduled_backup().await;
            }
        });

        PendingRun { id, handle }
    }
}

mod duration_secs {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        if duration.subsec_nanos() == 0 {
            serializer.serialize_u64(duration.as_secs())
        } else {
            serializer.serialize_f64(duration.as_secs_f64())
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::MemorySettingsStore;
    use std::sync::atomic::AtomicU32;

    #[derive(Default)]
    struct CountingTask {
        runs: AtomicU32,
    }

    #[async_trait]
    impl ScheduledBackupTask for CountingTask {
        async fn run_scheduled_backup(&self) {
            self.runs.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn build_scheduler(
        task: &Arc<CountingTask>,
        settings: Arc<MemorySettingsStore>,
    ) -> (BackupScheduler, Arc<BackupStateMachine>) {
        let state = Arc::new(BackupStateMachine::default());
        let weak: Weak<dyn ScheduledBackupTask> = Arc::downgrade(task) as Weak<dyn ScheduledBackupTask>;
        (
            BackupScheduler::new(ScheduleConfig::default(), settings, state.clone(), weak),
            state,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_pending_timer() {
        let task = Arc::new(CountingTask::default());
        let settings = Arc::new(MemorySettingsStore::default());
        let (scheduler, state) = build_scheduler(&task, settings.clone());

        let due_at = scheduler.schedule(None, true).await.unwrap();
        assert!(due_at.is_some());
        assert!(scheduler.schedule(Some(Duration::from_secs(1)), true).await.unwrap().is_none());
        assert!(scheduler.has_pending_timer().await);
        assert!(matches!(state.current(), BackupState::Scheduled(_)));
        assert_eq!(settings.load().await.unwrap().retry.scheduled_at, due_at);

        tokio::time::sleep(Duration::from_secs(5 * 60 + 1)).await;
        assert_eq!(task.runs.load(Ordering::SeqCst), 1);
        assert!(!scheduler.has_pending_timer().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel() {
        let task = Arc::new(CountingTask::default());
        let (scheduler, _) = build_scheduler(&task, Arc::new(MemorySettingsStore::default()));

        scheduler.schedule(Some(Duration::from_secs(10)), false).await.unwrap();
        assert!(scheduler.cancel().await);
        assert!(!scheduler.cancel().await);

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(task.runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_retry_count() {
        let task = Arc::new(CountingTask::default());
        let settings = Arc::new(MemorySettingsStore::default());
        update_settings(settings.as_ref(), |s| s.retry.attempt_count = 3)
            .await
            .unwrap();
        let (scheduler, _) = build_scheduler(&task, settings.clone());

        scheduler.schedule(Some(Duration::from_secs(1)), false).await.unwrap();
        assert_eq!(settings.load().await.unwrap().retry.attempt_count, 3);
        scheduler.cancel().await;

        scheduler.schedule(Some(Duration::from_secs(1)), true).await.unwrap();
        assert_eq!(settings.load().await.unwrap().retry.attempt_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_reconciliation() {
        let task = Arc::new(CountingTask::default());

        let (scheduler, state) = build_scheduler(&task, Arc::new(MemorySettingsStore::default()));
        scheduler.start().await.unwrap();
        assert!(matches!(state.current(), BackupState::Disabled));

        let settings = Arc::new(MemorySettingsStore::default());
        update_settings(settings.as_ref(), |s| {
            s.backup_enabled = true;
            s.retry.last_failure_at = Some(Utc::now());
        })
        .await
        .unwrap();
        let (scheduler, state) = build_scheduler(&task, settings);
        scheduler.start().await.unwrap();
        assert!(state.current().is_failed());

        let settings = Arc::new(MemorySettingsStore::default());
        update_settings(settings.as_ref(), |s| s.backup_enabled = true)
            .await
            .unwrap();
        let (scheduler, state) = build_scheduler(&task, settings);
        scheduler.start().await.unwrap();
        assert!(matches!(state.current(), BackupState::UpToDate));
        assert!(!scheduler.has_pending_timer().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overdue_timer_fires_immediately() {
        let task = Arc::new(CountingTask::default());
        let settings = Arc::new(MemorySettingsStore::default());
        let due_at = Utc::now() - chrono::Duration::minutes(10);
        update_settings(settings.as_ref(), |s| {
            s.backup_enabled = true;
            s.retry.scheduled_at = Some(due_at);
        })
        .await
        .unwrap();
        let (scheduler, state) = build_scheduler(&task, settings);

        scheduler.start().await.unwrap();
        assert!(matches!(state.current(), BackupState::Scheduled(at) if at == due_at));

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(task.runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_out_of_range_delay_is_rejected() {
        let task = Arc::new(CountingTask::default());
        let settings = Arc::new(MemorySettingsStore::default());
        let (scheduler, state) = build_scheduler(&task, settings.clone());

        let result = scheduler
            .schedule(Some(Duration::from_secs(10_000_000_000_000)), true)
            .await;
        assert!(matches!(result, Err(BackupError::Config(_))));
        assert!(!scheduler.has_pending_timer().await);
        assert!(matches!(state.current(), BackupState::Disabled));
        assert_eq!(settings.load().await.unwrap().retry.scheduled_at, None);
    }

    #[test]
    fn test_config_durations() {
        let config: ScheduleConfig =
            toml::from_str("backup_interval = 600\nretry_delay = 0.5\nmax_retries = 2").unwrap();
        assert_eq!(config.backup_interval, Duration::from_secs(600));
        assert_eq!(config.retry_delay, Duration::from_millis(500));
        assert!(toml::from_str::<ScheduleConfig>("retry_delay = -1").is_err());
    }
}
