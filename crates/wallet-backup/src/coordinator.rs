/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Backup coordinator
//!
//! Decides when backups run, executes at most one operation at a time and
//! keeps the persisted settings and the observable state in step.

use crate::{
    backup::ArtifactBuilder,
    compression::ZipCompression,
    config::WalletBackupConfig,
    encryption::AesGcmCipher,
    error::{BackupError, Result},
    metrics::{BackupMetrics, BackupRunResult},
    naming::NamingPolicy,
    restore::{RestoreProcessor, RestoreReport},
    scheduler::{BackupScheduler, ScheduledBackupTask},
    secret::{BackupSecret, CredentialStore},
    settings::{update_settings, BackupSettings, RetryState, SettingsStore},
    state::{BackupState, BackupStateMachine},
    storage::StorageBackend,
    wallet::WalletDataSource,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
    time::Instant,
};
use tokio::sync::{watch, Mutex, MutexGuard, RwLock};
use tracing::{debug, error, info, warn};

/// External collaborators of the coordinator.
#[derive(Debug, Clone)]
pub struct BackupCollaborators {
    pub wallet: Arc<dyn WalletDataSource>,
    pub storage: Arc<dyn StorageBackend>,
    pub settings: Arc<dyn SettingsStore>,
    pub credentials: Arc<dyn CredentialStore>,
}

/// What a call to [`BackupCoordinator::backup_now`] did.
#[derive(Debug, Clone)]
pub enum BackupOutcome {
    Completed { created_at: DateTime<Utc> },
    /// Another operation was running, the state did not allow a run, or
    /// backups are disabled.
    Skipped,
    RetryScheduled { due_at: Option<DateTime<Utc>> },
    Failed(BackupError),
}

/// Main wallet backup service
#[derive(Debug, Clone)]
pub struct BackupCoordinator {
    inner: Arc<CoordinatorInner>,
}

#[derive(Debug)]
struct CoordinatorInner {
    scratch_dir: PathBuf,
    max_retries: u32,
    retry_delay: std::time::Duration,
    state: Arc<BackupStateMachine>,
    scheduler: BackupScheduler,
    builder: ArtifactBuilder,
    restorer: RestoreProcessor,
    wallet: Arc<dyn WalletDataSource>,
    storage: Arc<dyn StorageBackend>,
    settings: Arc<dyn SettingsStore>,
    credentials: Arc<dyn CredentialStore>,
    run_lock: Mutex<()>,
    // Set when the wallet changes while a run holds the lock.
    dirty: AtomicBool,
    metrics: RwLock<BackupMetrics>,
}

impl BackupCoordinator {
    pub fn new(config: &WalletBackupConfig, collaborators: BackupCollaborators) -> Result<Self> {
        config.validate()?;
        let naming = NamingPolicy::new(&config.naming)?;
        let compression = ZipCompression::new(&config.compression);
        let cipher = AesGcmCipher::new(&config.encryption);
        let state = Arc::new(BackupStateMachine::default());

        let inner = Arc::new_cyclic(|weak: &Weak<CoordinatorInner>| {
            let task: Weak<dyn ScheduledBackupTask> = weak.clone();
            CoordinatorInner {
                scratch_dir: config.paths.scratch_dir.clone(),
                max_retries: config.schedule.max_retries,
                retry_delay: config.schedule.retry_delay,
                scheduler: BackupScheduler::new(
                    config.schedule.clone(),
                    collaborators.settings.clone(),
                    state.clone(),
                    task,
                ),
                builder: ArtifactBuilder::new(
                    naming.clone(),
                    compression.clone(),
                    cipher.clone(),
                    collaborators.wallet.clone(),
                ),
                restorer: RestoreProcessor::new(naming, compression, cipher, collaborators.wallet.clone()),
                state,
                wallet: collaborators.wallet,
                storage: collaborators.storage,
                settings: collaborators.settings,
                credentials: collaborators.credentials,
                run_lock: Mutex::new(()),
                dirty: AtomicBool::new(false),
                metrics: RwLock::new(BackupMetrics::new()),
            }
        });

        Ok(Self { inner })
    }

    /// Reconcile persisted settings with the observable state.
    ///
    /// Never fails: errors are logged and reported as `Failed`.
    pub async fn start(&self) {
        info!("Starting wallet backup service");
        if let Err(e) = self.inner.scheduler.start().await {
            error!("Failed to restore backup schedule: {}", e);
            self.inner.state.transition(BackupState::Failed(Some(e)));
        }
    }

    /// Cancel the pending timer. Persisted state is kept for the next start.
    pub async fn shutdown(&self) {
        if self.inner.scheduler.cancel().await {
            info!("Pending backup cancelled on shutdown");
        }
    }

    pub fn state(&self) -> BackupState {
        self.inner.state.current()
    }

    pub fn subscribe(&self) -> watch::Receiver<BackupState> {
        self.inner.state.subscribe()
    }

    pub async fn has_pending_timer(&self) -> bool {
        self.inner.scheduler.has_pending_timer().await
    }

    pub async fn settings(&self) -> Result<BackupSettings> {
        self.inner.settings.load().await
    }

    pub async fn metrics(&self) -> BackupMetrics {
        self.inner.metrics.read().await.clone()
    }

    /// Run a backup now unless another operation is in flight.
    ///
    /// Without an explicit secret the stored password, if any, is used.
    pub async fn backup_now(&self, is_initial: bool, secret: Option<BackupSecret>) -> BackupOutcome {
        match self.inner.run_lock.try_lock() {
            Ok(guard) => self.inner.execute_backup(guard, is_initial, secret).await,
            Err(_) => {
                debug!("Backup skipped, another operation is in progress");
                BackupOutcome::Skipped
            }
        }
    }

    /// Verify that the last successful backup is still present in storage.
    pub async fn check_storage_status(&self) -> Result<()> {
        let Ok(_guard) = self.inner.run_lock.try_lock() else {
            debug!("Storage check skipped, another operation is in progress");
            return Ok(());
        };

        let settings = self.inner.settings.load().await?;
        let Some(last_success) = settings.last_successful_backup_at.filter(|_| settings.backup_enabled) else {
            return Ok(());
        };

        let previous = self.inner.state.current();
        self.inner.state.transition(BackupState::CheckingStorage);
        match self.inner.storage.has_artifact_for(last_success).await {
            Ok(true) => {
                debug!("Backup from {} is present", last_success);
                self.inner.state.transition(previous);
                Ok(())
            }
            Ok(false) => {
                let e = BackupError::StorageTampered("Backup file not found in storage.".to_string());
                error!("Backup from {} is missing from storage", last_success);
                let marked = update_settings(self.inner.settings.as_ref(), |s| {
                    s.retry.last_failure_at = Some(Utc::now());
                })
                .await;
                self.inner.state.transition(BackupState::Failed(Some(e.clone())));
                marked?;
                Err(e)
            }
            Err(e) => {
                warn!("Failed to check backup storage: {}", e);
                self.inner.state.transition(previous);
                Err(e)
            }
        }
    }

    /// Set up storage, enable backups and run the initial backup.
    pub async fn enable_backups(&self, secret: Option<BackupSecret>) -> Result<BackupOutcome> {
        self.inner.storage.setup().await?;

        let location = self.inner.storage.location();
        update_settings(self.inner.settings.as_ref(), |s| {
            s.backup_enabled = true;
            s.storage_location = location;
            s.retry = RetryState::default();
        })
        .await?;
        info!("Wallet backups enabled");

        Ok(self.backup_now(true, secret).await)
    }

    /// Store a new backup password (or clear it) and back up with it.
    pub async fn change_password(&self, secret: Option<BackupSecret>) -> Result<BackupOutcome> {
        self.inner.credentials.set_backup_password(secret.clone()).await?;
        if !self.inner.settings.load().await?.backup_enabled {
            return Ok(BackupOutcome::Skipped);
        }
        Ok(self.backup_now(true, secret).await)
    }

    /// Called whenever the wallet's persisted data changes.
    pub async fn notify_wallet_changed(&self) -> Result<()> {
        let Ok(_guard) = self.inner.run_lock.try_lock() else {
            self.inner.dirty.store(true, Ordering::SeqCst);
            return Ok(());
        };

        if !self.inner.settings.load().await?.backup_enabled {
            return Ok(());
        }
        if let Some(cause) = self.inner.state.current().failure() {
            if cause.requires_user_action() {
                debug!("Backup not scheduled, waiting for the user: {}", cause);
                return Ok(());
            }
        }

        self.inner.scheduler.schedule(None, true).await?;
        Ok(())
    }

    /// Download the newest artifact and install it into the wallet.
    pub async fn restore_latest(&self, secret: Option<BackupSecret>) -> Result<RestoreReport> {
        let _guard = self.inner.run_lock.lock().await;
        let started = Instant::now();

        let secret = match secret {
            Some(secret) => Some(secret),
            None => self.inner.credentials.backup_password().await?,
        };

        let result = self.inner.download_and_restore(secret.as_ref()).await;
        self.inner
            .metrics
            .write()
            .await
            .record_restore(result.as_ref().ok().map(|r| r.files_restored), started.elapsed());

        let report = match result {
            Ok(report) => report,
            Err(e) => {
                warn!("Restore failed: {}", e);
                return Err(e);
            }
        };

        update_settings(self.inner.settings.as_ref(), |s| {
            s.backup_enabled = true;
            if report.artifact_created_at.is_some() {
                s.last_successful_backup_at = report.artifact_created_at;
            }
            s.retry = RetryState::default();
        })
        .await?;
        self.inner.credentials.set_backup_password(secret).await?;
        self.inner.state.transition(BackupState::UpToDate);

        info!("Wallet restored from backup ({} files)", report.files_restored);
        Ok(report)
    }

    /// Disable backups and delete every artifact.
    ///
    /// Waits for an in-flight operation. Local state is always cleared; a
    /// failure to delete remote artifacts is returned afterwards.
    pub async fn disable_and_wipe(&self) -> Result<()> {
        let _guard = self.inner.run_lock.lock().await;
        self.inner.scheduler.cancel().await;

        let deleted = self.inner.storage.delete_all().await;
        if let Err(e) = &deleted {
            warn!("Failed to delete backups: {}", e);
        }

        self.inner.settings.save(&BackupSettings::default()).await?;
        self.inner.credentials.set_backup_password(None).await?;
        if let Err(e) = self.inner.storage.sign_out().await {
            warn!("Failed to sign out of backup storage: {}", e);
        }
        self.inner.dirty.store(false, Ordering::SeqCst);
        self.inner.state.transition(BackupState::Disabled);

        info!("Wallet backups disabled");
        deleted
    }
}

impl CoordinatorInner {
    async fn execute_backup(
        &self,
        _guard: MutexGuard<'_, ()>,
        is_initial: bool,
        secret: Option<BackupSecret>,
    ) -> BackupOutcome {
        match self.run_backup(is_initial, secret).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("Backup bookkeeping failed: {}", e);
                self.state.transition(BackupState::Failed(Some(e.clone())));
                BackupOutcome::Failed(e)
            }
        }
    }

    async fn run_backup(&self, is_initial: bool, secret: Option<BackupSecret>) -> Result<BackupOutcome> {
        let current = self.state.current();
        if !current.can_start_backup() {
            debug!("Backup skipped in state {}", current);
            return Ok(BackupOutcome::Skipped);
        }
        if !is_initial && !self.settings.load().await?.backup_enabled {
            debug!("Backup skipped, backups are disabled");
            return Ok(BackupOutcome::Skipped);
        }

        self.scheduler.cancel().await;
        let settings = update_settings(self.settings.as_ref(), |s| {
            s.retry.scheduled_at = None;
            s.retry.attempt_count += 1;
        })
        .await?;
        let attempt = settings.retry.attempt_count;
        self.dirty.store(false, Ordering::SeqCst);
        self.state.transition(BackupState::InProgress);
        info!("Backup started (attempt {}, initial: {})", attempt, is_initial);

        let started = Instant::now();
        let explicit_secret = secret.is_some();
        let secret = match secret {
            Some(secret) => Some(secret),
            None => self.credentials.backup_password().await?,
        };

        match self.build_and_upload(secret.as_ref()).await {
            Ok((created_at, encrypted)) => {
                self.metrics.write().await.record_backup(
                    &BackupRunResult::Completed {
                        created_at,
                        encrypted,
                    },
                    started.elapsed(),
                );

                let location = self.storage.location();
                update_settings(self.settings.as_ref(), |s| {
                    s.last_successful_backup_at = Some(created_at);
                    s.retry = RetryState::default();
                    if location.is_some() {
                        s.storage_location = location;
                    }
                })
                .await?;
                if explicit_secret {
                    self.credentials.set_backup_password(secret).await?;
                }

                self.state.transition(BackupState::UpToDate);
                info!("Backup completed ({})", created_at);

                if self.dirty.swap(false, Ordering::SeqCst) {
                    self.scheduler.schedule(None, true).await?;
                }
                Ok(BackupOutcome::Completed { created_at })
            }
            Err(e) => {
                self.metrics.write().await.record_backup(
                    &BackupRunResult::Failed {
                        category: e.category(),
                    },
                    started.elapsed(),
                );

                if is_initial || !e.is_retryable() || attempt > self.max_retries {
                    error!("Backup failed (attempt {}): {}", attempt, e);
                    let revoked = matches!(e, BackupError::StorageAuthRevoked);
                    update_settings(self.settings.as_ref(), |s| {
                        s.retry.last_failure_at = Some(Utc::now());
                        s.retry.scheduled_at = None;
                        if revoked {
                            s.backup_enabled = false;
                        }
                    })
                    .await?;
                    if revoked {
                        self.turn_off_after_revocation().await?;
                    }
                    self.state.transition(BackupState::Failed(Some(e.clone())));
                    Ok(BackupOutcome::Failed(e))
                } else {
                    warn!("Backup failed (attempt {}), retrying: {}", attempt, e);
                    let due_at = self.scheduler.schedule(Some(self.retry_delay), false).await?;
                    if due_at.is_none() {
                        // A timer armed elsewhere will retry, but InProgress must not linger.
                        self.state.transition(BackupState::Failed(Some(e)));
                    }
                    Ok(BackupOutcome::RetryScheduled { due_at })
                }
            }
        }
    }

    /// Storage access is gone: forget the password and sign out, leaving
    /// backups disabled until the user enables them again.
    async fn turn_off_after_revocation(&self) -> Result<()> {
        warn!("Backup storage access was revoked, disabling backups");
        self.credentials.set_backup_password(None).await?;
        if let Err(e) = self.storage.sign_out().await {
            warn!("Failed to sign out of backup storage: {}", e);
        }
        Ok(())
    }

    async fn build_and_upload(&self, secret: Option<&BackupSecret>) -> Result<(DateTime<Utc>, bool)> {
        let scratch = self.scratch()?;
        let artifact = self.builder.build(scratch.path(), secret).await?;
        let created_at = self.storage.upload(&artifact).await?;
        Ok((created_at, artifact.is_encrypted))
    }

    async fn download_and_restore(&self, secret: Option<&BackupSecret>) -> Result<RestoreReport> {
        let scratch = self.scratch()?;
        let source = self.storage.download_latest(&scratch.path().join("download")).await?;
        let report = self.restorer.restore(&source, scratch.path(), secret).await?;
        self.wallet.reload_after_restore().await?;
        Ok(report)
    }

    fn scratch(&self) -> Result<tempfile::TempDir> {
        std::fs::create_dir_all(&self.scratch_dir)
            .and_then(|_| {
                tempfile::Builder::new()
                    .prefix("wallet-backup-")
                    .tempdir_in(&self.scratch_dir)
            })
            .map_err(|e| {
                BackupError::BuildInterrupted(format!(
                    "Failed to create scratch directory in {}: {}",
                    self.scratch_dir.display(),
                    e
                ))
            })
    }
}

#[async_trait]
impl ScheduledBackupTask for CoordinatorInner {
    async fn run_scheduled_backup(&self) {
        // Wait out a storage check instead of dropping the scheduled run.
        let guard = self.run_lock.lock().await;
        let outcome = self.execute_backup(guard, false, None).await;
        debug!("Scheduled backup finished: {:?}", outcome);
    }
}
