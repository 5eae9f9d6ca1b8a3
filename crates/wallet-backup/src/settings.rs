/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Persisted backup settings

use crate::error::{BackupError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::debug;

/// Backup settings surviving restarts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupSettings {
    pub backup_enabled: bool,
    pub last_successful_backup_at: Option<DateTime<Utc>>,
    pub storage_location: Option<String>,
    pub retry: RetryState,
}

/// Retry bookkeeping for scheduled runs.
///
/// `last_failure_at` doubles as the failure marker: while set, startup
/// reconciliation reports `Failed`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryState {
    pub attempt_count: u32,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
}

impl BackupSettings {
    pub fn has_failure_marker(&self) -> bool {
        self.retry.last_failure_at.is_some()
    }
}

/// Key/value settings persistence.
#[async_trait]
pub trait SettingsStore: Send + Sync + std::fmt::Debug {
    async fn load(&self) -> Result<BackupSettings>;

    async fn save(&self, settings: &BackupSettings) -> Result<()>;
}

/// Load, mutate and save in one step.
pub async fn update_settings<F>(store: &dyn SettingsStore, f: F) -> Result<BackupSettings>
where
    F: FnOnce(&mut BackupSettings) + Send,
{
    let mut settings = store.load().await?;
    f(&mut settings);
    store.save(&settings).await?;
    Ok(settings)
}

/// Settings stored as a JSON document.
///
/// A missing file reads as the defaults. Writes go to a sibling temporary
/// file which is then renamed over the target.
#[derive(Debug)]
pub struct JsonSettingsStore {
    path: PathBuf,
    lock: RwLock<()>,
}

impl JsonSettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: RwLock::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl SettingsStore for JsonSettingsStore {
    async fn load(&self) -> Result<BackupSettings> {
        let _guard = self.lock.read().await;
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BackupSettings::default()),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, settings: &BackupSettings) -> Result<()> {
        let _guard = self.lock.write().await;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let file_name = self
            .path
            .file_name()
            .ok_or_else(|| BackupError::Config(format!("Invalid settings path: {}", self.path.display())))?;
        let mut tmp_name = file_name.to_os_string();
        tmp_name.push(".tmp");
        let tmp_path = self.path.with_file_name(tmp_name);

        tokio::fs::write(&tmp_path, serde_json::to_vec_pretty(settings)?).await?;
        tokio::fs::rename(&tmp_path, &self.path).await?;
        debug!("Backup settings saved to {}", self.path.display());
        Ok(())
    }
}

/// Process-local settings.
#[derive(Debug, Default)]
pub struct MemorySettingsStore {
    settings: RwLock<BackupSettings>,
}

impl MemorySettingsStore {
    pub fn new(settings: BackupSettings) -> Self {
        Self {
            settings: RwLock::new(settings),
        }
    }
}

#[async_trait]
impl SettingsStore for MemorySettingsStore {
    async fn load(&self) -> Result<BackupSettings> {
        Ok(self.settings.read().await.clone())
    }

    async fn save(&self, settings: &BackupSettings) -> Result<()> {
        *self.settings.write().await = settings.clone();
        Ok(())
    }
}
