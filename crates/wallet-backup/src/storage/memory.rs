/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! In-process storage backend
//!
//! Keeps artifacts in memory and lets callers inject failures. Used by the
//! test suites and by embedders that want to exercise the backup flow without
//! touching real storage.

use super::StorageBackend;
use crate::{
    backup::ArtifactDescriptor,
    error::{BackupError, Result},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::atomic::{AtomicBool, AtomicU32, Ordering},
    time::Duration,
};
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Debug, Clone)]
struct StoredArtifact {
    name: String,
    data: Vec<u8>,
}

#[derive(Debug, Clone)]
enum UploadFailure {
    Next(u32, BackupError),
    Always(BackupError),
}

#[derive(Debug, Default)]
struct Faults {
    upload: Option<UploadFailure>,
    setup: Option<BackupError>,
    upload_delay: Option<Duration>,
}

#[derive(Debug, Default)]
pub struct MemoryStorageBackend {
    artifacts: RwLock<BTreeMap<DateTime<Utc>, StoredArtifact>>,
    faults: RwLock<Faults>,
    upload_attempts: AtomicU32,
    setup_calls: AtomicU32,
    signed_out: AtomicBool,
}

impl MemoryStorageBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` uploads with `error`.
    pub async fn fail_next_uploads(&self, count: u32, error: BackupError) {
        self.faults.write().await.upload = Some(UploadFailure::Next(count, error));
    }

    /// Fail every upload with `error` until [`clear_failures`](Self::clear_failures).
    pub async fn fail_all_uploads(&self, error: BackupError) {
        self.faults.write().await.upload = Some(UploadFailure::Always(error));
    }

    pub async fn fail_setup(&self, error: BackupError) {
        self.faults.write().await.setup = Some(error);
    }

    /// Hold every upload for `delay` before storing it.
    pub async fn delay_uploads(&self, delay: Duration) {
        self.faults.write().await.upload_delay = Some(delay);
    }

    pub async fn clear_failures(&self) {
        *self.faults.write().await = Faults::default();
    }

    /// Drop an artifact behind the coordinator's back.
    pub async fn remove_artifact(&self, created_at: DateTime<Utc>) -> bool {
        self.artifacts.write().await.remove(&created_at).is_some()
    }

    pub async fn artifact_names(&self) -> Vec<String> {
        self.artifacts
            .read()
            .await
            .values()
            .map(|artifact| artifact.name.clone())
            .collect()
    }

    pub fn upload_attempts(&self) -> u32 {
        self.upload_attempts.load(Ordering::SeqCst)
    }

    pub fn setup_calls(&self) -> u32 {
        self.setup_calls.load(Ordering::SeqCst)
    }

    pub fn is_signed_out(&self) -> bool {
        self.signed_out.load(Ordering::SeqCst)
    }

    async fn take_upload_failure(&self) -> Option<BackupError> {
        let mut faults = self.faults.write().await;
        match faults.upload.take() {
            Some(UploadFailure::Always(error)) => {
                faults.upload = Some(UploadFailure::Always(error.clone()));
                Some(error)
            }
            Some(UploadFailure::Next(count, error)) if count > 0 => {
                if count > 1 {
                    faults.upload = Some(UploadFailure::Next(count - 1, error.clone()));
                }
                Some(error)
            }
            _ => None,
        }
    }
}

#[async_trait]
impl StorageBackend for MemoryStorageBackend {
    async fn setup(&self) -> Result<()> {
        self.setup_calls.fetch_add(1, Ordering::SeqCst);
        self.signed_out.store(false, Ordering::SeqCst);
        match self.faults.read().await.setup.clone() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn upload(&self, artifact: &ArtifactDescriptor) -> Result<DateTime<Utc>> {
        self.upload_attempts.fetch_add(1, Ordering::SeqCst);
        let delay = self.faults.read().await.upload_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = self.take_upload_failure().await {
            debug!("Injected upload failure: {}", error);
            return Err(error);
        }

        let name = artifact.file_name()?;
        let data = tokio::fs::read(&artifact.path).await?;
        let mut artifacts = self.artifacts.write().await;
        artifacts.retain(|timestamp, _| *timestamp >= artifact.created_at);
        artifacts.insert(artifact.created_at, StoredArtifact { name, data });
        Ok(artifact.created_at)
    }

    async fn has_artifact_for(&self, created_at: DateTime<Utc>) -> Result<bool> {
        Ok(self.artifacts.read().await.contains_key(&created_at))
    }

    async fn download_latest(&self, destination: &Path) -> Result<PathBuf> {
        let latest = self
            .artifacts
            .read()
            .await
            .values()
            .next_back()
            .cloned()
            .ok_or_else(|| BackupError::StorageTampered("Backup file not found in storage.".to_string()))?;

        tokio::fs::create_dir_all(destination).await?;
        let target = destination.join(&latest.name);
        tokio::fs::write(&target, &latest.data).await?;
        Ok(target)
    }

    async fn delete_all(&self) -> Result<()> {
        self.artifacts.write().await.clear();
        Ok(())
    }

    async fn sign_out(&self) -> Result<()> {
        self.signed_out.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn location(&self) -> Option<String> {
        Some("memory".to_string())
    }
}
