/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Storage backend abstraction for backups

pub mod memory;

pub use memory::MemoryStorageBackend;

use crate::{
    backup::ArtifactDescriptor,
    error::{BackupError, Result},
    naming::NamingPolicy,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::{
    fs::File,
    io::{self, BufReader},
    path::{Path, PathBuf},
    sync::Arc,
    time::SystemTime,
};
use tracing::{debug, info, warn};

/// Storage backend trait for backup storage
#[async_trait]
pub trait StorageBackend: Send + Sync + std::fmt::Debug {
    /// Prepare the backend for use. Errors here are surfaced to the user and
    /// never retried.
    async fn setup(&self) -> Result<()>;

    /// Store the artifact, returning the creation timestamp it was filed
    /// under.
    async fn upload(&self, artifact: &ArtifactDescriptor) -> Result<DateTime<Utc>>;

    /// Whether an artifact created at `created_at` is still present.
    async fn has_artifact_for(&self, created_at: DateTime<Utc>) -> Result<bool>;

    /// Copy the newest artifact into `destination` and return its path.
    async fn download_latest(&self, destination: &Path) -> Result<PathBuf>;

    /// Delete every artifact belonging to this wallet.
    async fn delete_all(&self) -> Result<()>;

    /// Release credentials held for the backend.
    async fn sign_out(&self) -> Result<()>;

    /// Human readable location persisted as the storage location.
    fn location(&self) -> Option<String> {
        None
    }
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub backend_type: StorageBackendType,
    pub local: Option<LocalStorageConfig>,
}

/// Type of storage backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackendType {
    Local,
    Memory,
}

/// Local storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalStorageConfig {
    pub path: PathBuf,
    pub create_directories: bool,
}

/// Create a storage backend from configuration
pub fn create_backend(config: &StorageConfig, naming: NamingPolicy) -> Result<Arc<dyn StorageBackend>> {
    match config.backend_type {
        StorageBackendType::Local => {
            let local_config = config
                .local
                .as_ref()
                .ok_or_else(|| BackupError::Config("Missing local storage config".to_string()))?;
            Ok(Arc::new(LocalStorageBackend::new(local_config, naming)))
        }
        StorageBackendType::Memory => Ok(Arc::new(MemoryStorageBackend::new())),
    }
}

/// Backups kept in a folder on the local file system or a mounted share.
///
/// Only files whose names match the naming policy are considered artifacts;
/// anything else in the folder is left untouched.
#[derive(Debug)]
pub struct LocalStorageBackend {
    config: LocalStorageConfig,
    naming: NamingPolicy,
}

impl LocalStorageBackend {
    pub fn new(config: &LocalStorageConfig, naming: NamingPolicy) -> Self {
        Self {
            config: config.clone(),
            naming,
        }
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    async fn ensure_folder(&self) -> Result<()> {
        match tokio::fs::metadata(&self.config.path).await {
            Ok(metadata) if metadata.is_dir() => Ok(()),
            Ok(_) => Err(BackupError::StorageSetupFailed(format!(
                "{} is not a directory",
                self.config.path.display()
            ))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(BackupError::StorageSetupFailed(
                format!("Backup folder {} does not exist", self.config.path.display()),
            )),
            Err(e) => Err(BackupError::Storage(format!(
                "Backup folder {} is not accessible: {}",
                self.config.path.display(),
                e
            ))),
        }
    }

    /// Artifacts in the folder with their parsed timestamps.
    async fn artifacts(&self) -> Result<Vec<(DateTime<Utc>, PathBuf)>> {
        self.ensure_folder().await?;
        let mut entries = tokio::fs::read_dir(&self.config.path).await?;
        let mut artifacts = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let name = entry.file_name();
            if let Some(created_at) = name.to_str().and_then(|name| self.naming.parse(name)) {
                artifacts.push((created_at, entry.path()));
            }
        }
        Ok(artifacts)
    }

    /// Remove every artifact superseded by `keep`: older ones, and other
    /// artifacts created in the same second.
    async fn prune_superseded(&self, keep: &Path, created_at: DateTime<Utc>) -> Result<usize> {
        let mut removed = 0;
        for (timestamp, path) in self.artifacts().await? {
            if timestamp < created_at || (timestamp == created_at && path != keep) {
                match tokio::fs::remove_file(&path).await {
                    Ok(()) => removed += 1,
                    Err(e) => warn!("Failed to remove old backup {}: {}", path.display(), e),
                }
            }
        }
        Ok(removed)
    }

    async fn copy_verified(&self, source: &Path, partial: &Path, target: &Path) -> Result<()> {
        tokio::fs::copy(source, partial)
            .await
            .map_err(|e| BackupError::Storage(format!("Failed to copy backup: {}", e)))?;

        let (expected, actual) = tokio::try_join!(
            sha256_file(source.to_path_buf()),
            sha256_file(partial.to_path_buf())
        )?;
        if expected != actual {
            return Err(BackupError::Storage(format!(
                "Checksum mismatch after copying {}",
                source.display()
            )));
        }
        tokio::fs::rename(partial, target).await?;
        Ok(())
    }
}

async fn discard_partial(partial: &Path) {
    match tokio::fs::remove_file(partial).await {
        Ok(()) => debug!("Removed incomplete upload {}", partial.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove incomplete upload {}: {}", partial.display(), e),
    }
}

#[async_trait]
impl StorageBackend for LocalStorageBackend {
    async fn setup(&self) -> Result<()> {
        if self.config.create_directories {
            tokio::fs::create_dir_all(&self.config.path).await.map_err(|e| {
                BackupError::StorageSetupFailed(format!("{}: {}", self.config.path.display(), e))
            })?;
        }
        self.ensure_folder().await?;
        info!("Backup folder ready at {}", self.config.path.display());
        Ok(())
    }

    async fn upload(&self, artifact: &ArtifactDescriptor) -> Result<DateTime<Utc>> {
        self.ensure_folder().await?;
        let name = artifact.file_name()?;
        let target = self.config.path.join(&name);
        let partial = self.config.path.join(format!(".{}.partial", name));

        if let Err(e) = self.copy_verified(&artifact.path, &partial, &target).await {
            discard_partial(&partial).await;
            return Err(e);
        }

        let removed = self.prune_superseded(&target, artifact.created_at).await?;
        info!(
            "Backup {} stored in {} ({} older removed)",
            name,
            self.config.path.display(),
            removed
        );
        Ok(artifact.created_at)
    }

    async fn has_artifact_for(&self, created_at: DateTime<Utc>) -> Result<bool> {
        Ok(self
            .artifacts()
            .await?
            .iter()
            .any(|(timestamp, _)| *timestamp == created_at))
    }

    async fn download_latest(&self, destination: &Path) -> Result<PathBuf> {
        // Same-second artifacts are ordered by modification time, then name.
        let mut latest: Option<(DateTime<Utc>, SystemTime, PathBuf)> = None;
        for (timestamp, path) in self.artifacts().await? {
            let modified = tokio::fs::metadata(&path)
                .await
                .and_then(|metadata| metadata.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            let candidate = (timestamp, modified, path);
            if latest.as_ref().map_or(true, |current| candidate > *current) {
                latest = Some(candidate);
            }
        }
        let (_, _, source) = latest
            .ok_or_else(|| BackupError::StorageTampered("Backup file not found in folder.".to_string()))?;

        let file_name = source
            .file_name()
            .ok_or_else(|| BackupError::Storage(format!("Invalid backup path {}", source.display())))?;
        tokio::fs::create_dir_all(destination).await?;
        let target = destination.join(file_name);
        tokio::fs::copy(&source, &target).await?;
        debug!("Downloaded {} to {}", source.display(), target.display());
        Ok(target)
    }

    async fn delete_all(&self) -> Result<()> {
        let artifacts = match self.artifacts().await {
            Ok(artifacts) => artifacts,
            Err(BackupError::StorageSetupFailed(reason)) => {
                debug!("Nothing to delete: {}", reason);
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        for (_, path) in &artifacts {
            tokio::fs::remove_file(path).await?;
        }
        info!("Deleted {} backups from {}", artifacts.len(), self.config.path.display());
        Ok(())
    }

    async fn sign_out(&self) -> Result<()> {
        debug!("Local backup folder has no credentials to release");
        Ok(())
    }

    fn location(&self) -> Option<String> {
        Some(self.config.path.display().to_string())
    }
}

async fn sha256_file(path: PathBuf) -> Result<[u8; 32]> {
    tokio::task::spawn_blocking(move || -> Result<[u8; 32]> {
        let mut reader = BufReader::new(File::open(&path)?);
        let mut hasher = Sha256::new();
        io::copy(&mut reader, &mut hasher)?;
        Ok(hasher.finalize().into())
    })
    .await?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::naming::NamingConfig;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn backend(path: &Path) -> LocalStorageBackend {
        LocalStorageBackend::new(
            &LocalStorageConfig {
                path: path.to_path_buf(),
                create_directories: true,
            },
            NamingPolicy::new(&NamingConfig::default()).unwrap(),
        )
    }

    fn artifact(dir: &Path, created_at: DateTime<Utc>, data: &[u8]) -> ArtifactDescriptor {
        let naming = NamingPolicy::new(&NamingConfig::default()).unwrap();
        let path = dir.join(naming.format(created_at, "zip"));
        std::fs::write(&path, data).unwrap();
        ArtifactDescriptor {
            path,
            created_at,
            mime_type: "application/zip".to_string(),
            is_encrypted: false,
        }
    }

    #[tokio::test]
    async fn test_upload_prunes_older_backups() {
        let scratch = TempDir::new().unwrap();
        let folder = TempDir::new().unwrap();
        let storage = backend(folder.path());
        storage.setup().await.unwrap();
        std::fs::write(folder.path().join("notes.txt"), b"keep me").unwrap();

        let first = Utc.with_ymd_and_hms(2024, 1, 5, 10, 30, 0).unwrap();
        let second = Utc.with_ymd_and_hms(2024, 1, 5, 10, 35, 0).unwrap();
        assert_eq!(storage.upload(&artifact(scratch.path(), first, b"one")).await.unwrap(), first);
        assert!(storage.has_artifact_for(first).await.unwrap());

        storage.upload(&artifact(scratch.path(), second, b"two")).await.unwrap();
        assert!(!storage.has_artifact_for(first).await.unwrap());
        assert!(storage.has_artifact_for(second).await.unwrap());
        assert!(folder.path().join("notes.txt").exists());

        let download = TempDir::new().unwrap();
        let latest = storage.download_latest(download.path()).await.unwrap();
        assert_eq!(
            latest.file_name().unwrap().to_str().unwrap(),
            "Wallet-Backup-2024-01-05_10-35-00.zip"
        );
        assert_eq!(std::fs::read(latest).unwrap(), b"two");
    }

    #[tokio::test]
    async fn test_same_second_upload_replaces_previous_artifact() {
        let scratch = TempDir::new().unwrap();
        let folder = TempDir::new().unwrap();
        let storage = backend(folder.path());
        storage.setup().await.unwrap();

        let created_at = Utc.with_ymd_and_hms(2024, 1, 5, 10, 30, 0).unwrap();
        storage.upload(&artifact(scratch.path(), created_at, b"plain")).await.unwrap();

        let naming = NamingPolicy::new(&NamingConfig::default()).unwrap();
        let sealed_path = scratch.path().join(naming.format(created_at, "enc"));
        std::fs::write(&sealed_path, b"sealed").unwrap();
        storage
            .upload(&ArtifactDescriptor {
                path: sealed_path,
                created_at,
                mime_type: "application/x-binary".to_string(),
                is_encrypted: true,
            })
            .await
            .unwrap();

        let names: Vec<String> = std::fs::read_dir(folder.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["Wallet-Backup-2024-01-05_10-30-00.enc".to_string()]);

        let download = TempDir::new().unwrap();
        let latest = storage.download_latest(download.path()).await.unwrap();
        assert_eq!(std::fs::read(latest).unwrap(), b"sealed");
    }

    #[tokio::test]
    async fn test_failed_upload_leaves_no_partial_file() {
        let scratch = TempDir::new().unwrap();
        let folder = TempDir::new().unwrap();
        let storage = backend(folder.path());
        storage.setup().await.unwrap();

        let created_at = Utc.with_ymd_and_hms(2024, 1, 5, 10, 30, 0).unwrap();
        let descriptor = artifact(scratch.path(), created_at, b"data");
        let partial = folder
            .path()
            .join(format!(".{}.partial", descriptor.file_name().unwrap()));
        std::fs::write(&partial, b"left over from an interrupted upload").unwrap();
        std::fs::remove_file(&descriptor.path).unwrap();

        assert!(matches!(
            storage.upload(&descriptor).await,
            Err(BackupError::Storage(_))
        ));
        assert!(!partial.exists());
        assert!(!storage.has_artifact_for(created_at).await.unwrap());
    }

    #[tokio::test]
    async fn test_download_from_empty_folder() {
        let folder = TempDir::new().unwrap();
        let storage = backend(folder.path());
        storage.setup().await.unwrap();
        std::fs::write(folder.path().join("unrelated.zip"), b"x").unwrap();

        let download = TempDir::new().unwrap();
        assert!(matches!(
            storage.download_latest(download.path()).await,
            Err(BackupError::StorageTampered(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_all_only_touches_backups() {
        let scratch = TempDir::new().unwrap();
        let folder = TempDir::new().unwrap();
        let storage = backend(folder.path());
        storage.setup().await.unwrap();
        std::fs::write(folder.path().join("notes.txt"), b"keep me").unwrap();
        let created_at = Utc.with_ymd_and_hms(2024, 1, 5, 10, 30, 0).unwrap();
        storage.upload(&artifact(scratch.path(), created_at, b"one")).await.unwrap();

        storage.delete_all().await.unwrap();
        assert!(!storage.has_artifact_for(created_at).await.unwrap());
        assert!(folder.path().join("notes.txt").exists());
    }

    #[tokio::test]
    async fn test_setup_without_create_directories() {
        let folder = TempDir::new().unwrap();
        let storage = LocalStorageBackend::new(
            &LocalStorageConfig {
                path: folder.path().join("missing"),
                create_directories: false,
            },
            NamingPolicy::new(&NamingConfig::default()).unwrap(),
        );
        assert!(matches!(
            storage.setup().await,
            Err(BackupError::StorageSetupFailed(_))
        ));
    }
}
